//! HTTP surface of the hub: a resumable SSE stream per pipeline request,
//! a blocking invoke variant, and job/stats/health introspection.

pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod server;

pub use error::ApiError;
pub use handlers::{InvokeResponse, JobStatus, JOB_CREATED_HEADER, JOB_KEY_HEADER};
pub use pipeline::{Pipeline, PipelineRegistry, RunRequest};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
