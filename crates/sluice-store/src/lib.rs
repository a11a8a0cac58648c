//! SQLite persistence for run records.

pub mod database;
pub mod error;
pub mod recorder;
pub mod runs;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use recorder::SqliteRecorder;
pub use runs::{RunRepo, RunRow, RunStatus};
