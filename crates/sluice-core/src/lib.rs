//! Shared vocabulary for the sluice workspace: the closed event envelope
//! delivered to observers, the raw trace envelope read from the computation
//! engine, and the collaborator traits the runner is wired against.

pub mod engine;
pub mod errors;
pub mod events;
pub mod extract;
pub mod ids;
pub mod recorder;
pub mod trace;

pub use engine::{ComputationEngine, EngineRequest, TraceStream};
pub use errors::{EngineError, ExtractionError, RecordError};
pub use events::{SourceRef, StreamEvent};
pub use extract::{JsonFieldExtractor, PassThrough, ResultExtractor};
pub use ids::{JobKey, KeyScope, RunId};
pub use recorder::{NoopRecorder, RunInfo, RunMetrics, RunRecorder};
pub use trace::{RawTrace, TraceKind};
