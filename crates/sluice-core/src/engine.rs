use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;
use crate::trace::RawTrace;

/// The trace stream of one engine execution.
pub type TraceStream = Pin<Box<dyn Stream<Item = Result<RawTrace, EngineError>> + Send>>;

/// What the engine is asked to compute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub pipeline: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The computation engine collaborator.
///
/// `observe` starts one execution and yields its trace records. The final
/// value is never fetched separately; it is reconstructed from the root
/// completion record in the stream, so calling `observe` once means the
/// computation runs once.
#[async_trait]
pub trait ComputationEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn observe(&self, request: &EngineRequest) -> Result<TraceStream, EngineError>;
}
