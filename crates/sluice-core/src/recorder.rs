use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RecordError;
use crate::events::{SourceRef, StreamEvent};
use crate::ids::{JobKey, RunId};

/// Identity of one execution, handed to the recorder on every call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunInfo {
    pub key: JobKey,
    pub run_id: RunId,
    pub pipeline: String,
    pub session_id: Option<String>,
    pub input: Value,
}

/// Tool names containing "search" (any case) are treated as search tools.
pub fn is_search_tool(name: &str) -> bool {
    name.to_lowercase().contains("search")
}

/// Per-run counters, accumulated from the translated event stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub llm_calls: u32,
    pub search_calls: u32,
    pub sources: Vec<SourceRef>,
}

impl RunMetrics {
    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::LlmStart { .. } => self.llm_calls += 1,
            StreamEvent::ToolEnd { name, sources, .. } if is_search_tool(name) => {
                self.search_calls += 1;
                self.sources.extend(sources.iter().cloned());
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.llm_calls == 0 && self.search_calls == 0 && self.sources.is_empty()
    }
}

/// Persistence collaborator. Every call is best-effort: the runner logs and
/// discards errors, and nothing here can affect stream delivery.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn run_started(&self, run: &RunInfo) -> Result<(), RecordError>;
    async fn record_result(&self, run: &RunInfo, result: &Value) -> Result<(), RecordError>;
    async fn record_metrics(&self, run: &RunInfo, metrics: &RunMetrics) -> Result<(), RecordError>;
    async fn record_failure(&self, run: &RunInfo, message: &str) -> Result<(), RecordError>;
    async fn run_finished(&self, run: &RunInfo) -> Result<(), RecordError>;
}

/// Recorder used when persistence is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

#[async_trait]
impl RunRecorder for NoopRecorder {
    async fn run_started(&self, _run: &RunInfo) -> Result<(), RecordError> {
        Ok(())
    }

    async fn record_result(&self, _run: &RunInfo, _result: &Value) -> Result<(), RecordError> {
        Ok(())
    }

    async fn record_metrics(&self, _run: &RunInfo, _metrics: &RunMetrics) -> Result<(), RecordError> {
        Ok(())
    }

    async fn record_failure(&self, _run: &RunInfo, _message: &str) -> Result<(), RecordError> {
        Ok(())
    }

    async fn run_finished(&self, _run: &RunInfo) -> Result<(), RecordError> {
        Ok(())
    }
}
