use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use sluice_core::{ComputationEngine, EngineError, EngineRequest, RawTrace, TraceStream};

/// One pre-programmed step of a scripted execution.
#[derive(Clone, Debug)]
pub enum ScriptedStep {
    /// Yield a trace record.
    Trace(RawTrace),
    /// Sleep before the next step.
    Delay(Duration),
    /// Yield an error from the stream.
    Fail(EngineError),
}

/// Engine that replays a fixed script for deterministic tests.
///
/// Every call to `observe` replays the same script and bumps
/// [`observe_count`](Self::observe_count), which is how tests prove an
/// execution started only once.
pub struct ScriptedEngine {
    name: String,
    steps: Vec<ScriptedStep>,
    observe_error: Option<EngineError>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            name: "scripted".into(),
            steps,
            observe_error: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Convenience: a script of records with no delays.
    pub fn from_traces(traces: impl IntoIterator<Item = RawTrace>) -> Self {
        Self::new(traces.into_iter().map(ScriptedStep::Trace).collect())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make `observe` itself fail, before any record is produced.
    pub fn failing(mut self, error: EngineError) -> Self {
        self.observe_error = Some(error);
        self
    }

    pub fn observe_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe(&self, _request: &EngineRequest) -> Result<TraceStream, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.observe_error {
            return Err(err.clone());
        }

        let steps: VecDeque<ScriptedStep> = self.steps.iter().cloned().collect();
        Ok(Box::pin(stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    ScriptedStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptedStep::Trace(t) => return Some((Ok(t), steps)),
                    ScriptedStep::Fail(e) => return Some((Err(e), steps)),
                }
            }
        })))
    }
}
