use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use sluice_core::{RecordError, RunInfo, RunMetrics, RunRecorder};

use crate::database::Database;
use crate::error::StoreError;
use crate::runs::RunRepo;

/// [`RunRecorder`] backed by the `runs` table. SQLite calls run on the
/// blocking pool so a slow disk never stalls the runner's task.
#[derive(Clone)]
pub struct SqliteRecorder {
    repo: Arc<RunRepo>,
}

impl SqliteRecorder {
    pub fn new(db: Database) -> Self {
        Self { repo: Arc::new(RunRepo::new(db)) }
    }

    pub fn repo(&self) -> &RunRepo {
        &self.repo
    }

    async fn blocking<F>(&self, f: F) -> Result<(), RecordError>
    where
        F: FnOnce(&RunRepo) -> Result<(), StoreError> + Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || f(repo.as_ref()))
            .await
            .map_err(|e| RecordError(format!("store task failed: {e}")))?
            .map_err(|e| RecordError(e.to_string()))
    }
}

#[async_trait]
impl RunRecorder for SqliteRecorder {
    async fn run_started(&self, run: &RunInfo) -> Result<(), RecordError> {
        let run = run.clone();
        self.blocking(move |repo| repo.start(&run)).await
    }

    async fn record_result(&self, run: &RunInfo, result: &Value) -> Result<(), RecordError> {
        let run_id = run.run_id.clone();
        let result = result.clone();
        self.blocking(move |repo| repo.set_result(&run_id, &result)).await
    }

    async fn record_metrics(&self, run: &RunInfo, metrics: &RunMetrics) -> Result<(), RecordError> {
        let run_id = run.run_id.clone();
        let metrics = metrics.clone();
        self.blocking(move |repo| repo.set_metrics(&run_id, &metrics)).await
    }

    async fn record_failure(&self, run: &RunInfo, message: &str) -> Result<(), RecordError> {
        let run_id = run.run_id.clone();
        let message = message.to_string();
        self.blocking(move |repo| repo.set_failure(&run_id, &message)).await
    }

    async fn run_finished(&self, run: &RunInfo) -> Result<(), RecordError> {
        let run_id = run.run_id.clone();
        self.blocking(move |repo| repo.finish(&run_id)).await
    }
}
