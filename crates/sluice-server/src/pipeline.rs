//! Named pipelines: one engine, extractor and key scope each, sharing the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use sluice_core::{
    EngineError, JobKey, JsonFieldExtractor, KeyScope, PassThrough, ResultExtractor, RunId,
    RunInfo, RunRecorder,
};
use sluice_engine::{HttpEngine, JobRunner, TranslatorConfig};
use sluice_settings::PipelineSettings;
use sluice_telemetry::HubMetrics;

use crate::error::ApiError;

/// Body of the stream and invoke endpoints.
#[derive(Clone, Debug, Deserialize)]
pub struct RunRequest {
    pub input: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RunRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if !self.input.is_object() {
            return Err(ApiError::InvalidRequest("input must be a JSON object".into()));
        }
        if let Some(id) = &self.session_id {
            if id.trim().is_empty() {
                return Err(ApiError::InvalidRequest("session_id must not be blank".into()));
            }
        }
        Ok(())
    }
}

pub struct Pipeline {
    name: String,
    scope: KeyScope,
    runner: Arc<JobRunner>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, scope: KeyScope, runner: JobRunner) -> Self {
        Self {
            name: name.into(),
            scope,
            runner: Arc::new(runner),
        }
    }

    /// Build an HTTP-engine pipeline from its settings block.
    pub fn from_settings(
        settings: &PipelineSettings,
        recorder: Arc<dyn RunRecorder>,
        metrics: Arc<HubMetrics>,
        max_error_chars: usize,
    ) -> Result<Self, EngineError> {
        let engine = HttpEngine::new(settings.name.clone(), settings.engine_url.clone())?
            .with_idle_timeout(Duration::from_secs(settings.idle_timeout_secs));

        let extractor: Arc<dyn ResultExtractor> = match &settings.result_field {
            Some(field) => Arc::new(JsonFieldExtractor::new(field.clone())),
            None => Arc::new(PassThrough),
        };

        let translator = TranslatorConfig {
            label_key: settings.label_key.clone(),
            preview_chars: settings.preview_chars,
            max_sources: settings.max_sources,
        };

        let runner = JobRunner::new(Arc::new(engine), extractor, recorder, translator)
            .with_max_error_chars(max_error_chars)
            .with_metrics(metrics);

        Ok(Self::new(settings.name.clone(), settings.key_scope, runner))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Identity of the execution a request maps to. The run id is only used
    /// if this request ends up creating the job.
    pub fn run_info(&self, request: &RunRequest) -> RunInfo {
        let session_id = request.session_id.as_deref().map(str::trim);
        RunInfo {
            key: JobKey::derive(&self.name, &request.input, session_id, self.scope),
            run_id: RunId::new(),
            pipeline: self.name.clone(),
            session_id: session_id.map(str::to_string),
            input: request.input.clone(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("engine", &self.runner.engine().name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn with(mut self, pipeline: Pipeline) -> Self {
        self.insert(pipeline);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Pipeline names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
