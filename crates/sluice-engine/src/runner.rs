use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use sluice_core::{
    ComputationEngine, EngineError, EngineRequest, RecordError, ResultExtractor, RunInfo,
    RunMetrics, RunRecorder, StreamEvent,
};
use sluice_hub::{panic_message, Job, CANCELLED_MESSAGE};
use sluice_telemetry::{names, HubMetrics};

use crate::translate::{Translated, Translator, TranslatorConfig};
use crate::truncate::sanitize_error;

/// Drives one engine execution into one job.
///
/// The engine is only ever observed; the final value is rebuilt from the
/// root completion in the trace stream, so one `run` is one execution.
pub struct JobRunner {
    engine: Arc<dyn ComputationEngine>,
    extractor: Arc<dyn ResultExtractor>,
    recorder: Arc<dyn RunRecorder>,
    translator: TranslatorConfig,
    max_error_chars: usize,
    metrics: Option<Arc<HubMetrics>>,
}

/// How the trace stream ended.
enum Outcome {
    Completed(Option<Value>),
    Failed(EngineError),
    /// The hub is shutting down.
    Cancelled,
    /// The job was closed under us; stop quietly.
    Abandoned,
}

impl JobRunner {
    pub fn new(
        engine: Arc<dyn ComputationEngine>,
        extractor: Arc<dyn ResultExtractor>,
        recorder: Arc<dyn RunRecorder>,
        translator: TranslatorConfig,
    ) -> Self {
        Self {
            engine,
            extractor,
            recorder,
            translator,
            max_error_chars: 500,
            metrics: None,
        }
    }

    pub fn with_max_error_chars(mut self, max: usize) -> Self {
        self.max_error_chars = max;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn engine(&self) -> &Arc<dyn ComputationEngine> {
        &self.engine
    }

    #[instrument(skip_all, fields(job_key = %job.key(), run_id = %run.run_id, pipeline = %run.pipeline))]
    pub async fn run(&self, job: Arc<Job>, run: RunInfo) {
        info!(engine = self.engine.name(), "run started");
        self.best_effort("run_started", self.recorder.run_started(&run).await);

        let mut metrics = RunMetrics::default();
        let failure = match AssertUnwindSafe(self.execute(&job, &run, &mut metrics))
            .catch_unwind()
            .await
        {
            Ok(failure) => failure,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "run panicked");
                Some(sanitize_error(&format!("internal error: {message}"), self.max_error_chars))
            }
        };

        if !metrics.is_empty() {
            self.best_effort("record_metrics", self.recorder.record_metrics(&run, &metrics).await);
        }
        if let Some(message) = &failure {
            self.best_effort("record_failure", self.recorder.record_failure(&run, message).await);
        }
        self.best_effort("run_finished", self.recorder.run_finished(&run).await);

        let failed = failure.is_some();
        job.finish(failure);
        info!(
            failed,
            events = job.len(),
            llm_calls = metrics.llm_calls,
            search_calls = metrics.search_calls,
            "run finished"
        );
    }

    /// Drive the engine and deliver the result. Returns the terminal error,
    /// if any, for the recorder and the job.
    async fn execute(&self, job: &Job, run: &RunInfo, metrics: &mut RunMetrics) -> Option<String> {
        match self.drive(job, run, metrics).await {
            Outcome::Abandoned => None,
            Outcome::Cancelled => {
                info!("run cancelled by shutdown");
                Some(CANCELLED_MESSAGE.to_string())
            }
            Outcome::Failed(err) => {
                warn!(error = %err, kind = err.error_kind(), "engine failed");
                Some(sanitize_error(&err.to_string(), self.max_error_chars))
            }
            Outcome::Completed(completion) => {
                self.deliver_result(job, run, completion).await;
                None
            }
        }
    }

    async fn drive(&self, job: &Job, run: &RunInfo, metrics: &mut RunMetrics) -> Outcome {
        let request = EngineRequest {
            pipeline: run.pipeline.clone(),
            input: run.input.clone(),
            session_id: run.session_id.clone(),
        };

        let cancel = job.cancellation();
        let observed = tokio::select! {
            biased;
            () = cancel.cancelled() => return Outcome::Cancelled,
            observed = self.engine.observe(&request) => observed,
        };
        let mut stream = match observed {
            Ok(s) => s,
            Err(e) => return Outcome::Failed(e),
        };

        let mut translator = Translator::new(self.translator.clone());
        let mut completion = None;

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => return Outcome::Failed(e),
            };

            match translator.translate(&raw) {
                Translated::Event(event) => {
                    metrics.observe(&event);
                    if job.append(event).is_err() {
                        return Outcome::Abandoned;
                    }
                }
                Translated::Completion(output) => {
                    debug!("root completion observed");
                    completion = Some(output);
                }
                Translated::Failure(message) => return Outcome::Failed(EngineError::Raised(message)),
                Translated::Skip => {}
            }
        }

        Outcome::Completed(completion)
    }

    /// Shape the completion into a `result` event. Extraction failures are
    /// reported in-band and never retract streamed progress.
    async fn deliver_result(&self, job: &Job, run: &RunInfo, completion: Option<Value>) {
        let Some(output) = completion else {
            debug!("stream ended without a root completion");
            return;
        };

        match self.extractor.extract(&output) {
            Ok(Some(data)) => {
                if job.append(StreamEvent::Result { data: data.clone() }).is_err() {
                    debug!("job closed before the result was delivered");
                    return;
                }
                self.best_effort("record_result", self.recorder.record_result(run, &data).await);
            }
            Ok(None) => debug!("extractor produced no result"),
            Err(e) => {
                error!(error = %e, "result extraction failed");
                let message = sanitize_error(&e.to_string(), self.max_error_chars);
                self.best_effort("record_failure", self.recorder.record_failure(run, &message).await);
                if job.append(StreamEvent::Error { message }).is_err() {
                    debug!("job closed before the extraction error was delivered");
                }
            }
        }
    }

    fn best_effort(&self, op: &'static str, result: Result<(), RecordError>) {
        if let Err(e) = result {
            warn!(op, error = %e, "run recorder failed");
            if let Some(m) = &self.metrics {
                m.counter_inc(names::RECORD_FAILURES, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use sluice_core::{
        ExtractionError, JobKey, JsonFieldExtractor, NoopRecorder, PassThrough, RawTrace, RunId,
        SourceRef,
    };
    use sluice_hub::{RetentionPolicy, StreamHub};

    use crate::mock::{ScriptedEngine, ScriptedStep};

    fn run_info() -> RunInfo {
        RunInfo {
            key: JobKey::from_raw("p:test"),
            run_id: RunId::new(),
            pipeline: "p".into(),
            session_id: Some("s1".into()),
            input: json!({"q": "rust"}),
        }
    }

    fn runner(engine: ScriptedEngine) -> (Arc<ScriptedEngine>, JobRunner) {
        let engine = Arc::new(engine);
        let runner = JobRunner::new(
            engine.clone(),
            Arc::new(PassThrough),
            Arc::new(NoopRecorder),
            TranslatorConfig::default(),
        );
        (engine, runner)
    }

    async fn run_to_end(runner: &JobRunner) -> Vec<StreamEvent> {
        let job = Arc::new(Job::new(JobKey::from_raw("p:test")));
        runner.run(Arc::clone(&job), run_info()).await;
        job.snapshot().iter().map(|e| (**e).clone()).collect()
    }

    fn search_scenario() -> Vec<RawTrace> {
        vec![
            RawTrace::new("on_chain_start", "root").with_name("LangGraph"),
            RawTrace::new("on_tool_start", "t1")
                .with_name("search")
                .with_parents(["root"])
                .with_data(json!({"input": "rust"})),
            RawTrace::new("on_tool_end", "t1")
                .with_name("search")
                .with_parents(["root"])
                .with_data(json!({"output": "found ...https://example.com... here"})),
            RawTrace::new("on_chain_end", "root")
                .with_name("LangGraph")
                .with_data(json!({"output": {"ok": true}})),
        ]
    }

    #[tokio::test]
    async fn end_to_end_search_scenario() {
        let (engine, runner) = runner(ScriptedEngine::from_traces(search_scenario()));
        let events = run_to_end(&runner).await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type(), "tool_start");
        match &events[1] {
            StreamEvent::ToolEnd { sources, .. } => {
                assert_eq!(sources, &vec![SourceRef::url("https://example.com")]);
            }
            other => panic!("expected tool_end, got {other:?}"),
        }
        assert_eq!(events[2], StreamEvent::Result { data: json!({"ok": true}) });
        assert_eq!(events[3], StreamEvent::Done);
        assert_eq!(engine.observe_count(), 1);
    }

    #[tokio::test]
    async fn engine_failure_yields_one_error_then_done() {
        let (_, runner) = runner(ScriptedEngine::new(vec![
            ScriptedStep::Trace(
                RawTrace::new("on_chat_model_stream", "m")
                    .with_parents(["root"])
                    .with_data(json!({"chunk": "partial"})),
            ),
            ScriptedStep::Fail(EngineError::Raised("model\nexploded".into())),
            ScriptedStep::Trace(
                RawTrace::new("on_chat_model_stream", "m")
                    .with_parents(["root"])
                    .with_data(json!({"chunk": "never"})),
            ),
        ]));
        let events = run_to_end(&runner).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Token { task: None, content: "partial".into() },
                StreamEvent::Error { message: "model exploded".into() },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn in_band_error_record_fails_the_run() {
        let (_, runner) = runner(ScriptedEngine::from_traces([
            RawTrace::new("on_error", "root").with_data(json!({"error": "rate limited"})),
            RawTrace::new("on_chain_end", "root").with_data(json!({"output": {"ok": true}})),
        ]));
        let events = run_to_end(&runner).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error { message: "rate limited".into() }, StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn observe_failure_is_reported() {
        let (_, runner) = runner(
            ScriptedEngine::from_traces([]).failing(EngineError::Status { status: 502, body: "bad gateway".into() }),
        );
        let events = run_to_end(&runner).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("502")));
    }

    #[tokio::test]
    async fn error_message_is_bounded() {
        let (_, runner) = runner(ScriptedEngine::new(vec![ScriptedStep::Fail(EngineError::Raised(
            "x".repeat(2000),
        ))]));
        let events = run_to_end(&runner).await;
        match &events[0] {
            StreamEvent::Error { message } => assert_eq!(message.chars().count(), 500),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn extraction_failure_keeps_progress() {
        let engine = Arc::new(ScriptedEngine::from_traces(search_scenario()));
        let runner = JobRunner::new(
            engine,
            Arc::new(JsonFieldExtractor::required("final_report")),
            Arc::new(NoopRecorder),
            TranslatorConfig::default(),
        );
        let events = run_to_end(&runner).await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type(), "tool_start");
        assert_eq!(events[1].event_type(), "tool_end");
        assert!(matches!(&events[2], StreamEvent::Error { message } if message.contains("final_report")));
        assert!(events[3].is_done());
    }

    #[tokio::test]
    async fn no_completion_means_no_result() {
        let (_, runner) = runner(ScriptedEngine::from_traces([RawTrace::new("on_chat_model_stream", "m")
            .with_parents(["root"])
            .with_data(json!({"chunk": "hi"}))]));
        let events = run_to_end(&runner).await;
        assert_eq!(
            events,
            vec![StreamEvent::Token { task: None, content: "hi".into() }, StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn custom_extractor_shapes_result() {
        let engine = Arc::new(ScriptedEngine::from_traces(search_scenario()));
        let extractor = |v: &Value| -> Result<Option<Value>, ExtractionError> {
            Ok(Some(json!({"wrapped": v})))
        };
        let runner = JobRunner::new(
            engine,
            Arc::new(extractor),
            Arc::new(NoopRecorder),
            TranslatorConfig::default(),
        );
        let events = run_to_end(&runner).await;
        assert_eq!(events[2], StreamEvent::Result { data: json!({"wrapped": {"ok": true}}) });
    }

    #[derive(Default)]
    struct CapturingRecorder {
        calls: Mutex<Vec<String>>,
        metrics: Mutex<Option<RunMetrics>>,
        fail: bool,
    }

    #[async_trait]
    impl RunRecorder for CapturingRecorder {
        async fn run_started(&self, _run: &RunInfo) -> Result<(), RecordError> {
            self.calls.lock().push("started".into());
            if self.fail {
                return Err(RecordError("db down".into()));
            }
            Ok(())
        }

        async fn record_result(&self, _run: &RunInfo, result: &Value) -> Result<(), RecordError> {
            self.calls.lock().push(format!("result:{result}"));
            if self.fail {
                return Err(RecordError("db down".into()));
            }
            Ok(())
        }

        async fn record_metrics(&self, _run: &RunInfo, metrics: &RunMetrics) -> Result<(), RecordError> {
            self.calls.lock().push("metrics".into());
            *self.metrics.lock() = Some(metrics.clone());
            if self.fail {
                return Err(RecordError("db down".into()));
            }
            Ok(())
        }

        async fn record_failure(&self, _run: &RunInfo, message: &str) -> Result<(), RecordError> {
            self.calls.lock().push(format!("failure:{message}"));
            Ok(())
        }

        async fn run_finished(&self, _run: &RunInfo) -> Result<(), RecordError> {
            self.calls.lock().push("finished".into());
            if self.fail {
                return Err(RecordError("db down".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn recorder_sees_result_and_metrics() {
        let recorder = Arc::new(CapturingRecorder::default());
        let mut traces = vec![RawTrace::new("on_chat_model_start", "m").with_parents(["root"])];
        traces.extend(search_scenario());
        let runner = JobRunner::new(
            Arc::new(ScriptedEngine::from_traces(traces)),
            Arc::new(PassThrough),
            recorder.clone(),
            TranslatorConfig::default(),
        );
        run_to_end(&runner).await;

        let calls = recorder.calls.lock().clone();
        assert_eq!(calls, vec!["started", r#"result:{"ok":true}"#, "metrics", "finished"]);
        let metrics = recorder.metrics.lock().clone().unwrap();
        assert_eq!(metrics.llm_calls, 1);
        assert_eq!(metrics.search_calls, 1);
        assert_eq!(metrics.sources, vec![SourceRef::url("https://example.com")]);
    }

    #[tokio::test]
    async fn recorder_failures_never_reach_observers() {
        let recorder = Arc::new(CapturingRecorder { fail: true, ..Default::default() });
        let hub_metrics = Arc::new(HubMetrics::new());
        let runner = JobRunner::new(
            Arc::new(ScriptedEngine::from_traces(search_scenario())),
            Arc::new(PassThrough),
            recorder,
            TranslatorConfig::default(),
        )
        .with_metrics(hub_metrics.clone());

        let events = run_to_end(&runner).await;
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.event_type() != "error"));
        assert_eq!(hub_metrics.counter_get(names::RECORD_FAILURES), 4);
    }

    #[tokio::test]
    async fn hub_runs_engine_once_for_concurrent_requests() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            ScriptedStep::Delay(Duration::from_millis(20)),
            ScriptedStep::Trace(
                RawTrace::new("on_chat_model_stream", "m")
                    .with_parents(["root"])
                    .with_data(json!({"chunk": "once"})),
            ),
            ScriptedStep::Trace(RawTrace::new("on_chain_end", "root").with_data(json!({"output": {"n": 1}}))),
        ]));
        let runner = Arc::new(JobRunner::new(
            engine.clone(),
            Arc::new(PassThrough),
            Arc::new(NoopRecorder),
            TranslatorConfig::default(),
        ));
        let hub = Arc::new(StreamHub::new(RetentionPolicy::default(), Arc::new(HubMetrics::new())));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hub = Arc::clone(&hub);
            let runner = Arc::clone(&runner);
            tasks.push(tokio::spawn(async move {
                let attached = hub
                    .get_or_create(JobKey::from_raw("p:same"), move |job| async move {
                        runner.run(job, run_info()).await;
                    })
                    .unwrap();
                attached
                    .job
                    .subscribe(0)
                    .map(|e| (*e).clone())
                    .collect::<Vec<_>>()
                    .await
            }));
        }

        let mut logs = Vec::new();
        for t in tasks {
            logs.push(t.await.unwrap());
        }
        assert_eq!(engine.observe_count(), 1);
        for log in &logs {
            assert_eq!(log, &logs[0]);
        }
        assert_eq!(
            logs[0],
            vec![
                StreamEvent::Token { task: None, content: "once".into() },
                StreamEvent::Result { data: json!({"n": 1}) },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn fan_out_tokens_reach_the_log_in_order_with_labels() {
        let delta = |run: &str, task: &str, s: &str| {
            RawTrace::new("on_chat_model_stream", run)
                .with_parents(["root", task])
                .with_data(json!({"chunk": {"content": s}}))
        };
        let (_, runner) = runner(ScriptedEngine::from_traces([
            RawTrace::new("on_chain_start", "root"),
            RawTrace::new("on_chain_start", "A").with_parents(["root"]).with_metadata("task", "A"),
            RawTrace::new("on_chain_start", "B").with_parents(["root"]).with_metadata("task", "B"),
            RawTrace::new("on_chat_model_start", "a1").with_parents(["root", "A"]),
            RawTrace::new("on_chat_model_start", "b1").with_parents(["root", "B"]),
            delta("a1", "A", "x"),
            delta("b1", "B", "y"),
            delta("a1", "A", "z"),
            delta("b1", "B", "w"),
            RawTrace::new("on_chain_end", "root").with_data(json!({"output": {"ok": true}})),
        ]));
        let events = run_to_end(&runner).await;

        let tokens: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { task, content } => Some((task.clone(), content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            tokens,
            vec![
                (Some("A".into()), "x".into()),
                (Some("B".into()), "y".into()),
                (Some("A".into()), "z".into()),
                (Some("B".into()), "w".into()),
            ]
        );
        assert_eq!(events[events.len() - 2], StreamEvent::Result { data: json!({"ok": true}) });
        assert!(events[events.len() - 1].is_done());
    }

    #[tokio::test]
    async fn shutdown_still_records_failure_and_finish() {
        let recorder = Arc::new(CapturingRecorder::default());
        let engine = Arc::new(ScriptedEngine::new(vec![
            ScriptedStep::Trace(RawTrace::new("on_chat_model_start", "m").with_parents(["root"])),
            ScriptedStep::Delay(Duration::from_secs(3600)),
            ScriptedStep::Trace(RawTrace::new("on_chain_end", "root").with_data(json!({"output": 1}))),
        ]));
        let runner = Arc::new(JobRunner::new(
            engine,
            Arc::new(PassThrough),
            recorder.clone(),
            TranslatorConfig::default(),
        ));
        let hub = StreamHub::new(RetentionPolicy::default(), Arc::new(HubMetrics::new()))
            .with_wind_down(Duration::from_secs(30));

        let attached = hub
            .get_or_create(JobKey::from_raw("p:slow"), move |job| async move {
                runner.run(job, run_info()).await;
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.shutdown(Duration::from_secs(5)).await);

        let calls = recorder.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "started".to_string(),
                "metrics".to_string(),
                format!("failure:{CANCELLED_MESSAGE}"),
                "finished".to_string(),
            ]
        );
        assert_eq!(recorder.metrics.lock().clone().unwrap().llm_calls, 1);

        let events = attached.job.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(*events[1], StreamEvent::Error { message: CANCELLED_MESSAGE.into() });
        assert!(events[2].is_done());
    }

    #[tokio::test]
    async fn panic_during_run_is_recorded_as_failure() {
        let recorder = Arc::new(CapturingRecorder::default());
        let extractor = |_: &Value| -> Result<Option<Value>, ExtractionError> { panic!("extractor blew up") };
        let runner = JobRunner::new(
            Arc::new(ScriptedEngine::from_traces(search_scenario())),
            Arc::new(extractor),
            recorder.clone(),
            TranslatorConfig::default(),
        );
        let events = run_to_end(&runner).await;

        assert_eq!(
            recorder.calls.lock().clone(),
            vec!["started", "metrics", "failure:internal error: extractor blew up", "finished"]
        );
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], StreamEvent::Error { message: "internal error: extractor blew up".into() });
        assert!(events[3].is_done());
    }

    #[tokio::test]
    async fn result_is_not_recorded_when_the_job_closed_first() {
        let recorder = Arc::new(CapturingRecorder::default());
        let job = Arc::new(Job::new(JobKey::from_raw("p:test")));
        let closer = Arc::clone(&job);
        let extractor = move |v: &Value| -> Result<Option<Value>, ExtractionError> {
            closer.finish(None);
            Ok(Some(v.clone()))
        };
        let runner = JobRunner::new(
            Arc::new(ScriptedEngine::from_traces(search_scenario())),
            Arc::new(extractor),
            recorder.clone(),
            TranslatorConfig::default(),
        );
        runner.run(Arc::clone(&job), run_info()).await;

        assert_eq!(recorder.calls.lock().clone(), vec!["started", "metrics", "finished"]);
        let types: Vec<_> = job.snapshot().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["tool_start", "tool_end", "done"]);
    }
}
