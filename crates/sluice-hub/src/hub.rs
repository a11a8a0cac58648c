use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use sluice_core::JobKey;
use sluice_telemetry::{names, HubMetrics};

use crate::error::HubError;
use crate::job::Job;

/// Terminal error written into jobs still running when the hub shuts down.
pub const CANCELLED_MESSAGE: &str = "execution cancelled: server shutting down";

const DEFAULT_WIND_DOWN: Duration = Duration::from_secs(2);

/// How long finished jobs stay replayable.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    /// Finished jobs older than this are evicted by the sweeper.
    pub finished_ttl: Duration,
    /// Upper bound on finished jobs held at once; the oldest go first.
    pub max_finished: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            finished_ttl: Duration::from_secs(3600),
            max_finished: 1024,
        }
    }
}

/// Result of [`StreamHub::get_or_create`].
#[derive(Clone, Debug)]
pub struct Attached {
    pub job: Arc<Job>,
    /// True only for the single caller whose runner was started.
    pub created: bool,
}

/// Registry from [`JobKey`] to [`Job`]; at most one runner per key.
pub struct StreamHub {
    jobs: Mutex<HashMap<JobKey, Arc<Job>>>,
    retention: RetentionPolicy,
    cancel: CancellationToken,
    tracker: TaskTracker,
    wind_down: Duration,
    metrics: Arc<HubMetrics>,
}

impl StreamHub {
    pub fn new(retention: RetentionPolicy, metrics: Arc<HubMetrics>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            wind_down: DEFAULT_WIND_DOWN,
            metrics,
        }
    }

    /// How long a cancelled runner may keep going before the hub closes its
    /// job with [`CANCELLED_MESSAGE`]. Keep it below the shutdown grace.
    pub fn with_wind_down(mut self, wind_down: Duration) -> Self {
        self.wind_down = wind_down;
        self
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Return the job for `key`, creating it and spawning `runner` if absent.
    ///
    /// Lookup, insertion and spawn happen in one critical section, so any
    /// number of concurrent callers with the same key start exactly one
    /// runner. The runner receives the job and is expected to finish it;
    /// if it returns without doing so, panics, or is cancelled by shutdown,
    /// the hub finishes the job itself.
    pub fn get_or_create<F, Fut>(&self, key: JobKey, runner: F) -> Result<Attached, HubError>
    where
        F: FnOnce(Arc<Job>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.jobs.lock();

        if let Some(job) = jobs.get(&key) {
            self.metrics.counter_inc(names::JOBS_ATTACHED, 1);
            debug!(job_key = %key, done = job.is_done(), "attached to existing job");
            return Ok(Attached { job: Arc::clone(job), created: false });
        }

        if self.cancel.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }

        let job = Arc::new(
            Job::new(key.clone())
                .with_metrics(Arc::clone(&self.metrics))
                .with_cancel(self.cancel.child_token()),
        );
        jobs.insert(key.clone(), Arc::clone(&job));
        self.spawn_runner(Arc::clone(&job), runner);
        drop(jobs);

        self.metrics.counter_inc(names::JOBS_CREATED, 1);
        info!(job_key = %key, "job created");
        Ok(Attached { job, created: true })
    }

    fn spawn_runner<F, Fut>(&self, job: Arc<Job>, runner: F)
    where
        F: FnOnce(Arc<Job>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wind_down = self.wind_down;
        let metrics = Arc::clone(&self.metrics);
        metrics.gauge_inc(names::JOBS_RUNNING, 1);

        self.tracker.spawn(async move {
            let cancel = job.cancellation().clone();
            let run = {
                let job = Arc::clone(&job);
                AssertUnwindSafe(async move { runner(job).await }).catch_unwind()
            };
            tokio::pin!(run);

            let outcome = tokio::select! {
                outcome = &mut run => Some(outcome),
                () = cancel.cancelled() => None,
            };
            // Cancelled runners get a short window to close out themselves.
            let outcome = match outcome {
                Some(outcome) => Some(outcome),
                None => tokio::time::timeout(wind_down, &mut run).await.ok(),
            };

            match outcome {
                Some(Ok(())) => {}
                Some(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    error!(job_key = %job.key(), panic = %message, "job runner panicked");
                    job.finish(Some(format!("internal error: {message}")));
                }
                None => {
                    if job.finish(Some(CANCELLED_MESSAGE.to_string())) {
                        warn!(job_key = %job.key(), "runner ignored cancellation; job closed by hub");
                    }
                }
            }

            if job.finish(None) {
                warn!(job_key = %job.key(), "runner returned without finishing its job");
            }
            if job.terminal_error().is_some() {
                metrics.counter_inc(names::JOBS_FAILED, 1);
            }
            metrics.gauge_inc(names::JOBS_RUNNING, -1);
        });
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<Job>> {
        self.jobs.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.jobs.lock().values().filter(|j| !j.is_done()).count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop finished jobs past their TTL, then the oldest finished jobs
    /// beyond the cap. Running jobs are never evicted. Returns how many
    /// jobs were removed.
    pub fn evict_finished(&self, now: Instant) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();

        jobs.retain(|_, job| match job.finished_at() {
            Some(at) => now.saturating_duration_since(at) < self.retention.finished_ttl,
            None => true,
        });

        let mut finished: Vec<(Instant, JobKey)> = jobs
            .iter()
            .filter_map(|(k, j)| j.finished_at().map(|at| (at, k.clone())))
            .collect();
        if finished.len() > self.retention.max_finished {
            finished.sort_by_key(|(at, _)| *at);
            let excess = finished.len() - self.retention.max_finished;
            for (_, key) in finished.into_iter().take(excess) {
                jobs.remove(&key);
            }
        }

        let removed = before - jobs.len();
        if removed > 0 {
            self.metrics.counter_inc(names::JOBS_EVICTED, removed as u64);
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        self.evict_finished(Instant::now())
    }

    /// Periodic eviction until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = hub.sweep();
                        if removed > 0 {
                            info!(removed, remaining = hub.len(), "finished job sweep");
                        }
                    }
                    () = hub.cancel.cancelled() => break,
                }
            }
        })
    }

    /// Refuse new keys, cancel running jobs, and wait up to `grace` for their
    /// runners to wind down. Returns whether every runner exited in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let running = self.running_count();
        info!(running, "stream hub shutting down");

        self.cancel.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    grace_secs = grace.as_secs(),
                    "runners still active after shutdown grace period"
                );
                false
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "runner panicked".to_string()
    }
}
