use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use sluice_core::{JobKey, StreamEvent};
use sluice_telemetry::{names, HubMetrics};

use crate::error::HubError;

/// Lazy, cursor-based view of a job's log. Ends after the `done` record.
pub type Subscription = Pin<Box<dyn Stream<Item = Arc<StreamEvent>> + Send>>;

struct JobState {
    events: Vec<Arc<StreamEvent>>,
    done: bool,
    terminal_error: Option<String>,
    finished_at: Option<Instant>,
}

/// Append-only, replayable event log for one logical execution.
///
/// Once `done` is set the log is frozen and its last record is
/// [`StreamEvent::Done`]. Every subscriber sees the same total order.
pub struct Job {
    key: JobKey,
    created_at: Instant,
    state: Mutex<JobState>,
    // Bumped after every append/finish; subscribers wait on it.
    changed: watch::Sender<u64>,
    cancel: CancellationToken,
    metrics: Option<Arc<HubMetrics>>,
}

impl Job {
    pub fn new(key: JobKey) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            key,
            created_at: Instant::now(),
            state: Mutex::new(JobState {
                events: Vec::new(),
                done: false,
                terminal_error: None,
                finished_at: None,
            }),
            changed,
            cancel: CancellationToken::new(),
            metrics: None,
        }
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fires when the owning hub shuts down. Runners should stop producing
    /// and finish the job with their own bookkeeping intact.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Append one event and wake all waiters. Returns the event's offset.
    pub fn append(&self, event: StreamEvent) -> Result<usize, HubError> {
        if event.is_done() {
            error!(job_key = %self.key, "attempted to append the done record directly");
            return Err(HubError::ReservedEvent { key: self.key.clone() });
        }

        let offset = {
            let mut state = self.state.lock();
            if state.done {
                error!(
                    job_key = %self.key,
                    event_type = event.event_type(),
                    "append after finish rejected"
                );
                return Err(HubError::JobFinished { key: self.key.clone() });
            }
            state.events.push(Arc::new(event));
            state.events.len() - 1
        };

        if let Some(m) = &self.metrics {
            m.counter_inc(names::EVENTS_APPENDED, 1);
        }
        self.changed.send_modify(|v| *v += 1);
        Ok(offset)
    }

    /// Close the log. With an error message, a terminal `error` record is
    /// written before `done`. Only the first call has any effect; returns
    /// whether this call was it.
    pub fn finish(&self, error: Option<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.done {
                return false;
            }
            if let Some(message) = error {
                state.events.push(Arc::new(StreamEvent::Error { message: message.clone() }));
                state.terminal_error = Some(message);
            }
            state.events.push(Arc::new(StreamEvent::Done));
            state.done = true;
            state.finished_at = Some(Instant::now());
        }

        self.changed.send_modify(|v| *v += 1);
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn terminal_error(&self) -> Option<String> {
        self.state.lock().terminal_error.clone()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.state.lock().finished_at
    }

    /// Copy of the whole log as it stands.
    pub fn snapshot(&self) -> Vec<Arc<StreamEvent>> {
        self.state.lock().events.clone()
    }

    /// Events from `cursor` on, plus whether the log is closed.
    fn slice_from(&self, cursor: usize) -> (Vec<Arc<StreamEvent>>, bool) {
        let state = self.state.lock();
        let slice = state.events.get(cursor..).map(<[_]>::to_vec).unwrap_or_default();
        (slice, state.done)
    }

    /// Replay from `cursor`, then follow live appends until `done`.
    ///
    /// The buffered slice is copied under the lock and yielded outside it,
    /// so a slow subscriber never blocks the producer. Re-subscribing from
    /// any cursor previously reached yields the exact continuation.
    pub fn subscribe(self: &Arc<Self>, cursor: usize) -> Subscription {
        struct Cursor {
            job: Arc<Job>,
            next: usize,
            pending: VecDeque<Arc<StreamEvent>>,
            changed: watch::Receiver<u64>,
            exhausted: bool,
        }

        let start = Cursor {
            job: Arc::clone(self),
            next: cursor,
            pending: VecDeque::new(),
            changed: self.changed.subscribe(),
            exhausted: false,
        };

        Box::pin(futures::stream::unfold(start, |mut c| async move {
            loop {
                if let Some(event) = c.pending.pop_front() {
                    c.next += 1;
                    return Some((event, c));
                }
                if c.exhausted {
                    return None;
                }

                // Mark the current version seen before reading, so an append
                // racing with the read still wakes the wait below.
                c.changed.borrow_and_update();
                let (slice, done) = c.job.slice_from(c.next);
                if !slice.is_empty() {
                    c.pending.extend(slice);
                    c.exhausted = done;
                    continue;
                }
                if done {
                    return None;
                }
                if c.changed.changed().await.is_err() {
                    return None;
                }
            }
        }))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("events", &state.events.len())
            .field("done", &state.done)
            .field("terminal_error", &state.terminal_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn job() -> Arc<Job> {
        Arc::new(Job::new(JobKey::from_raw("test:job")))
    }

    fn token(s: &str) -> StreamEvent {
        StreamEvent::Token { task: None, content: s.into() }
    }

    async fn collect(job: &Arc<Job>, cursor: usize) -> Vec<StreamEvent> {
        job.subscribe(cursor).map(|e| (*e).clone()).collect().await
    }

    #[tokio::test]
    async fn finished_job_replays_and_terminates() {
        let job = job();
        job.append(token("a")).unwrap();
        job.append(token("b")).unwrap();
        assert!(job.finish(None));

        let events = collect(&job, 0).await;
        assert_eq!(events, vec![token("a"), token("b"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn finish_with_error_writes_error_then_done() {
        let job = job();
        job.append(token("a")).unwrap();
        job.finish(Some("boom".into()));

        let events = collect(&job, 0).await;
        assert_eq!(
            events,
            vec![
                token("a"),
                StreamEvent::Error { message: "boom".into() },
                StreamEvent::Done
            ]
        );
        assert_eq!(job.terminal_error().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let job = job();
        assert!(job.finish(None));
        assert!(!job.finish(Some("late".into())));
        assert_eq!(job.len(), 1);
        assert!(job.terminal_error().is_none());
    }

    #[tokio::test]
    async fn append_after_finish_is_rejected() {
        let job = job();
        job.append(token("a")).unwrap();
        job.finish(None);

        let err = job.append(token("late")).unwrap_err();
        assert!(matches!(err, HubError::JobFinished { .. }));
        assert_eq!(collect(&job, 0).await, vec![token("a"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn done_cannot_be_appended() {
        let job = job();
        let err = job.append(StreamEvent::Done).unwrap_err();
        assert!(matches!(err, HubError::ReservedEvent { .. }));
        assert!(job.is_empty());
    }

    #[tokio::test]
    async fn live_subscriber_sees_later_appends() {
        let job = job();
        let sub = job.subscribe(0);
        let reader = tokio::spawn(async move {
            sub.map(|e| (*e).clone()).collect::<Vec<_>>().await
        });

        tokio::task::yield_now().await;
        job.append(token("x")).unwrap();
        tokio::task::yield_now().await;
        job.append(token("y")).unwrap();
        job.finish(None);

        let events = reader.await.unwrap();
        assert_eq!(events, vec![token("x"), token("y"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn early_and_late_subscribers_agree() {
        let job = job();
        let early = {
            let sub = job.subscribe(0);
            tokio::spawn(async move { sub.map(|e| (*e).clone()).collect::<Vec<_>>().await })
        };

        for i in 0..50 {
            job.append(token(&i.to_string())).unwrap();
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        job.append(StreamEvent::Result { data: json!({"n": 50}) }).unwrap();
        job.finish(None);

        let early = early.await.unwrap();
        let late = collect(&job, 0).await;
        assert_eq!(early, late);
        assert_eq!(late.len(), 52);
        assert!(late.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn resume_from_cursor_has_no_gaps_or_duplicates() {
        let job = job();
        for i in 0..10 {
            job.append(token(&i.to_string())).unwrap();
        }

        // Read a prefix, then "disconnect".
        let mut first = job.subscribe(0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push((*first.next().await.unwrap()).clone());
        }
        drop(first);

        for i in 10..15 {
            job.append(token(&i.to_string())).unwrap();
        }
        job.finish(None);

        let rest = collect(&job, seen.len()).await;
        seen.extend(rest);
        assert_eq!(seen, collect(&job, 0).await);
    }

    #[tokio::test]
    async fn cursor_past_end_waits_for_more() {
        let job = job();
        job.append(token("a")).unwrap();

        let sub = job.subscribe(2);
        let reader = tokio::spawn(async move {
            sub.map(|e| (*e).clone()).collect::<Vec<_>>().await
        });

        job.append(token("b")).unwrap();
        job.append(token("c")).unwrap();
        job.finish(None);

        assert_eq!(reader.await.unwrap(), vec![token("c"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn dropping_subscriber_does_not_affect_job() {
        let job = job();
        let sub = job.subscribe(0);
        drop(sub);
        job.append(token("a")).unwrap();
        job.finish(None);
        assert_eq!(job.len(), 2);
    }

    #[tokio::test]
    async fn many_concurrent_subscribers_see_identical_order() {
        let job = job();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let sub = job.subscribe(0);
                tokio::spawn(async move { sub.map(|e| (*e).clone()).collect::<Vec<_>>().await })
            })
            .collect();

        let producer = {
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                for i in 0..100 {
                    job.append(token(&i.to_string())).unwrap();
                    tokio::task::yield_now().await;
                }
                job.finish(None);
            })
        };
        producer.await.unwrap();

        let expected = collect(&job, 0).await;
        for r in readers {
            assert_eq!(r.await.unwrap(), expected);
        }
    }

    #[test]
    fn finished_at_is_set_on_finish() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let job = job();
            assert!(job.finished_at().is_none());
            job.finish(None);
            assert!(job.finished_at().is_some());
            assert!(job.is_done());
        });
    }
}
