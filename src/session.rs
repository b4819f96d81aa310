use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ExtractRequest, JobApi};
use crate::bridge::{Message, MessageBus};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{RecordStatus, RecordsExt, StateStore, VideoRecord};

/// Error recorded when a completed job carries no usable clips.
pub const NO_CLIPS_MESSAGE: &str = "No clips could be found for the given prompt";

/// Time source for record stamps. Only client-stamped times are ever
/// compared, so the staleness check is immune to server clock skew.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of reattaching an execution context to persisted state.
#[derive(Debug, Clone)]
pub enum Reattachment {
    /// Nothing persisted for this key and nothing to adopt.
    Idle,
    /// A pending record was found; polling has resumed for its stored job.
    Polling(VideoRecord),
    /// A terminal record was found; render it directly, no polling.
    Terminal(VideoRecord),
    /// No record for this key, but another in-flight record was adopted.
    /// A best-effort heuristic for contexts without a direct key;
    /// approximate, not authoritative.
    Adopted(VideoRecord),
}

/// Handle to one live polling loop. At most one per video key; starting a
/// new session for a key cancels the prior one.
struct PollSession {
    job_id: String,
    inert: Arc<AtomicBool>,
    poll_task: JoinHandle<()>,
    guard_task: Option<JoinHandle<()>>,
}

impl PollSession {
    /// Safe to call more than once. The inert flag also discards a poll
    /// response that is already in flight when the cancel lands.
    fn cancel(&self) {
        self.inert.store(true, Ordering::SeqCst);
        self.poll_task.abort();
        if let Some(guard) = &self.guard_task {
            guard.abort();
        }
    }
}

/// Reconciles locally persisted job state with the polled remote status.
///
/// All transitions write whole records to the store; bridge messages are
/// fire-and-forget notifications on top. Every error from the Job API is
/// converted into a terminal failed record here, nothing propagates to the
/// UI as a fault.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn JobApi>,
    store: Arc<dyn StateStore>,
    bus: MessageBus,
    config: Config,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, PollSession>>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn JobApi>,
        store: Arc<dyn StateStore>,
        bus: MessageBus,
        config: Config,
    ) -> Self {
        Self::with_clock(api, store, bus, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        api: Arc<dyn JobApi>,
        store: Arc<dyn StateStore>,
        bus: MessageBus,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                bus,
                config,
                clock,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Last persisted record for a key, if any.
    pub fn record(&self, video_key: &str) -> Result<Option<VideoRecord>> {
        self.inner.store.video_record(video_key)
    }

    /// Submits a new extraction job and starts polling it.
    ///
    /// On success the pending record, prompt and job cross-reference are
    /// persisted before this returns; on failure a failed record is
    /// persisted and the error is also returned to the caller.
    pub async fn submit(&self, video_key: &str, url: &str, prompt: &str) -> Result<String> {
        self.cancel_session(video_key);
        self.inner.store.put_prompt(video_key, prompt)?;

        info!(video_key, "submitting extraction job");
        let request = ExtractRequest {
            url: url.to_string(),
            prompt: prompt.to_string(),
        };
        match self.inner.api.submit(&request).await {
            Ok(job) => {
                let record = VideoRecord::pending(video_key, prompt, &job.id, self.now());
                self.inner.store.put_video_record(&record)?;
                self.inner.store.put_job_ref(&job.id, prompt)?;
                self.inner.bus.publish(Message::JobStarted {
                    video_id: video_key.to_string(),
                    job_id: job.id.clone(),
                });
                self.spawn_session(video_key, &job.id, true);
                Ok(job.id)
            }
            Err(err) => {
                let record =
                    VideoRecord::failed_submission(video_key, prompt, err.to_string(), self.now());
                self.inner.store.put_video_record(&record)?;
                Err(err)
            }
        }
    }

    /// Reconciles a (re-)initialized context with whatever is persisted.
    ///
    /// A pending record resumes polling of its stored job id; it is never
    /// resubmitted. Terminal records are returned as-is without polling.
    pub fn reattach(&self, video_key: &str) -> Result<Reattachment> {
        if let Some(record) = self.inner.store.video_record(video_key)? {
            return match record.status {
                RecordStatus::Pending => match record.job_id.clone() {
                    Some(job_id) => {
                        debug!(video_key, %job_id, "resuming poll of persisted pending job");
                        self.spawn_session(video_key, &job_id, false);
                        Ok(Reattachment::Polling(record))
                    }
                    None => {
                        // pending without a job id can never progress
                        let failed =
                            record.failed(ClientError::Staleness.to_string(), self.now());
                        self.inner.store.put_video_record(&failed)?;
                        Ok(Reattachment::Terminal(failed))
                    }
                },
                _ => Ok(Reattachment::Terminal(record)),
            };
        }

        // No record for this key. Fallback for contexts without a direct
        // key: adopt the most recently updated in-flight record, if any.
        let adopted = self
            .inner
            .store
            .pending_records()?
            .into_iter()
            .filter_map(|record| record.job_id.clone().map(|job_id| (record, job_id)))
            .max_by_key(|(record, _)| record.last_updated_at);
        if let Some((record, job_id)) = adopted {
            debug!(
                video_key,
                adopted_key = %record.video_key,
                "no record for key; adopting in-flight job"
            );
            self.spawn_session(&record.video_key, &job_id, false);
            return Ok(Reattachment::Adopted(record));
        }

        Ok(Reattachment::Idle)
    }

    /// User-initiated reset: cancels any live session and clears the
    /// persisted record, prompt and job cross-reference.
    pub fn start_over(&self, video_key: &str) -> Result<()> {
        info!(video_key, "start over: clearing extraction state");
        self.cancel_session(video_key);
        self.inner.store.start_over(video_key)
    }

    /// Cancels the live session for a key, if any. Idempotent.
    pub fn cancel_session(&self, video_key: &str) {
        if let Some(session) = self.inner.sessions.lock().unwrap().remove(video_key) {
            debug!(video_key, job_id = %session.job_id, "cancelling poll session");
            session.cancel();
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn spawn_session(&self, video_key: &str, job_id: &str, arm_guard: bool) {
        self.cancel_session(video_key);

        let inert = Arc::new(AtomicBool::new(false));
        let poll_task = tokio::spawn(self.clone().run_poll_loop(
            video_key.to_string(),
            job_id.to_string(),
            Arc::clone(&inert),
        ));
        let guard_task = if arm_guard {
            Some(tokio::spawn(self.clone().run_staleness_guard(
                video_key.to_string(),
                job_id.to_string(),
                Arc::clone(&inert),
            )))
        } else {
            None
        };

        self.inner.sessions.lock().unwrap().insert(
            video_key.to_string(),
            PollSession {
                job_id: job_id.to_string(),
                inert,
                poll_task,
                guard_task,
            },
        );
    }

    async fn run_poll_loop(self, video_key: String, job_id: String, inert: Arc<AtomicBool>) {
        loop {
            tokio::time::sleep(self.inner.config.poll_interval).await;
            // Ticks are strictly sequential: the next sleep is not reached
            // until this poll has resolved.
            let result = self.inner.api.poll(&job_id).await;
            if inert.load(Ordering::SeqCst) {
                return; // cancelled while the poll was in flight; discard
            }
            let outcome = match result {
                Ok(job) => self.apply_snapshot(&video_key, &job_id, job),
                Err(err) => {
                    warn!(%video_key, %job_id, %err, "poll tick failed");
                    self.finish_failed(&video_key, &job_id, err.to_string())
                }
            };
            match outcome {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    warn!(%video_key, %job_id, %err, "store write failed, stopping session");
                    self.finish_session(&video_key, &job_id);
                    return;
                }
            }
        }
    }

    /// Applies one polled snapshot. Returns `true` when the session is over.
    fn apply_snapshot(&self, video_key: &str, job_id: &str, job: Job) -> Result<bool> {
        // Re-read immediately before writing; the record may have been
        // cleared or repointed by another context since the last tick.
        let Some(record) = self.inner.store.video_record(video_key)? else {
            debug!(video_key, "record gone mid-session, stopping poll");
            self.finish_session(video_key, job_id);
            return Ok(true);
        };
        if record.job_id.as_deref() != Some(job_id) {
            debug!(video_key, "record tracks a different job now, stopping poll");
            self.finish_session(video_key, job_id);
            return Ok(true);
        }

        match job.status {
            JobStatus::Completed => {
                let clips = job.clips;
                let clip_count = clips.len();
                let error = clips.is_empty().then(|| NO_CLIPS_MESSAGE.to_string());
                let updated =
                    record.completed(clips.clone(), job.output_url, error, self.now());
                self.inner.store.put_video_record(&updated)?;
                info!(video_key, job_id, clip_count, "extraction completed");
                self.inner.bus.publish(Message::ExtractionComplete {
                    video_id: video_key.to_string(),
                    job_id: job_id.to_string(),
                    clips,
                });
                self.finish_session(video_key, job_id);
                Ok(true)
            }
            JobStatus::Failed => {
                let error = job
                    .error_message
                    .unwrap_or_else(|| "extraction failed".to_string());
                self.finish_failed(video_key, job_id, error)
            }
            status => {
                // Non-terminal: refresh the stamp so the staleness guard
                // stays deferred.
                debug!(video_key, job_id, ?status, "job still in flight");
                self.inner
                    .store
                    .put_video_record(&record.refreshed(self.now()))?;
                Ok(false)
            }
        }
    }

    fn finish_failed(&self, video_key: &str, job_id: &str, error: String) -> Result<bool> {
        if let Some(record) = self.inner.store.video_record(video_key)? {
            if record.job_id.as_deref() == Some(job_id) {
                warn!(video_key, job_id, %error, "extraction failed");
                self.inner
                    .store
                    .put_video_record(&record.failed(error.clone(), self.now()))?;
                self.inner.bus.publish(Message::ExtractionError {
                    video_id: video_key.to_string(),
                    job_id: job_id.to_string(),
                    error,
                });
            }
        }
        self.finish_session(video_key, job_id);
        Ok(true)
    }

    /// Terminal cleanup for one session: cancels the staleness guard and
    /// drops the session entry. Idempotent; a stale call for a job no
    /// longer tracked is a no-op.
    fn finish_session(&self, video_key: &str, job_id: &str) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        let matches = sessions
            .get(video_key)
            .is_some_and(|session| session.job_id == job_id);
        if matches {
            if let Some(session) = sessions.remove(video_key) {
                session.inert.store(true, Ordering::SeqCst);
                if let Some(guard) = &session.guard_task {
                    guard.abort();
                }
                // the poll task returns on its own right after this call
            }
        }
    }

    async fn run_staleness_guard(self, video_key: String, job_id: String, inert: Arc<AtomicBool>) {
        tokio::time::sleep(self.inner.config.staleness_window).await;
        if let Err(err) = self.fire_staleness_guard(&video_key, &job_id, &inert) {
            warn!(%video_key, %err, "staleness guard could not update the record");
        }
    }

    /// One-shot check armed at submission time.
    ///
    /// Fires a terminal failure only when the record is still pending and
    /// its stamp has not moved for a full window. Every successful poll
    /// tick refreshes the stamp, which defers this indefinitely: it guards
    /// against a poll loop that silently stopped, not against slow
    /// processing. A second invocation after any transition is a no-op.
    fn fire_staleness_guard(
        &self,
        video_key: &str,
        job_id: &str,
        inert: &AtomicBool,
    ) -> Result<()> {
        if inert.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(record) = self.inner.store.video_record(video_key)? else {
            return Ok(());
        };
        if record.status != RecordStatus::Pending || record.job_id.as_deref() != Some(job_id) {
            return Ok(());
        }
        let age = self.now().signed_duration_since(record.last_updated_at);
        let window =
            chrono::Duration::seconds(self.inner.config.staleness_window.as_secs() as i64);
        if age < window {
            return Ok(());
        }

        warn!(video_key, job_id, "no status update within the staleness window");
        self.cancel_session(video_key);
        let error = ClientError::Staleness.to_string();
        self.inner
            .store
            .put_video_record(&record.failed(error.clone(), self.now()))?;
        self.inner.bus.publish(Message::ExtractionError {
            video_id: video_key.to_string(),
            job_id: job_id.to_string(),
            error,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::job::Clip;
    use crate::store::MemoryStore;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance_secs(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now = *now + chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct StubApi {
        submit_error: Mutex<Option<ClientError>>,
        responses: Mutex<VecDeque<crate::error::Result<Job>>>,
        submits: AtomicUsize,
        polls: AtomicUsize,
        polled_ids: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
    }

    impl StubApi {
        fn with_responses(
            responses: impl IntoIterator<Item = crate::error::Result<Job>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl JobApi for StubApi {
        async fn submit(&self, _request: &ExtractRequest) -> crate::error::Result<Job> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.submit_error.lock().unwrap().take() {
                return Err(err);
            }
            Ok(job("job-1", JobStatus::Pending))
        }

        async fn poll(&self, job_id: &str) -> crate::error::Result<Job> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.polled_ids.lock().unwrap().push(job_id.to_string());
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(job(job_id, JobStatus::Processing)))
        }
    }

    fn job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.to_string(),
            status,
            clips: Vec::new(),
            error_message: None,
            output_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn job_with_clips(id: &str, clips: Vec<Clip>) -> Job {
        Job {
            clips,
            ..job(id, JobStatus::Completed)
        }
    }

    fn reconciler(api: Arc<StubApi>, store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Reconciler {
        let config = Config {
            poll_interval: Duration::from_secs(5),
            staleness_window: Duration::from_secs(15),
            ..Config::default()
        };
        Reconciler::with_clock(api, store, MessageBus::new(), config, clock)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn step(clock: &ManualClock, secs: u64) {
        clock.advance_secs(secs as i64);
        tokio::time::advance(Duration::from_secs(secs)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submit_persists_pending_state_before_returning() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());
        let mut rx = machine.bus().subscribe();

        let job_id = machine.submit("vid-1", "https://v/x", "find demos").await.unwrap();

        assert_eq!(job_id, "job-1");
        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.job_id.as_deref(), Some("job-1"));
        assert_eq!(store.prompt("vid-1").unwrap().as_deref(), Some("find demos"));
        assert!(store.get(&crate::store::job_key("job-1")).unwrap().is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::JobStarted {
                video_id: "vid-1".into(),
                job_id: "job-1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submission_writes_failed_record_and_returns_error() {
        let api = StubApi::with_responses([]);
        *api.submit_error.lock().unwrap() = Some(ClientError::Validation {
            detail: "url is not supported".into(),
        });
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());

        let result = machine.submit("vid-1", "https://v/x", "p").await;

        assert!(result.is_err());
        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("url is not supported"));
        assert!(record.job_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_exactly_once_after_first_terminal_response() {
        let clips = vec![Clip {
            start_time: 0.0,
            end_time: 10.0,
            text: "intro".into(),
        }];
        let api = StubApi::with_responses([
            Ok(job("job-1", JobStatus::Processing)),
            Ok(job_with_clips("job-1", clips.clone())),
            Ok(job("job-1", JobStatus::Processing)),
        ]);
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());
        let mut rx = machine.bus().subscribe();

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Message::JobStarted { .. }));

        // auto-advance drives the poll timers until completion is published
        let completed = rx.recv().await.unwrap();
        assert_eq!(
            completed,
            Message::ExtractionComplete {
                video_id: "vid-1".into(),
                job_id: "job-1".into(),
                clips: clips.clone(),
            }
        );

        let polls_at_completion = api.polls.load(Ordering::SeqCst);
        assert_eq!(polls_at_completion, 2);

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(api.polls.load(Ordering::SeqCst), polls_at_completion);

        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.clips.as_deref(), Some(clips.as_slice()));
        assert!(record.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_job_with_empty_clips_records_no_clips_message() {
        let api = StubApi::with_responses([Ok(job("job-1", JobStatus::Completed))]);
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());
        let mut rx = machine.bus().subscribe();

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Message::JobStarted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Message::ExtractionComplete { clips, .. } if clips.is_empty()
        ));

        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.clips.as_deref(), Some(&[][..]));
        assert_eq!(record.error.as_deref(), Some(NO_CLIPS_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_fails_terminally() {
        let api = StubApi::with_responses([Err(ClientError::NotFound {
            job_id: "job-1".into(),
        })]);
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());
        let mut rx = machine.bus().subscribe();

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Message::JobStarted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Message::ExtractionError { error, .. } if error == "job not found: job-1"
        ));

        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(api.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_guard_fails_a_dead_poll_loop_exactly_once() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        // poll interval far beyond the staleness window simulates a loop
        // that never produced a tick
        let config = Config {
            poll_interval: Duration::from_secs(600),
            staleness_window: Duration::from_secs(15),
            ..Config::default()
        };
        let machine = Reconciler::with_clock(
            Arc::clone(&api) as Arc<dyn JobApi>,
            Arc::clone(&store) as Arc<dyn StateStore>,
            MessageBus::new(),
            config,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let mut rx = machine.bus().subscribe();

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Message::JobStarted { .. }));

        step(&clock, 15).await;

        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("server is not responding"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Message::ExtractionError { error, .. } if error == "server is not responding"
        ));

        // a second fire after the transition is a no-op
        let inert = AtomicBool::new(false);
        machine.fire_staleness_guard("vid-1", "job-1", &inert).unwrap();
        assert!(rx.try_recv().is_err());
        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ticks_defer_the_staleness_guard() {
        let api = StubApi::with_responses([
            Ok(job("job-1", JobStatus::Downloading)),
            Ok(job("job-1", JobStatus::Processing)),
            Ok(job("job-1", JobStatus::Completed)),
        ]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));
        let mut rx = machine.bus().subscribe();

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();

        step(&clock, 5).await; // tick: downloading
        step(&clock, 5).await; // tick: processing
        step(&clock, 5).await; // guard fires at 15s against a 5s-old stamp,
                               // then the third tick completes the job
        settle().await;

        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(matches!(rx.recv().await.unwrap(), Message::JobStarted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Message::ExtractionComplete { .. }
        ));
        assert!(rx.try_recv().is_err(), "no staleness error may be published");
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_pending_record_resumes_polling_without_resubmitting() {
        let api = StubApi::with_responses([Ok(job("job-9", JobStatus::Completed))]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        store
            .put_video_record(&VideoRecord::pending("vid-1", "p", "job-9", clock.now()))
            .unwrap();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));

        let outcome = machine.reattach("vid-1").unwrap();
        assert!(matches!(outcome, Reattachment::Polling(_)));

        step(&clock, 5).await;

        assert_eq!(api.submits.load(Ordering::SeqCst), 0, "must never resubmit");
        assert_eq!(api.polls.load(Ordering::SeqCst), 1);
        assert_eq!(api.polled_ids.lock().unwrap().as_slice(), ["job-9"]);
        let record = store.video_record("vid-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_terminal_record_renders_cached_state_without_polling() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        store
            .put_video_record(
                &VideoRecord::pending("vid-1", "p", "job-9", clock.now()).completed(
                    Vec::new(),
                    None,
                    None,
                    clock.now(),
                ),
            )
            .unwrap();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));

        let outcome = machine.reattach("vid-1").unwrap();
        assert!(matches!(outcome, Reattachment::Terminal(_)));

        step(&clock, 60).await;
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_without_record_adopts_most_recently_updated_pending_job() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        store
            .put_video_record(&VideoRecord::pending("vid-old", "p", "job-old", clock.now()))
            .unwrap();
        clock.advance_secs(10);
        store
            .put_video_record(&VideoRecord::pending("vid-new", "p", "job-new", clock.now()))
            .unwrap();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));

        let outcome = machine.reattach("vid-unknown").unwrap();
        let Reattachment::Adopted(record) = outcome else {
            panic!("expected adoption");
        };
        assert_eq!(record.video_key, "vid-new");

        step(&clock, 5).await;
        assert_eq!(api.polled_ids.lock().unwrap().as_slice(), ["job-new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_with_empty_store_is_idle() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), ManualClock::new());

        assert!(matches!(machine.reattach("vid-1").unwrap(), Reattachment::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn start_over_cancels_session_and_clears_keys() {
        let api = StubApi::with_responses([]);
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();
        machine.start_over("vid-1").unwrap();

        step(&clock, 120).await;

        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
        assert!(store.video_record("vid-1").unwrap().is_none());
        assert!(store.prompt("vid-1").unwrap().is_none());
        assert!(matches!(machine.reattach("vid-1").unwrap(), Reattachment::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_a_response_already_in_flight() {
        let gate = Arc::new(Notify::new());
        let api = Arc::new(StubApi {
            gate: Some(Arc::clone(&gate)),
            ..StubApi::default()
        });
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new();
        let machine = reconciler(Arc::clone(&api), Arc::clone(&store), Arc::clone(&clock));

        machine.submit("vid-1", "https://v/x", "p").await.unwrap();

        // first tick is now blocked inside the poll call
        clock.advance_secs(5);
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        machine.start_over("vid-1").unwrap();
        gate.notify_one();
        settle().await;

        assert!(
            store.video_record("vid-1").unwrap().is_none(),
            "a response arriving after cancellation must not mutate state"
        );
    }
}
