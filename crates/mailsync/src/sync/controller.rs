//! Sync controller.
//!
//! Owns admission (gatekeeper chain, single-flight per dedupe key with
//! cancel-and-replace), work-score accounting, the persisted retry queue,
//! per-account error surfacing and the status broadcast. Executors run on
//! spawned tokio tasks; the controller is the single writer of all
//! scheduling state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::broadcast::{FailureKind, SyncFailure, SyncStatus, SyncStatusBroadcaster};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, Database};
use crate::error::EngineError;
use crate::executor::{self, ExecContext, ExecError};
use crate::provider::{CredentialSource, MailProvider};
use crate::sync::gatekeeper::{
    first_veto, CachePressureGatekeeper, CacheUsage, Gatekeeper, NetworkGatekeeper,
};
use crate::sync::job::SyncJob;
use crate::sync::producer::{standard_producers, JobProducer, ProducerContext};

/// How many fine-grained jobs one bulk job expands into per admission.
const BULK_EXPANSION_LIMIT: u32 = 25;

/// Hook for elevated execution priority while sync work is user-visible.
///
/// Acquired when the total work score crosses the promotion threshold,
/// released after the score has stayed at zero for the debounce window.
pub trait PriorityHook: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Default hook: does nothing.
pub struct NoopPriorityHook;

impl PriorityHook for NoopPriorityHook {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// What happened to an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Spawned with no incumbent on its key.
    Started,
    /// Spawned after cancelling the incumbent on its key.
    Replaced,
    /// An incumbent is already in flight (or a retry backoff is pending).
    Deduplicated,
    /// Refused by the named gatekeeper.
    Vetoed(&'static str),
    /// A bulk job expanded into this many fine-grained admissions.
    Expanded(usize),
}

struct ActiveJob {
    instance: Uuid,
    score: u32,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct SchedulerState {
    active: HashMap<String, ActiveJob>,
    total_score: u32,
    account_errors: HashMap<String, SyncFailure>,
    promoted: bool,
    /// Bumped on every score change; a pending debounced release only
    /// fires if the generation is still the one it was scheduled under.
    release_generation: u64,
}

struct ControllerInner {
    db: Database,
    config: SyncConfig,
    provider: Arc<dyn MailProvider>,
    credentials: Arc<dyn CredentialSource>,
    connectivity: Arc<ConnectivityMonitor>,
    cache_usage: Arc<CacheUsage>,
    status: SyncStatusBroadcaster,
    priority: Arc<dyn PriorityHook>,
    state: Mutex<SchedulerState>,
    score_tx: watch::Sender<u32>,
    /// Runtime that executor tasks and the debounced release run on.
    /// Entry points are plain synchronous calls from arbitrary threads,
    /// so spawning must never depend on an ambient runtime.
    handle: Handle,
}

impl ControllerInner {
    fn locked(&self) -> MutexGuard<'_, SchedulerState> {
        // A poisoned scheduler lock only means a task panicked mid-update;
        // the state itself stays usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, state: &SchedulerState) -> SyncStatus {
        SyncStatus {
            is_syncing: state.total_score > 0,
            network_available: self.connectivity.is_online(),
            error: state
                .account_errors
                .values()
                .max_by_key(|failure| failure.at)
                .cloned(),
        }
    }

    fn publish(&self, state: &SchedulerState) {
        self.status.send(self.snapshot(state));
    }

    fn add_score(&self, state: &mut SchedulerState, score: u32) {
        state.total_score += score;
        state.release_generation += 1;
        if !state.promoted && state.total_score > self.config.policy.promote_score {
            state.promoted = true;
            self.priority.acquire();
        }
        self.score_tx.send_replace(state.total_score);
    }

    fn sub_score(self: &Arc<Self>, state: &mut SchedulerState, score: u32) {
        state.total_score = state.total_score.saturating_sub(score);
        state.release_generation += 1;
        self.score_tx.send_replace(state.total_score);

        if state.total_score == 0 && state.promoted {
            let generation = state.release_generation;
            let inner = Arc::clone(self);
            let debounce =
                std::time::Duration::from_millis(self.config.policy.promote_debounce_ms);
            self.handle.spawn(async move {
                tokio::time::sleep(debounce).await;
                let mut state = inner.locked();
                if state.release_generation == generation
                    && state.total_score == 0
                    && state.promoted
                {
                    state.promoted = false;
                    inner.priority.release();
                }
            });
        }
    }

    fn set_account_error(&self, account_id: &str, kind: FailureKind, message: &str) {
        let mut state = self.locked();
        state.account_errors.insert(
            account_id.to_string(),
            SyncFailure {
                account_id: account_id.to_string(),
                kind,
                message: message.to_string(),
                at: Utc::now(),
            },
        );
        self.publish(&state);
    }

    fn refresh_cache_usage(&self) -> Result<u64, EngineError> {
        let bytes = db::message_repo::cache_usage_bytes(&self.db)?;
        self.cache_usage.set(bytes);
        Ok(bytes)
    }

    fn remove_queue_entry(&self, dedupe_key: &str) {
        if let Err(err) = db::queue_repo::remove(&self.db, dedupe_key) {
            log::error!("Failed to remove queue entry {}: {}", dedupe_key, err);
        }
    }

    /// Settles one executor result. Completions of superseded instances are
    /// ignored entirely: the replacement owns the key, the queue row and
    /// the score.
    fn on_complete(self: &Arc<Self>, job: &SyncJob, instance: Uuid, result: Result<(), ExecError>) {
        let dedupe_key = job.dedupe_key();
        {
            let mut state = self.locked();
            match state.active.get(&dedupe_key) {
                Some(active) if active.instance == instance => {
                    let score = active.score;
                    state.active.remove(&dedupe_key);
                    self.sub_score(&mut state, score);
                }
                _ => return,
            }
        }

        match result {
            Ok(()) => {
                self.remove_queue_entry(&dedupe_key);
                if let Some(account_id) = job.account_id() {
                    self.locked().account_errors.remove(account_id);
                }
                if let Err(err) = self.refresh_cache_usage() {
                    log::error!("Failed to refresh cache usage: {}", err);
                }
                log::debug!("Job {} completed", dedupe_key);
            }
            Err(ExecError::Cancelled) => {
                // Partial work was discarded; the queue row survives so the
                // next cycle can re-admit if the job is still wanted.
                log::debug!("Job {} cancelled", dedupe_key);
            }
            Err(err) if err.is_retryable() => {
                self.schedule_retry(&dedupe_key, job, &err);
            }
            Err(ExecError::AuthRequired(_)) => {
                self.remove_queue_entry(&dedupe_key);
                if let Some(account_id) = job.account_id() {
                    self.set_account_error(
                        account_id,
                        FailureKind::AuthRequired,
                        "account needs reauthentication",
                    );
                }
                log::warn!("Job {} blocked: account needs reauthentication", dedupe_key);
            }
            Err(err) => {
                // Permanent. The executor already marked the target row.
                self.remove_queue_entry(&dedupe_key);
                if let Some(account_id) = job.account_id() {
                    self.set_account_error(account_id, FailureKind::Permanent, &err.to_string());
                }
                log::warn!("Job {} failed permanently: {}", dedupe_key, err);
            }
        }

        let state = self.locked();
        self.publish(&state);
    }

    fn schedule_retry(&self, dedupe_key: &str, job: &SyncJob, err: &ExecError) {
        let now = Utc::now();
        let attempts = match db::queue_repo::attempts(&self.db, dedupe_key) {
            Ok(Some(attempts)) => attempts + 1,
            Ok(None) => 1,
            Err(query_err) => {
                log::error!(
                    "Failed to read attempts for {}: {}",
                    dedupe_key,
                    query_err
                );
                1
            }
        };

        if attempts > self.config.policy.max_retries {
            log::warn!(
                "Job {} exhausted {} retries, giving up: {}",
                dedupe_key,
                self.config.policy.max_retries,
                err
            );
            self.remove_queue_entry(dedupe_key);
            if let Some(account_id) = job.account_id() {
                self.set_account_error(account_id, FailureKind::Transient, &err.to_string());
            }
            return;
        }

        let delay_ms = match err {
            ExecError::RateLimited { retry_after_secs } => retry_after_secs.saturating_mul(1000),
            _ => self
                .config
                .policy
                .retry_backoff_ms
                .saturating_mul(1u64 << (attempts - 1).min(16)),
        };
        let next_retry_at = now + Duration::milliseconds(delay_ms as i64);
        if let Err(record_err) =
            db::queue_repo::record_retry(&self.db, dedupe_key, attempts, next_retry_at, now)
        {
            log::error!("Failed to record retry for {}: {}", dedupe_key, record_err);
        }
        log::debug!(
            "Job {} failed transiently (attempt {}), retrying at {}: {}",
            dedupe_key,
            attempts,
            next_retry_at,
            err
        );
    }
}

/// The scheduler at the heart of the engine.
pub struct SyncController {
    inner: Arc<ControllerInner>,
    gatekeepers: Vec<Box<dyn Gatekeeper>>,
    producers: Vec<Box<dyn JobProducer>>,
    /// Kept alive only when the controller was built outside any runtime
    /// and had to bring its own.
    _runtime: Option<Runtime>,
}

impl SyncController {
    pub fn new(
        db: Database,
        config: SyncConfig,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<dyn CredentialSource>,
        connectivity: Arc<ConnectivityMonitor>,
        priority: Arc<dyn PriorityHook>,
    ) -> Result<Self, EngineError> {
        let cache_usage = Arc::new(CacheUsage::default());
        let gatekeepers: Vec<Box<dyn Gatekeeper>> = vec![
            Box::new(NetworkGatekeeper::new(connectivity.clone())),
            Box::new(CachePressureGatekeeper::new(cache_usage.clone(), &config)),
        ];
        let (score_tx, _) = watch::channel(0);

        // Admission is called from plain platform threads; executor tasks
        // need a runtime that is always there. Reuse the caller's when one
        // exists, otherwise own a small worker pool.
        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("mailsync-executor")
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        EngineError::Controller(format!("failed to build executor runtime: {e}"))
                    })?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        Ok(Self {
            inner: Arc::new(ControllerInner {
                db,
                config,
                provider,
                credentials,
                connectivity,
                cache_usage,
                status: SyncStatusBroadcaster::default(),
                priority,
                state: Mutex::new(SchedulerState::default()),
                score_tx,
                handle,
            }),
            gatekeepers,
            producers: standard_producers(),
            _runtime: runtime,
        })
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn status_broadcaster(&self) -> SyncStatusBroadcaster {
        self.inner.status.clone()
    }

    pub fn cache_usage(&self) -> Arc<CacheUsage> {
        self.inner.cache_usage.clone()
    }

    pub fn total_work_score(&self) -> u32 {
        self.inner.locked().total_score
    }

    pub fn is_syncing(&self) -> bool {
        self.total_work_score() > 0
    }

    /// The most recent unresolved failure for one account.
    pub fn account_error(&self, account_id: &str) -> Option<SyncFailure> {
        self.inner.locked().account_errors.get(account_id).cloned()
    }

    /// Number of jobs currently in flight.
    pub fn active_jobs(&self) -> usize {
        self.inner.locked().active.len()
    }

    /// Resolves once every in-flight job has settled.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.score_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Recomputes the cached-content byte total the gatekeepers consult.
    pub fn refresh_cache_usage(&self) -> Result<u64, EngineError> {
        self.inner.refresh_cache_usage()
    }

    /// Admits one job with cancel-and-replace semantics: an incumbent on
    /// the same dedupe key is cancelled and its result discarded. This is
    /// the user-triggered path; producer cycles deduplicate instead.
    pub fn admit(&self, job: SyncJob) -> Result<AdmitOutcome, EngineError> {
        self.admit_with(job, true)
    }

    fn admit_background(&self, job: SyncJob) -> Result<AdmitOutcome, EngineError> {
        self.admit_with(job, false)
    }

    fn admit_with(&self, job: SyncJob, replace: bool) -> Result<AdmitOutcome, EngineError> {
        if let Some(veto) = first_veto(&self.gatekeepers, &job) {
            log::debug!("Job {} vetoed by {} gatekeeper", job.dedupe_key(), veto);
            // A user asking for remote content while offline deserves an
            // answer, not silence.
            if veto == "network" && !job.is_proactive() {
                if let Some(account_id) = job.account_id() {
                    self.inner.set_account_error(
                        account_id,
                        FailureKind::Offline,
                        "network unavailable",
                    );
                }
            }
            return Ok(AdmitOutcome::Vetoed(veto));
        }

        match &job {
            SyncJob::BulkFetchBodies {
                account_id,
                folder_id,
            } => {
                let message_ids = db::message_repo::missing_body_ids(
                    &self.inner.db,
                    folder_id,
                    BULK_EXPANSION_LIMIT,
                )?;
                let mut admitted = 0;
                for message_id in message_ids {
                    let fine = SyncJob::FetchFullMessageBody {
                        account_id: account_id.clone(),
                        message_id,
                        proactive: true,
                    };
                    if matches!(self.admit_with(fine, false)?, AdmitOutcome::Started) {
                        admitted += 1;
                    }
                }
                return Ok(AdmitOutcome::Expanded(admitted));
            }
            SyncJob::BulkFetchAttachments {
                account_id,
                folder_id,
            } => {
                let targets = db::attachment_repo::missing_for_folder(
                    &self.inner.db,
                    folder_id,
                    BULK_EXPANSION_LIMIT,
                )?;
                let mut admitted = 0;
                for (message_id, attachment_id) in targets {
                    let fine = SyncJob::DownloadAttachment {
                        account_id: account_id.clone(),
                        message_id,
                        attachment_id,
                        proactive: true,
                    };
                    if matches!(self.admit_with(fine, false)?, AdmitOutcome::Started) {
                        admitted += 1;
                    }
                }
                return Ok(AdmitOutcome::Expanded(admitted));
            }
            _ => {}
        }

        let dedupe_key = job.dedupe_key();
        let now = Utc::now();

        if !replace {
            if self.inner.locked().active.contains_key(&dedupe_key) {
                return Ok(AdmitOutcome::Deduplicated);
            }
            // A scheduled retry keeps its backoff; only a user admission
            // overrides it.
            if let Some(until) = db::queue_repo::backoff_until(&self.inner.db, &dedupe_key)? {
                if until > now {
                    return Ok(AdmitOutcome::Deduplicated);
                }
            }
        }

        db::queue_repo::upsert(&self.inner.db, &job, now)?;

        let instance = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let replaced;
        {
            let mut state = self.inner.locked();
            replaced = match state.active.remove(&dedupe_key) {
                Some(incumbent) => {
                    if !replace {
                        // Raced with another admission between the check
                        // above and this lock; keep the incumbent.
                        state.active.insert(dedupe_key, incumbent);
                        return Ok(AdmitOutcome::Deduplicated);
                    }
                    incumbent.cancel.store(true, Ordering::Relaxed);
                    self.inner.sub_score(&mut state, incumbent.score);
                    log::debug!("Job {} superseded its running instance", dedupe_key);
                    true
                }
                None => false,
            };
            state.active.insert(
                dedupe_key,
                ActiveJob {
                    instance,
                    score: job.work_score(),
                    cancel: cancel.clone(),
                },
            );
            self.inner.add_score(&mut state, job.work_score());
            self.inner.publish(&state);
        }

        let ctx = ExecContext::new(
            self.inner.db.clone(),
            self.inner.provider.clone(),
            self.inner.credentials.clone(),
            self.inner.config.clone(),
            cancel,
        );
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            let result = executor::run_job(&job, &ctx).await;
            inner.on_complete(&job, instance, result);
        });

        Ok(if replaced {
            AdmitOutcome::Replaced
        } else {
            AdmitOutcome::Started
        })
    }

    /// One scheduling cycle: refresh the usage snapshot, poll every
    /// producer, then re-admit persisted queue entries that are due
    /// (restart recovery and expired backoffs).
    pub fn run_cycle(&self) -> Result<(), EngineError> {
        if let Err(err) = self.inner.refresh_cache_usage() {
            log::error!("Failed to refresh cache usage: {}", err);
        }
        let now = Utc::now();
        let cx = ProducerContext {
            db: self.inner.db.clone(),
            config: self.inner.config.clone(),
            connectivity: self.inner.connectivity.clone(),
            cache_usage: self.inner.cache_usage.clone(),
            now,
        };

        for producer in &self.producers {
            match producer.produce(&cx) {
                Ok(jobs) => {
                    for job in jobs {
                        if let Err(err) = self.admit_background(job) {
                            log::error!(
                                "Failed to admit job from {} producer: {}",
                                producer.name(),
                                err
                            );
                        }
                    }
                }
                Err(err) => log::error!("Producer {} failed: {}", producer.name(), err),
            }
        }

        for entry in db::queue_repo::due(&self.inner.db, now)? {
            if let Err(err) = self.admit_background(entry.job) {
                log::error!("Failed to re-admit persisted job: {}", err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    use crate::db::{folder_repo, message_repo, queue_repo};
    use crate::models::FolderSyncState;
    use crate::provider::{FolderDelta, ProviderError, StaticCredentials};
    use crate::provider_test_support::{envelope, full_message, ScriptedProvider};

    struct CountingHook {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl CountingHook {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            })
        }
    }

    impl PriorityHook for CountingHook {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller_with(
        provider: Arc<ScriptedProvider>,
        config: SyncConfig,
        hook: Arc<dyn PriorityHook>,
    ) -> SyncController {
        SyncController::new(
            Database::open_in_memory().unwrap(),
            config,
            provider,
            Arc::new(StaticCredentials),
            Arc::new(ConnectivityMonitor::new(true, false)),
            hook,
        )
        .unwrap()
    }

    fn controller(provider: Arc<ScriptedProvider>) -> SyncController {
        controller_with(
            provider,
            SyncConfig::with_defaults(PathBuf::from("/tmp/content")),
            Arc::new(NoopPriorityHook),
        )
    }

    fn seed_folder(db: &Database, token: Option<&str>) {
        let mut folder = FolderSyncState::new("inbox", "acct-1", "Inbox");
        folder.sync_token = token.map(str::to_string);
        folder_repo::upsert(db, &folder).unwrap();
    }

    fn refresh_job(proactive: bool) -> SyncJob {
        SyncJob::FolderRefresh {
            account_id: "acct-1".into(),
            folder_id: "inbox".into(),
            proactive,
        }
    }

    fn body_job(message_id: &str, proactive: bool) -> SyncJob {
        SyncJob::FetchFullMessageBody {
            account_id: "acct-1".into(),
            message_id: message_id.into(),
            proactive,
        }
    }

    #[tokio::test]
    async fn test_admit_runs_job_and_settles_score() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        provider.push_delta(Ok(FolderDelta {
            added: vec![envelope("m1", "inbox", Utc::now())],
            updated: vec![],
            removed: vec![],
            next_token: "tok-2".into(),
        }));

        let outcome = ctrl.admit(refresh_job(false)).unwrap();
        assert_eq!(outcome, AdmitOutcome::Started);
        assert!(ctrl.is_syncing());

        ctrl.wait_idle().await;
        assert_eq!(ctrl.total_work_score(), 0);
        assert_eq!(ctrl.active_jobs(), 0);
        assert!(message_repo::get_envelope(&ctrl.inner.db, "m1")
            .unwrap()
            .is_some());
        // Settled jobs leave the durable queue.
        assert!(queue_repo::due(&ctrl.inner.db, Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_admit_without_ambient_runtime_uses_owned_one() {
        // Entry points are called from plain platform threads. The job
        // must still run, and the score must settle back to zero.
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        provider.push_delta(Ok(FolderDelta {
            added: vec![],
            updated: vec![],
            removed: vec![],
            next_token: "tok-2".into(),
        }));

        assert_eq!(ctrl.admit(refresh_job(false)).unwrap(), AdmitOutcome::Started);

        let mut settled = false;
        for _ in 0..200 {
            if ctrl.total_work_score() == 0 {
                settled = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(settled, "job never settled");
        assert_eq!(ctrl.active_jobs(), 0);
        let folder = folder_repo::get(&ctrl.inner.db, "inbox").unwrap().unwrap();
        assert_eq!(folder.sync_token.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn test_single_flight_cancels_and_replaces() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        provider.script_message("m1", Ok(full_message("m1", "inbox", "the body")));
        let gate = provider.install_gate();

        // First instance parks inside the provider.
        assert_eq!(
            ctrl.admit(body_job("m1", true)).unwrap(),
            AdmitOutcome::Started
        );
        tokio::task::yield_now().await;
        assert_eq!(ctrl.total_work_score(), 1);

        // Same key again: incumbent cancelled, score never double-counts.
        assert_eq!(
            ctrl.admit(body_job("m1", false)).unwrap(),
            AdmitOutcome::Replaced
        );
        assert_eq!(ctrl.total_work_score(), 1);
        assert_eq!(ctrl.active_jobs(), 1);

        gate.add_permits(2);
        ctrl.wait_idle().await;
        assert_eq!(ctrl.total_work_score(), 0);
        assert_eq!(
            message_repo::body_content(&ctrl.inner.db, "m1")
                .unwrap()
                .as_deref(),
            Some("the body")
        );
    }

    #[tokio::test]
    async fn test_background_admission_deduplicates_instead_of_replacing() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        provider.script_message("m1", Ok(full_message("m1", "inbox", "body")));
        let gate = provider.install_gate();

        assert_eq!(
            ctrl.admit_background(body_job("m1", true)).unwrap(),
            AdmitOutcome::Started
        );
        assert_eq!(
            ctrl.admit_background(body_job("m1", true)).unwrap(),
            AdmitOutcome::Deduplicated
        );
        assert_eq!(ctrl.active_jobs(), 1);

        gate.add_permits(1);
        ctrl.wait_idle().await;
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_backoff() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        provider.push_delta(Err(ProviderError::Transient("503".into())));

        ctrl.admit(refresh_job(true)).unwrap();
        ctrl.wait_idle().await;

        let key = refresh_job(true).dedupe_key();
        assert_eq!(queue_repo::attempts(&ctrl.inner.db, &key).unwrap(), Some(1));
        let until = queue_repo::backoff_until(&ctrl.inner.db, &key)
            .unwrap()
            .unwrap();
        assert!(until > Utc::now());
        // A single transient failure is not surfaced as an account error.
        assert!(ctrl.account_error("acct-1").is_none());

        // While the backoff is pending, background re-admission is refused.
        assert_eq!(
            ctrl.admit_background(refresh_job(true)).unwrap(),
            AdmitOutcome::Deduplicated
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_transient_error() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        let key = refresh_job(true).dedupe_key();

        // Already at the retry ceiling.
        queue_repo::upsert(&ctrl.inner.db, &refresh_job(true), Utc::now()).unwrap();
        queue_repo::record_retry(&ctrl.inner.db, &key, 3, Utc::now(), Utc::now()).unwrap();
        provider.push_delta(Err(ProviderError::Transient("503".into())));

        ctrl.admit(refresh_job(true)).unwrap();
        ctrl.wait_idle().await;

        let error = ctrl.account_error("acct-1").unwrap();
        assert_eq!(error.kind, FailureKind::Transient);
        assert_eq!(queue_repo::attempts(&ctrl.inner.db, &key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_auth_failure_flags_account_and_clears_on_success() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        provider.push_delta(Err(ProviderError::AuthRequired));

        ctrl.admit(refresh_job(false)).unwrap();
        ctrl.wait_idle().await;
        let error = ctrl.account_error("acct-1").unwrap();
        assert_eq!(error.kind, FailureKind::AuthRequired);

        // Next success for the account clears the flag.
        provider.push_delta(Ok(FolderDelta {
            added: vec![],
            updated: vec![],
            removed: vec![],
            next_token: "tok-2".into(),
        }));
        ctrl.admit(refresh_job(false)).unwrap();
        ctrl.wait_idle().await;
        assert!(ctrl.account_error("acct-1").is_none());
    }

    #[tokio::test]
    async fn test_offline_veto_surfaces_only_for_user_jobs() {
        let provider = Arc::new(ScriptedProvider::default());
        let connectivity = Arc::new(ConnectivityMonitor::new(false, false));
        let ctrl = SyncController::new(
            Database::open_in_memory().unwrap(),
            SyncConfig::with_defaults(PathBuf::from("/tmp/content")),
            provider,
            Arc::new(StaticCredentials),
            connectivity,
            Arc::new(NoopPriorityHook),
        )
        .unwrap();

        assert_eq!(
            ctrl.admit(refresh_job(true)).unwrap(),
            AdmitOutcome::Vetoed("network")
        );
        assert!(ctrl.account_error("acct-1").is_none());

        assert_eq!(
            ctrl.admit(refresh_job(false)).unwrap(),
            AdmitOutcome::Vetoed("network")
        );
        let error = ctrl.account_error("acct-1").unwrap();
        assert_eq!(error.kind, FailureKind::Offline);
    }

    #[tokio::test]
    async fn test_bulk_job_expands_into_fine_grained_jobs() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        ctrl.inner
            .db
            .with_tx(|tx| {
                message_repo::upsert_envelope_tx(tx, &envelope("m1", "inbox", Utc::now()))?;
                message_repo::upsert_envelope_tx(tx, &envelope("m2", "inbox", Utc::now()))
            })
            .unwrap();
        provider.script_message("m1", Ok(full_message("m1", "inbox", "one")));
        provider.script_message("m2", Ok(full_message("m2", "inbox", "two")));

        let outcome = ctrl
            .admit(SyncJob::BulkFetchBodies {
                account_id: "acct-1".into(),
                folder_id: "inbox".into(),
            })
            .unwrap();
        assert_eq!(outcome, AdmitOutcome::Expanded(2));

        ctrl.wait_idle().await;
        assert!(message_repo::body_content(&ctrl.inner.db, "m1")
            .unwrap()
            .is_some());
        assert!(message_repo::body_content(&ctrl.inner.db, "m2")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_promotion_hook_with_debounced_release() {
        let provider = Arc::new(ScriptedProvider::default());
        let hook = CountingHook::new();
        let mut config = SyncConfig::with_defaults(PathBuf::from("/tmp/content"));
        config.policy.promote_score = 3;
        config.policy.promote_debounce_ms = 20;
        let ctrl = controller_with(provider.clone(), config, hook.clone());
        seed_folder(&ctrl.inner.db, Some("tok"));
        let gate = provider.install_gate();

        // Two refreshes of distinct folders: scores 2 + 2 cross the
        // threshold of 3.
        let mut other = FolderSyncState::new("archive", "acct-1", "Archive");
        other.sync_token = Some("tok".into());
        folder_repo::upsert(&ctrl.inner.db, &other).unwrap();
        let empty_delta = || {
            Ok(FolderDelta {
                added: vec![],
                updated: vec![],
                removed: vec![],
                next_token: "t".into(),
            })
        };
        provider.push_delta(empty_delta());
        provider.push_delta(empty_delta());

        ctrl.admit(refresh_job(true)).unwrap();
        ctrl.admit(SyncJob::FolderRefresh {
            account_id: "acct-1".into(),
            folder_id: "archive".into(),
            proactive: true,
        })
        .unwrap();
        assert_eq!(hook.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(hook.released.load(Ordering::SeqCst), 0);

        gate.add_permits(2);
        ctrl.wait_idle().await;
        // Release only fires after the debounce window.
        assert_eq!(hook.released.load(Ordering::SeqCst), 0);
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(hook.released.load(Ordering::SeqCst), 1);
        assert_eq!(hook.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_cycle_admits_producer_jobs() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        // Never-synced folder is stale by definition.
        seed_folder(&ctrl.inner.db, None);
        provider.push_delta(Ok(FolderDelta {
            added: vec![envelope("m1", "inbox", Utc::now())],
            updated: vec![],
            removed: vec![],
            next_token: "tok-1".into(),
        }));

        ctrl.run_cycle().unwrap();
        ctrl.wait_idle().await;

        let folder = folder_repo::get(&ctrl.inner.db, "inbox").unwrap().unwrap();
        assert_eq!(folder.sync_token.as_deref(), Some("tok-1"));
        assert!(message_repo::get_envelope(&ctrl.inner.db, "m1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_run_cycle_does_not_thrash_active_jobs() {
        let provider = Arc::new(ScriptedProvider::default());
        let ctrl = controller(provider.clone());
        seed_folder(&ctrl.inner.db, None);
        let gate = provider.install_gate();
        provider.push_delta(Ok(FolderDelta {
            added: vec![],
            updated: vec![],
            removed: vec![],
            next_token: "tok-1".into(),
        }));

        ctrl.run_cycle().unwrap();
        assert_eq!(ctrl.active_jobs(), 1);
        let score = ctrl.total_work_score();

        // Another cycle while the job is parked must not cancel-and-replace.
        ctrl.run_cycle().unwrap();
        assert_eq!(ctrl.active_jobs(), 1);
        assert_eq!(ctrl.total_work_score(), score);

        gate.add_permits(1);
        ctrl.wait_idle().await;
    }
}
