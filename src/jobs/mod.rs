//! Job manager - tracks long-running ingest and eval runs
//!
//! Each submitted job runs on its own tokio task, detached from the caller,
//! and is observed by polling [`JobManager::get_status`]. At most one job per
//! key is active at a time: a duplicate submission returns the active run id.
//!
//! Status is a closed tagged type ([`JobState`]); phase updates come only from
//! the job's own [`JobContext`] and are ignored once the run is terminal.
//! A job that panics is recorded as failed with code `internal_error`, which
//! also frees its key.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::Instrument;

use crate::error::{RagError, RagResult};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ingest,
    Eval,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Eval => "eval",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a run; each variant carries only the fields valid for it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobState<T> {
    Queued,
    Running {
        phase: String,
        progress: String,
    },
    Completed {
        output: T,
    },
    Failed {
        error: String,
        code: &'static str,
        /// Phase the run was in when it failed
        phase: Option<String>,
    },
}

impl<T> JobState<T> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord<T> {
    pub run_id: String,
    pub kind: JobKind,
    pub key: String,
    #[serde(flatten)]
    pub state: JobState<T>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<T> JobRecord<T> {
    pub fn status(&self) -> &'static str {
        self.state.label()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Current phase; terminal runs report `completed` or their failing phase
    pub fn phase(&self) -> &str {
        match &self.state {
            JobState::Queued => "queued",
            JobState::Running { phase, .. } => phase,
            JobState::Completed { .. } => "completed",
            JobState::Failed { phase, .. } => phase.as_deref().unwrap_or("failed"),
        }
    }

    pub fn progress(&self) -> &str {
        match &self.state {
            JobState::Running { progress, .. } => progress,
            _ => "",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&T> {
        match &self.state {
            JobState::Completed { output } => Some(output),
            _ => None,
        }
    }
    /// Output of a completed run, or its failure rebuilt as an error
    pub fn into_result(self) -> RagResult<T> {
        let service = self.kind.as_str();
        match self.state {
            JobState::Completed { output } => Ok(output),
            JobState::Failed { error, code, .. } => Err(match code {
                "cancelled" => RagError::Cancelled(error),
                "bad_request" => RagError::Validation(error),
                "configuration_error" => RagError::Configuration(error),
                "storage_error" => RagError::Storage(error),
                "internal_error" => RagError::Internal(error),
                "dependency_unavailable" => RagError::transient(service, error),
                _ => RagError::dependency(service, error),
            }),
            JobState::Queued | JobState::Running { .. } => Err(RagError::Validation(format!(
                "run {} has not finished",
                self.run_id
            ))),
        }
    }
}

/// Result of [`JobManager::submit`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub run_id: String,
    pub status: &'static str,
    /// `true` when an already active run was returned
    pub coalesced: bool,
}

// ============================================================================
// JobContext
// ============================================================================

trait PhaseSink: Send + Sync {
    fn set_phase(&self, run_id: &str, phase: &str, progress: &str);
}

struct NoopSink;

impl PhaseSink for NoopSink {
    fn set_phase(&self, _run_id: &str, _phase: &str, _progress: &str) {}
}

/// Cancellation flag that can also be awaited
#[derive(Default)]
struct CancelFlag {
    set: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            // registered before the check so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle a running job uses to report progress and observe cancellation
#[derive(Clone)]
pub struct JobContext {
    run_id: String,
    cancelled: Arc<CancelFlag>,
    sink: Arc<dyn PhaseSink>,
}

impl JobContext {
    /// Context not backed by a manager (CLI and tests)
    pub fn detached(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            cancelled: Arc::new(CancelFlag::default()),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Enter a new phase
    pub fn enter(&self, phase: &str, progress: impl AsRef<str>) {
        tracing::info!("Phase: {} {}", phase, progress.as_ref());
        self.sink.set_phase(&self.run_id, phase, progress.as_ref());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_set()
    }

    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Resolves once the run is cancelled
    pub async fn cancelled(&self) {
        self.cancelled.wait().await
    }

    /// Checked between stages
    pub fn check_cancelled(&self) -> RagResult<()> {
        if self.is_cancelled() {
            return Err(self.cancellation_error());
        }
        Ok(())
    }

    pub fn cancellation_error(&self) -> RagError {
        RagError::Cancelled(format!("run {} cancelled by company deletion", self.run_id))
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Entry<T> {
    record: JobRecord<T>,
    cancelled: Arc<CancelFlag>,
    done: watch::Sender<bool>,
}

struct Registry<T> {
    jobs: HashMap<String, Entry<T>>,
    /// Submission order
    order: Vec<String>,
    /// key -> active run id
    active: HashMap<String, String>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            active: HashMap::new(),
        }
    }
}

struct Shared<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Send + 'static> PhaseSink for Shared<T> {
    fn set_phase(&self, run_id: &str, phase: &str, progress: &str) {
        let mut registry = self.lock();
        if let Some(entry) = registry.jobs.get_mut(run_id) {
            if entry.record.is_terminal() {
                return;
            }
            entry.record.state = JobState::Running {
                phase: phase.to_string(),
                progress: progress.to_string(),
            };
            entry.record.updated_at = Utc::now();
        }
    }
}

// ============================================================================
// JobManager
// ============================================================================

pub struct JobManager<T> {
    kind: JobKind,
    shared: Arc<Shared<T>>,
    job_timeout: Option<Duration>,
}

impl<T> Clone for JobManager<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            shared: self.shared.clone(),
            job_timeout: self.job_timeout,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> JobManager<T> {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
            }),
            job_timeout: None,
        }
    }

    /// Overall wall-clock limit per run
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Start a job for `key`, or return the run already active for it
    pub fn submit<F, Fut>(&self, key: &str, job: F) -> Submission
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = RagResult<T>> + Send + 'static,
    {
        let mut registry = self.shared.lock();

        if let Some(run_id) = registry.active.get(key) {
            if let Some(entry) = registry.jobs.get(run_id) {
                tracing::info!("Coalesced {} request for '{}' into {}", self.kind, key, run_id);
                return Submission {
                    run_id: run_id.clone(),
                    status: entry.record.status(),
                    coalesced: true,
                };
            }
        }

        let now = Utc::now();
        let run_id = new_run_id(self.kind, key, now);
        let cancelled = Arc::new(CancelFlag::default());
        let (done, _) = watch::channel(false);

        registry.jobs.insert(
            run_id.clone(),
            Entry {
                record: JobRecord {
                    run_id: run_id.clone(),
                    kind: self.kind,
                    key: key.to_string(),
                    state: JobState::Queued,
                    created_at: now,
                    updated_at: now,
                },
                cancelled: cancelled.clone(),
                done,
            },
        );
        registry.order.push(run_id.clone());
        registry.active.insert(key.to_string(), run_id.clone());
        drop(registry);

        let ctx = JobContext {
            run_id: run_id.clone(),
            cancelled,
            sink: self.shared.clone(),
        };

        let span = tracing::info_span!("job", run_id = %run_id, kind = %self.kind, key = %key);
        let manager = self.clone();
        let task_run_id = run_id.clone();
        let work = execute(job, ctx.clone(), self.job_timeout);

        tokio::spawn(
            async move {
                tracing::info!("Job started");
                // inner task so a panic still lands in `finish`
                let result = match tokio::spawn(work.in_current_span()).await {
                    Ok(result) => result,
                    Err(err) => Err(RagError::Internal(join_error_message(err))),
                };
                manager.finish(&task_run_id, &ctx, result);
            }
            .instrument(span),
        );

        Submission {
            run_id,
            status: "queued",
            coalesced: false,
        }
    }

    fn finish(&self, run_id: &str, ctx: &JobContext, result: RagResult<T>) {
        // a cancelled run never reports success
        let result = match result {
            Ok(_) if ctx.is_cancelled() => Err(ctx.cancellation_error()),
            other => other,
        };

        let mut registry = self.shared.lock();
        let Some(entry) = registry.jobs.get_mut(run_id) else {
            return;
        };

        let phase = match &entry.record.state {
            JobState::Running { phase, .. } => Some(phase.clone()),
            _ => None,
        };

        entry.record.state = match result {
            Ok(output) => {
                tracing::info!("Job completed");
                JobState::Completed { output }
            }
            Err(err) => {
                tracing::error!("Job failed in phase {:?}: {}", phase, err);
                JobState::Failed {
                    error: err.to_string(),
                    code: err.code(),
                    phase,
                }
            }
        };
        entry.record.updated_at = Utc::now();
        entry.done.send_replace(true);

        let key = entry.record.key.clone();
        if registry.active.get(&key).map(String::as_str) == Some(run_id) {
            registry.active.remove(&key);
        }
    }

    /// Snapshot of a run
    pub fn get_status(&self, run_id: &str) -> RagResult<JobRecord<T>> {
        self.shared
            .lock()
            .jobs
            .get(run_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| RagError::not_found("run", run_id))
    }

    /// Most recent run for a key, active or not
    pub fn latest_for_key(&self, key: &str) -> Option<JobRecord<T>> {
        let registry = self.shared.lock();
        registry
            .order
            .iter()
            .rev()
            .filter_map(|id| registry.jobs.get(id))
            .find(|e| e.record.key == key)
            .map(|e| e.record.clone())
    }

    pub fn active_run(&self, key: &str) -> Option<String> {
        self.shared.lock().active.get(key).cloned()
    }

    /// All runs in submission order
    pub fn list(&self) -> Vec<JobRecord<T>> {
        let registry = self.shared.lock();
        registry
            .order
            .iter()
            .filter_map(|id| registry.jobs.get(id))
            .map(|e| e.record.clone())
            .collect()
    }

    /// Wait until a run reaches a terminal state
    pub async fn wait(&self, run_id: &str) -> RagResult<JobRecord<T>> {
        let mut done = {
            let registry = self.shared.lock();
            let entry = registry
                .jobs
                .get(run_id)
                .ok_or_else(|| RagError::not_found("run", run_id))?;
            entry.done.subscribe()
        };

        // sender lives in the registry; an error only means the record was cleared
        let _ = done.wait_for(|finished| *finished).await;
        self.get_status(run_id)
    }

    /// Drop a terminal run record
    pub fn clear(&self, run_id: &str) -> RagResult<()> {
        let mut registry = self.shared.lock();
        let entry = registry
            .jobs
            .get(run_id)
            .ok_or_else(|| RagError::not_found("run", run_id))?;
        if !entry.record.is_terminal() {
            return Err(RagError::Validation(format!("run {} is still active", run_id)));
        }
        registry.jobs.remove(run_id);
        registry.order.retain(|id| id != run_id);
        Ok(())
    }

    /// Cancel the active run for `key` and wait for it to wind down
    ///
    /// Returns the cancelled run id, or `None` when nothing was active.
    pub async fn cancel_and_wait(&self, key: &str, grace: Duration) -> RagResult<Option<String>> {
        let run_id = {
            let registry = self.shared.lock();
            let Some(run_id) = registry.active.get(key).cloned() else {
                return Ok(None);
            };
            if let Some(entry) = registry.jobs.get(&run_id) {
                entry.cancelled.cancel();
            }
            run_id
        };

        tracing::info!("Cancelling {} run {} for '{}'", self.kind, run_id, key);
        tokio::time::timeout(grace, self.wait(&run_id))
            .await
            .map_err(|_| RagError::Timeout(grace))??;
        Ok(Some(run_id))
    }
}

async fn execute<T, F, Fut>(job: F, ctx: JobContext, limit: Option<Duration>) -> RagResult<T>
where
    F: FnOnce(JobContext) -> Fut,
    Fut: Future<Output = RagResult<T>>,
{
    let fut = job(ctx);
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(RagError::Timeout(limit))),
        None => fut.await,
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("job task aborted: {}", err);
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("job panicked: {}", message)
}

/// `{kind}-{key}-{YYYYmmdd-HHMMSS}-{8 hex}`
fn new_run_id(kind: JobKind, key: &str, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", kind, key, now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

// ============================================================================
// Tests
// ============================================================================
