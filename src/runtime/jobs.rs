//! Job tracker for long-running operations
//!
//! Jobs run on their own tokio task. Every job ends in exactly one terminal
//! state (`completed`, `failed`, `cancelled`), including when its body
//! returns an error or panics. The tracker journals jobs to JSON so a new
//! process can reconcile jobs an old one never finished.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error recorded on jobs found unfinished at startup
pub const INTERRUPTED: &str = "Interrupted";

/// Finished jobs older than this are dropped unless configured otherwise
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {id} already {status}")]
    AlreadyFinished { id: Uuid, status: JobStatus },

    #[error("Job journal error: {0}")]
    Journal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CreateCluster,
    InstallBinaries,
    UpdateAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleJob {
    /// Job id
    pub id: Uuid,
    /// What the job does
    pub kind: JobKind,
    /// Cluster or server the job acts on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// 0..=100, never decreasing
    pub progress: u8,
    /// Latest progress message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Body result once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl LifecycleJob {
    fn new(kind: JobKind, target: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Jobs a previous process left unfinished become failed/Interrupted.
/// Returns how many were reconciled.
pub fn reconcile_interrupted(jobs: &mut [LifecycleJob], now: DateTime<Utc>) -> usize {
    let mut count = 0;
    for job in jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
        job.status = JobStatus::Failed;
        job.error = Some(INTERRUPTED.to_string());
        job.updated_at = now;
        count += 1;
    }
    count
}

/// Whether a job finished more than `retention` before `now`
pub fn is_expired(job: &LifecycleJob, now: DateTime<Utc>, retention: Duration) -> bool {
    match chrono::Duration::from_std(retention) {
        Ok(retention) => job.status.is_terminal() && now - job.updated_at > retention,
        Err(_) => false,
    }
}

/// Apply a progress report; progress never goes backwards
pub fn apply_progress(job: &mut LifecycleJob, percent: u8) -> bool {
    let percent = percent.min(100);
    if job.status.is_terminal() || percent <= job.progress {
        return false;
    }
    job.progress = percent;
    true
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<DashMap<Uuid, LifecycleJob>>,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
    journal: Option<PathBuf>,
    journal_lock: Arc<Mutex<()>>,
    retention: Duration,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self {
            jobs: Arc::default(),
            tokens: Arc::default(),
            journal: None,
            journal_lock: Arc::default(),
            retention: DEFAULT_RETENTION,
        }
    }
}

impl JobTracker {
    /// Tracker without a journal
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Open (or create) a journaled tracker, reconciling unfinished jobs and
    /// dropping finished ones older than `retention`
    pub async fn open(journal: impl Into<PathBuf>, retention: Duration) -> Result<Self, JobError> {
        let journal = journal.into();
        let mut jobs: Vec<LifecycleJob> = match tokio::fs::read_to_string(&journal).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| JobError::Journal(format!("{}: {}", journal.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(JobError::Journal(format!("{}: {}", journal.display(), e))),
        };

        let interrupted = reconcile_interrupted(&mut jobs, Utc::now());
        if interrupted > 0 {
            warn!("Marked {} unfinished job(s) from a previous run as failed", interrupted);
        }

        let tracker = Self {
            jobs: Arc::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
            journal: Some(journal),
            retention,
            ..Default::default()
        };
        tracker.prune();
        tracker.persist().await?;
        Ok(tracker)
    }

    async fn persist(&self) -> Result<(), JobError> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let _guard = self.journal_lock.lock().await;
        let mut jobs: Vec<LifecycleJob> = self.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);

        let content = serde_json::to_vec_pretty(&jobs).map_err(|e| JobError::Journal(e.to_string()))?;
        let io = |e: std::io::Error| JobError::Journal(format!("{}: {}", path.display(), e));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(io)?;
        tokio::fs::rename(&tmp, path).await.map_err(io)
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!("{}", e);
        }
    }

    /// Drop finished jobs past the retention window. Returns how many went.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !is_expired(job, now, self.retention));
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            debug!("Pruned {} finished job(s)", pruned);
        }
        pruned
    }

    fn update<F: FnOnce(&mut LifecycleJob)>(&self, id: Uuid, f: F) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            f(&mut job);
            job.updated_at = Utc::now();
        }
    }

    /// Move a job to a terminal state; a job already terminal is left as is
    fn finish(&self, id: Uuid, status: JobStatus, result: Option<Value>, err: Option<String>) -> bool {
        let mut changed = false;
        if let Some(mut job) = self.jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = status;
                if status == JobStatus::Completed {
                    job.progress = 100;
                }
                job.result = result;
                job.error = err;
                job.updated_at = Utc::now();
                changed = true;
            }
        }
        self.tokens.remove(&id);
        changed
    }

    /// Start a job and return its id immediately
    pub async fn enqueue<F, Fut>(&self, kind: JobKind, target: Option<String>, work: F) -> Uuid
    where
        F: FnOnce(JobHandle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let job = LifecycleJob::new(kind, target);
        let id = job.id;
        let token = CancellationToken::new();
        self.jobs.insert(id, job);
        self.tokens.insert(id, token.clone());
        self.persist_logged().await;
        debug!("Enqueued {:?} job {}", kind, id);

        let tracker = self.clone();
        let handle = JobHandle {
            id,
            tracker: self.clone(),
            token: token.clone(),
        };
        tokio::spawn(async move {
            tracker.update(id, |j| {
                if j.status == JobStatus::Pending {
                    j.status = JobStatus::Running;
                }
            });
            tracker.persist_logged().await;

            let mut body = tokio::spawn(work(handle));
            let changed = tokio::select! {
                joined = &mut body => match joined {
                    Ok(Ok(value)) => {
                        info!("Job {} completed", id);
                        tracker.finish(id, JobStatus::Completed, Some(value), None)
                    }
                    Ok(Err(e)) => {
                        warn!("Job {} failed: {:#}", id, e);
                        tracker.finish(id, JobStatus::Failed, None, Some(format!("{:#}", e)))
                    }
                    Err(join_err) => {
                        let reason = if join_err.is_panic() {
                            format!("Job panicked: {}", panic_message(join_err.into_panic()))
                        } else {
                            "Job task aborted".to_string()
                        };
                        error!("Job {} failed: {}", id, reason);
                        tracker.finish(id, JobStatus::Failed, None, Some(reason))
                    }
                },
                // The body keeps running detached; its effects are reconciled
                // by the next status poll.
                _ = token.cancelled() => tracker.finish(id, JobStatus::Cancelled, None, None),
            };
            if changed {
                tracker.prune();
                tracker.persist_logged().await;
            }
        });

        id
    }

    pub fn status(&self, id: Uuid) -> Option<LifecycleJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<LifecycleJob> {
        let mut jobs: Vec<LifecycleJob> = self.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Request cancellation. The job is marked cancelled right away; its body
    /// is expected to notice through `JobHandle::is_cancelled`.
    pub async fn cancel(&self, id: Uuid) -> Result<LifecycleJob, JobError> {
        let job = self.status(id).ok_or(JobError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(JobError::AlreadyFinished {
                id,
                status: job.status,
            });
        }
        if let Some(token) = self.tokens.get(&id) {
            token.cancel();
        }
        if self.finish(id, JobStatus::Cancelled, None, None) {
            info!("Job {} cancelled", id);
            self.persist_logged().await;
        }
        self.status(id).ok_or(JobError::NotFound(id))
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Option<LifecycleJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.status(id)?;
            if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Some(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Given to a job body to report progress and observe cancellation
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    tracker: JobTracker,
    token: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        self.tracker.update(self.id, |job| {
            if !job.status.is_terminal() {
                apply_progress(job, percent);
                job.message = Some(message);
            }
        });
    }

    pub fn message(&self, message: impl Into<String>) {
        let message = message.into();
        self.tracker.update(self.id, |job| {
            if !job.status.is_terminal() {
                job.message = Some(message);
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
