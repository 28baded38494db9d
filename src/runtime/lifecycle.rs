//! Lifecycle orchestration of individual servers
//!
//! State machine per server:
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//!            restarting = stop + start
//!            unknown    <- any state, on a failed query or a timeout
//! ```
//!
//! Operations on the same server name are serialized through a per-name
//! mutex; different names run in parallel. Every supervisor call is bounded
//! by a timeout. A timed-out call leaves the server `unknown` and the next
//! status poll reconciles it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::artifacts::RuntimeArtifact;
use super::backup::{is_backup_id, BackupError, BackupInfo, SnapshotStore};
use super::supervisor::{ProcessSupervisor, ServerState, ServerStatus, SupervisorError};
use crate::cluster::server::ServerSpec;
use crate::config::LifecycleConfig;

/// Servers updated concurrently by `update_all`
const BULK_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("{operation} of '{name}' timed out after {timeout:?}; state is unknown until the next status poll")]
    OperationTimedOut {
        name: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Command failed for '{name}': {message}")]
    CommandFailed { name: String, message: String },

    #[error("Restart of '{name}' incomplete: stopped but failed to start again ({reason}); manual intervention needed")]
    RestartIncomplete { name: String, reason: String },

    #[error("Server '{0}' is running; stop it first")]
    ServerRunning(String),

    #[error("Operation '{0}' not supported by the supervisor")]
    Unsupported(&'static str),

    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl From<SupervisorError> for LifecycleError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Unavailable(msg) => LifecycleError::SupervisorUnavailable(msg),
            SupervisorError::NotFound(name) => LifecycleError::NotFound(name),
            SupervisorError::CommandFailed { name, message } => {
                LifecycleError::CommandFailed { name, message }
            }
            SupervisorError::Unsupported(op) => LifecycleError::Unsupported(op),
        }
    }
}

/// Result of a state-changing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleOutcome {
    Applied,
    /// The server was already in the requested state; nothing was done
    AlreadyInState,
}

/// Caller-supplied deadline for a start or restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationOptions {
    /// Overrides the configured operation timeout (seconds)
    pub timeout_secs: Option<u64>,
}

impl OperationOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopOptions {
    /// Stop without the world save
    pub skip_save: bool,
    /// Overrides the configured operation timeout (seconds)
    pub timeout_secs: Option<u64>,
}

impl StopOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    /// Stop a running server (with save) instead of refusing
    pub stop_first: bool,
    /// Start the server once the files are restored
    pub start_after: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    /// Server name
    pub name: String,
    /// Why it failed
    pub error: String,
}

/// Per-server outcome of a bulk operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    /// Servers updated, in request order
    pub successful: Vec<String>,
    /// Servers that failed, with reasons
    pub failed: Vec<BulkFailure>,
    /// Servers attempted
    pub total_processed: usize,
}

impl BulkResult {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.name.as_str()).collect()
    }
}

pub struct LifecycleOrchestrator {
    supervisor: Arc<dyn ProcessSupervisor>,
    snapshots: Arc<dyn SnapshotStore>,
    config: LifecycleConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, ServerState>,
}

impl LifecycleOrchestrator {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        snapshots: Arc<dyn SnapshotStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            supervisor,
            snapshots,
            config,
            locks: DashMap::new(),
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn set_state(&self, name: &str, state: ServerState) {
        self.states.insert(name.to_string(), state);
    }

    /// Last state observed or set by the orchestrator
    pub fn cached_state(&self, name: &str) -> Option<ServerState> {
        self.states.get(name).map(|s| *s)
    }

    /// Run a supervisor call with a deadline; on expiry the server becomes `unknown`
    async fn bounded<T, F>(
        &self,
        name: &str,
        operation: &'static str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, SupervisorError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(LifecycleError::from),
            Err(_) => {
                warn!("{} of '{}' timed out after {:?}", operation, name, timeout);
                self.set_state(name, ServerState::Unknown);
                Err(LifecycleError::OperationTimedOut {
                    name: name.to_string(),
                    operation,
                    timeout,
                })
            }
        }
    }

    /// Query the supervisor; a failed query (other than an unknown name)
    /// marks the server `unknown`.
    async fn observe(&self, name: &str) -> Result<ServerState, LifecycleError> {
        let timeout = self.config.operation_timeout();
        match self
            .bounded(name, "status", timeout, self.supervisor.status(name))
            .await
        {
            Ok(status) => {
                self.set_state(name, status.status);
                Ok(status.status)
            }
            Err(LifecycleError::NotFound(n)) => {
                self.states.remove(name);
                Err(LifecycleError::NotFound(n))
            }
            Err(e) => {
                self.set_state(name, ServerState::Unknown);
                Err(e)
            }
        }
    }

    /// Issue the world save; failures are logged and swallowed
    async fn save_world(&self, name: &str) {
        let command = self.config.save_command.clone();
        let timeout = self.config.save_timeout();
        match self
            .bounded(name, "save", timeout, self.supervisor.exec(name, &command))
            .await
        {
            Ok(output) => debug!("Save on '{}': {}", name, output),
            Err(e) => warn!("Save before shutdown of '{}' failed, continuing: {}", name, e),
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Current status, reconciled from the supervisor.
    ///
    /// While another operation holds the server, the in-flight state is
    /// reported instead of waiting for it.
    pub async fn status(&self, name: &str) -> Result<ServerStatus, LifecycleError> {
        let lock = self.lock_for(name);
        if lock.try_lock().is_err() {
            if let Some(state) = self.cached_state(name).filter(|s| s.is_transitional()) {
                return Ok(ServerStatus::new(name, state));
            }
        }

        let timeout = self.config.operation_timeout();
        match self
            .bounded(name, "status", timeout, self.supervisor.status(name))
            .await
        {
            Ok(status) => {
                self.set_state(name, status.status);
                Ok(status)
            }
            Err(LifecycleError::NotFound(n)) => Err(LifecycleError::NotFound(n)),
            Err(e) => {
                self.set_state(name, ServerState::Unknown);
                Err(e)
            }
        }
    }

    /// Status of many servers; failed queries are reported as `unknown`
    pub async fn status_all(&self, names: &[String]) -> Vec<ServerStatus> {
        let queries = names.iter().map(|name| async move {
            self.status(name)
                .await
                .unwrap_or_else(|_| ServerStatus::new(name.clone(), ServerState::Unknown))
        });
        futures::future::join_all(queries).await
    }

    // ------------------------------------------------------------------------
    // Start / stop / restart
    // ------------------------------------------------------------------------

    pub async fn start(&self, name: &str) -> Result<LifecycleOutcome, LifecycleError> {
        self.start_with_timeout(name, self.config.operation_timeout())
            .await
    }

    pub async fn start_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.start_locked(name, timeout).await
    }

    async fn start_locked(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let current = self.observe(name).await?;
        if current == ServerState::Running {
            debug!("'{}' already running", name);
            return Ok(LifecycleOutcome::AlreadyInState);
        }

        self.set_state(name, ServerState::Starting);
        match self
            .bounded(name, "start", timeout, self.supervisor.start(name))
            .await
        {
            Ok(()) => {
                self.set_state(name, ServerState::Running);
                info!("Started '{}'", name);
                Ok(LifecycleOutcome::Applied)
            }
            Err(e @ LifecycleError::OperationTimedOut { .. }) => Err(e),
            Err(e) => {
                // A failed start does not change what the server is
                self.set_state(name, current);
                Err(e)
            }
        }
    }

    pub async fn stop(&self, name: &str) -> Result<LifecycleOutcome, LifecycleError> {
        self.stop_with(name, StopOptions::default()).await
    }

    pub async fn stop_with(
        &self,
        name: &str,
        options: StopOptions,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let timeout = options.timeout().unwrap_or(self.config.operation_timeout());
        self.stop_locked(name, options.skip_save, timeout).await
    }

    async fn stop_locked(
        &self,
        name: &str,
        skip_save: bool,
        timeout: Duration,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let current = self.observe(name).await?;
        if current == ServerState::Stopped {
            debug!("'{}' already stopped", name);
            return Ok(LifecycleOutcome::AlreadyInState);
        }

        if self.config.save_before_stop && !skip_save {
            self.save_world(name).await;
        }

        self.set_state(name, ServerState::Stopping);
        match self
            .bounded(name, "stop", timeout, self.supervisor.stop(name))
            .await
        {
            Ok(()) => {
                self.set_state(name, ServerState::Stopped);
                info!("Stopped '{}'", name);
                Ok(LifecycleOutcome::Applied)
            }
            Err(e @ LifecycleError::OperationTimedOut { .. }) => Err(e),
            Err(e) => {
                self.set_state(name, current);
                Err(e)
            }
        }
    }

    pub async fn restart(&self, name: &str) -> Result<LifecycleOutcome, LifecycleError> {
        self.restart_with_timeout(name, self.config.operation_timeout())
            .await
    }

    /// Restart with `timeout` applied to every supervisor call it makes
    pub async fn restart_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let current = self.observe(name).await?;
        if current != ServerState::Running {
            return self.start_locked(name, timeout).await;
        }

        if self.config.save_before_stop {
            self.save_world(name).await;
        }

        self.set_state(name, ServerState::Restarting);
        match self
            .bounded(name, "restart", timeout, self.supervisor.restart(name))
            .await
        {
            Ok(()) => {
                self.set_state(name, ServerState::Running);
                info!("Restarted '{}'", name);
                return Ok(LifecycleOutcome::Applied);
            }
            Err(LifecycleError::Unsupported(_)) => {
                debug!("No native restart for '{}', composing stop + start", name)
            }
            Err(e @ LifecycleError::OperationTimedOut { .. }) => return Err(e),
            Err(e) => {
                self.set_state(name, current);
                return Err(e);
            }
        }

        // Saved above already
        self.stop_locked(name, true, timeout).await?;
        self.start_after_stop(name, timeout).await
    }

    /// Start a server this orchestrator just stopped; a failure is reported
    /// as an incomplete restart.
    async fn start_after_stop(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        match self.start_locked(name, timeout).await {
            Ok(_) => Ok(LifecycleOutcome::Applied),
            Err(e) => {
                warn!("'{}' stopped but did not come back: {}", name, e);
                Err(LifecycleError::RestartIncomplete {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // RCON
    // ------------------------------------------------------------------------

    pub async fn rcon(&self, name: &str, command: &str) -> Result<String, LifecycleError> {
        let timeout = self.config.operation_timeout();
        self.bounded(name, "rcon", timeout, self.supervisor.exec(name, command))
            .await
    }

    // ------------------------------------------------------------------------
    // Backup / restore
    // ------------------------------------------------------------------------

    /// Snapshot a server's data; a running server saves its world first
    pub async fn backup(&self, name: &str, label: Option<&str>) -> Result<BackupInfo, LifecycleError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        match self.observe(name).await {
            Ok(ServerState::Running) => self.save_world(name).await,
            // Files can be copied without a container
            Ok(_) | Err(LifecycleError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(self.snapshots.snapshot(name, label).await?)
    }

    pub async fn list_backups(&self, name: &str) -> Result<Vec<BackupInfo>, LifecycleError> {
        Ok(self.snapshots.list(name).await?)
    }

    pub async fn restore(
        &self,
        name: &str,
        backup: &str,
        options: RestoreOptions,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        if !is_backup_id(backup) {
            return Err(BackupError::NotFound {
                server: name.to_string(),
                backup: backup.to_string(),
            }
            .into());
        }
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let state = match self.observe(name).await {
            Ok(state) => state,
            Err(LifecycleError::NotFound(_)) => ServerState::Stopped,
            Err(e) => return Err(e),
        };
        if state != ServerState::Stopped {
            if !options.stop_first {
                return Err(LifecycleError::ServerRunning(name.to_string()));
            }
            self.stop_locked(name, false, self.config.operation_timeout()).await?;
        }

        self.snapshots.restore(name, backup).await?;

        if options.start_after {
            self.start_locked(name, self.config.operation_timeout())
                .await?;
        }
        Ok(LifecycleOutcome::Applied)
    }

    // ------------------------------------------------------------------------
    // Update / remove
    // ------------------------------------------------------------------------

    /// Apply freshly generated artifacts to a server: re-provision it and,
    /// if it was running, bring it back up.
    pub async fn update(
        &self,
        spec: &ServerSpec,
        artifact: &RuntimeArtifact,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let name = spec.name.as_str();
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let was_running = match self.observe(name).await {
            Ok(state) => state == ServerState::Running,
            Err(LifecycleError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if was_running {
            self.stop_locked(name, false, self.config.operation_timeout()).await?;
        }

        let timeout = self.config.operation_timeout();
        match self
            .bounded(name, "provision", timeout, self.supervisor.provision(spec, artifact))
            .await
        {
            Ok(()) => debug!("Provisioned '{}'", name),
            Err(LifecycleError::Unsupported(_)) => {}
            Err(e) if was_running => {
                return Err(LifecycleError::RestartIncomplete {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        }

        if was_running {
            self.start_after_stop(name, timeout).await?;
        }
        info!("Updated '{}'", name);
        Ok(LifecycleOutcome::Applied)
    }

    /// Update many servers. One failure never aborts the others; `progress`
    /// is called with (done, total) after each server.
    pub async fn update_all<P>(&self, items: &[(ServerSpec, RuntimeArtifact)], progress: P) -> BulkResult
    where
        P: Fn(usize, usize) + Send + Sync,
    {
        let total = items.len();
        let done = AtomicUsize::new(0);

        let permits = Semaphore::new(BULK_CONCURRENCY);
        let updates = items.iter().map(|(spec, artifact)| {
            let done = &done;
            let progress = &progress;
            let permits = &permits;
            async move {
                let result = match permits.acquire().await {
                    Ok(_permit) => self.update(spec, artifact).await,
                    Err(e) => Err(LifecycleError::SupervisorUnavailable(e.to_string())),
                };
                progress(done.fetch_add(1, Ordering::SeqCst) + 1, total);
                (spec.name.clone(), result)
            }
        });
        let outcomes = join_all(updates).await;

        let mut result = BulkResult {
            total_processed: outcomes.len(),
            ..Default::default()
        };
        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => result.successful.push(name),
                Err(e) => {
                    warn!("Update of '{}' failed: {}", name, e);
                    result.failed.push(BulkFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Bulk update: {} ok, {} failed of {}",
            result.successful.len(),
            result.failed.len(),
            result.total_processed
        );
        result
    }

    /// Stop (with save) and remove a server's runnable unit. Best effort:
    /// an unknown or already removed server is not an error.
    pub async fn decommission(&self, name: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(name);
        {
            let _guard = lock.lock().await;
            match self.observe(name).await {
                Ok(ServerState::Stopped) | Err(LifecycleError::NotFound(_)) => {}
                Ok(_) => {
                    if let Err(e) = self.stop_locked(name, false, self.config.operation_timeout()).await {
                        warn!("Could not stop '{}' before removal: {}", name, e);
                    }
                }
                Err(e) => return Err(e),
            }

            let timeout = self.config.operation_timeout();
            match self
                .bounded(name, "remove", timeout, self.supervisor.remove(name))
                .await
            {
                Ok(()) | Err(LifecycleError::NotFound(_)) | Err(LifecycleError::Unsupported(_)) => {}
                Err(e) => return Err(e),
            }
            self.states.remove(name);
            // Drop the entry only when no other caller holds or waits on it
            self.locks.remove_if(name, |_, held| Arc::strong_count(held) == 2);
        }
        info!("Decommissioned '{}'", name);
        Ok(())
    }
}
