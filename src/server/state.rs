use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cluster::service::ClusterService;
use crate::cluster::store::{ConfigStore, FileStore};
use crate::config::{ConfigError, ManagerConfig};
use crate::runtime::{
    ArtifactWriter, BinaryInstaller, DockerLogs, DockerSupervisor, FsSnapshotStore, JobError,
    JobTracker, LifecycleOrchestrator, LogSource, ProcessSupervisor, SnapshotStore,
};

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Jobs(#[from] JobError),
}

/// Directory layout under the data dir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    /// Cluster records and global config
    pub store: PathBuf,
    /// One directory per server: generated files and save data
    pub servers: PathBuf,
    /// Backup snapshots
    pub backups: PathBuf,
    /// Job journal
    pub journal: PathBuf,
}

impl DataLayout {
    pub fn under(root: &Path) -> Self {
        Self {
            store: root.join("store"),
            servers: root.join("servers"),
            backups: root.join("backups"),
            journal: root.join("jobs.json"),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ClusterService>,
    pub logs: Arc<dyn LogSource>,
}

impl AppState {
    pub fn new(service: Arc<ClusterService>, logs: Arc<dyn LogSource>) -> Self {
        Self { service, logs }
    }

    /// Wire the docker-backed stack from the manager config
    pub async fn from_config(config: &ManagerConfig) -> Result<Self, StateError> {
        let layout = DataLayout::under(&config.data_path()?);
        info!("Data directory layout: {:?}", layout);

        let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(&layout.store));
        let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(DockerSupervisor::new(
            config.supervisor.clone(),
            &layout.servers,
        ));
        let snapshots: Arc<dyn SnapshotStore> =
            Arc::new(FsSnapshotStore::new(&layout.servers, &layout.backups));
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            supervisor,
            snapshots,
            config.lifecycle.clone(),
        ));
        let jobs = JobTracker::open(&layout.journal, config.lifecycle.job_retention()).await?;
        let installer = BinaryInstaller::new(config.install.clone(), config.install_path()?);

        let service = ClusterService::new(store, ArtifactWriter::new(&layout.servers), orchestrator, jobs)
            .with_installer(installer);
        let logs = Arc::new(DockerLogs::new(config.supervisor.docker_binary.clone()));

        Ok(Self::new(Arc::new(service), logs))
    }
}
