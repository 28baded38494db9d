pub mod artifacts;
pub mod backup;
pub mod docker;
pub mod ini;
pub mod install;
pub mod jobs;
pub mod lifecycle;
pub mod logs;
pub mod supervisor;

pub use artifacts::{generate, ArtifactError, ArtifactManifest, ArtifactWriter, RuntimeArtifact, WriteReport};
pub use backup::{BackupError, BackupInfo, FsSnapshotStore, SnapshotStore};
pub use docker::DockerSupervisor;
pub use install::{BinaryInstaller, InstallError, InstallReport};
pub use jobs::{JobError, JobHandle, JobKind, JobStatus, JobTracker, LifecycleJob};
pub use lifecycle::{
    BulkFailure, BulkResult, LifecycleError, LifecycleOrchestrator, LifecycleOutcome, OperationOptions,
    RestoreOptions, StopOptions,
};
pub use logs::{DockerLogs, LogError, LogSource, LogStream};
pub use supervisor::{ProcessSupervisor, ServerState, ServerStatus, SupervisorError};
