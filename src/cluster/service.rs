//! ClusterService - the entry point for every cluster mutation
//!
//! Planning, persisting and materializing clusters happens here. All
//! mutations hold one planning lock, so a plan always sees a consistent
//! snapshot of the ports other clusters use and two concurrent creations can
//! never hand out the same port.
//!
//! Stopping servers can take minutes, so servers leaving a plan are only
//! picked under the lock and decommissioned after it is released. Until that
//! finishes their names cannot be planned again.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::planner::{ClusterPlanner, ClusterRequest, ClusterSpec, PlanError};
use super::ports::{port_table, PortTable};
use super::server::ServerSpec;
use super::store::{ConfigStore, StoreError};
use crate::config::GlobalConfig;
use crate::runtime::artifacts::{generate, ArtifactError, ArtifactManifest, ArtifactWriter, RuntimeArtifact, WriteReport};
use crate::runtime::install::BinaryInstaller;
use crate::runtime::jobs::{JobError, JobKind, JobTracker};
use crate::runtime::lifecycle::{LifecycleError, LifecycleOrchestrator};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Cluster '{0}' already exists")]
    ClusterExists(String),

    #[error("Server '{0}' is still being decommissioned")]
    ServerRetiring(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Cannot delete '{server}': only the last server of {map} can be removed ({last})")]
    NotLastOfMap {
        server: String,
        map: String,
        last: String,
    },

    #[error("Binary installation is not configured")]
    InstallUnavailable,
}

/// Outcome of (re)applying a request to a cluster
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    /// Cluster as stored
    pub cluster: ClusterSpec,
    /// Write report per server
    pub artifacts: BTreeMap<String, WriteReport>,
    /// Servers that dropped out of the plan and were decommissioned
    pub removed: Vec<String>,
}

/// Generated artifacts of one server next to what is on disk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactView {
    /// Artifacts as they would be generated now
    pub artifact: RuntimeArtifact,
    /// What was last written to disk
    pub manifest: ArtifactManifest,
    /// Whether disk holds exactly the current generation
    pub up_to_date: bool,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Ports used by every stored cluster except `except`
pub fn ports_outside(clusters: &[ClusterSpec], except: &str) -> PortTable {
    port_table(
        clusters
            .iter()
            .filter(|c| c.name != except)
            .flat_map(|c| c.servers.iter().map(|s| (s.name.as_str(), &s.ports))),
    )
}

/// Request with one server removed from the selection.
///
/// Only the highest-numbered server of a map can go; removing any other
/// would renumber the ones after it.
pub fn request_without(cluster: &ClusterSpec, server: &str) -> Result<ClusterRequest, ServiceError> {
    let target = cluster
        .server(server)
        .ok_or_else(|| ServiceError::ServerNotFound(server.to_string()))?;
    let last = cluster
        .servers
        .iter()
        .rfind(|s| s.map == target.map)
        .map(|s| s.name.clone())
        .unwrap_or_default();
    if last != server {
        return Err(ServiceError::NotLastOfMap {
            server: server.to_string(),
            map: target.map.to_string(),
            last,
        });
    }

    let mut request = cluster.to_request();
    for sel in request.maps.iter_mut().filter(|s| s.map == target.map) {
        sel.count -= 1;
    }
    request.maps.retain(|s| s.count > 0);
    request.overrides.remove(server);
    request.mods.server_mods.remove(server);
    Ok(request)
}

/// Stored cluster whose name matches `name` ignoring ASCII case
pub fn name_clash<'a>(clusters: &'a [ClusterSpec], name: &str) -> Option<&'a ClusterSpec> {
    clusters.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Servers of `old` that are not in `new`
pub fn dropped_servers(old: &ClusterSpec, new: &ClusterSpec) -> Vec<String> {
    let kept: HashSet<&str> = new.servers.iter().map(|s| s.name.as_str()).collect();
    old.servers
        .iter()
        .filter(|s| !kept.contains(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect()
}

// ============================================================================
// Service
// ============================================================================

pub struct ClusterService {
    store: Arc<dyn ConfigStore>,
    writer: ArtifactWriter,
    orchestrator: Arc<LifecycleOrchestrator>,
    jobs: JobTracker,
    installer: Option<Arc<BinaryInstaller>>,
    planning: Mutex<()>,
    retiring: DashSet<String>,
}

impl ClusterService {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        writer: ArtifactWriter,
        orchestrator: Arc<LifecycleOrchestrator>,
        jobs: JobTracker,
    ) -> Self {
        Self {
            store,
            writer,
            orchestrator,
            jobs,
            installer: None,
            planning: Mutex::new(()),
            retiring: DashSet::new(),
        }
    }

    pub fn with_installer(mut self, installer: BinaryInstaller) -> Self {
        self.installer = Some(Arc::new(installer));
        self
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn list(&self) -> Result<Vec<ClusterSpec>, ServiceError> {
        Ok(self.store.list_clusters().await?)
    }

    pub async fn get(&self, name: &str) -> Result<ClusterSpec, ServiceError> {
        self.store
            .get_cluster(name)
            .await?
            .ok_or_else(|| ServiceError::ClusterNotFound(name.to_string()))
    }

    /// Find the cluster owning a server
    pub async fn locate(&self, server: &str) -> Result<(ClusterSpec, ServerSpec), ServiceError> {
        for cluster in self.store.list_clusters().await? {
            if let Some(spec) = cluster.server(server).cloned() {
                return Ok((cluster, spec));
            }
        }
        Err(ServiceError::ServerNotFound(server.to_string()))
    }

    /// Every server, optionally leaving out hidden ones
    pub async fn servers(&self, include_hidden: bool) -> Result<Vec<ServerSpec>, ServiceError> {
        let global = self.store.get_global().await?;
        Ok(self
            .store
            .list_clusters()
            .await?
            .into_iter()
            .flat_map(|c| c.servers)
            .filter(|s| include_hidden || !global.is_hidden(&s.name))
            .collect())
    }

    pub async fn global(&self) -> Result<GlobalConfig, ServiceError> {
        Ok(self.store.get_global().await?)
    }

    pub async fn set_global(&self, config: &GlobalConfig) -> Result<(), ServiceError> {
        self.store.put_global(config).await?;
        info!(
            "Global config updated ({} excluded, {} hidden)",
            config.excluded_servers.len(),
            config.hidden_servers.len()
        );
        Ok(())
    }

    /// Current generation of a server's artifacts and the manifest on disk
    pub async fn artifacts(&self, server: &str) -> Result<ArtifactView, ServiceError> {
        let (_, spec) = self.locate(server).await?;
        let global = self.store.get_global().await?;
        let artifact = generate(&spec, &global);
        let manifest = self.writer.manifest(server).await?;
        let up_to_date = manifest.checksum == artifact.checksum;
        Ok(ArtifactView {
            artifact,
            manifest,
            up_to_date,
        })
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    async fn planner_for(&self, cluster: &str) -> Result<ClusterPlanner, ServiceError> {
        let clusters = self.store.list_clusters().await?;
        Ok(ClusterPlanner::with_existing(ports_outside(&clusters, cluster)))
    }

    /// Dry run: plan against the host without storing anything
    pub async fn preview(&self, request: &ClusterRequest) -> Result<ClusterSpec, ServiceError> {
        let _guard = self.planning.lock().await;
        let planner = self.planner_for(&request.name).await?;
        Ok(planner.plan(request)?)
    }

    async fn write_artifacts(
        &self,
        cluster: &ClusterSpec,
        force: bool,
    ) -> Result<BTreeMap<String, WriteReport>, ServiceError> {
        let global = self.store.get_global().await?;
        let mut reports = BTreeMap::new();
        for server in &cluster.servers {
            let artifact = generate(server, &global);
            reports.insert(server.name.clone(), self.writer.write(&artifact, force).await?);
        }
        Ok(reports)
    }

    fn ensure_not_retiring(&self, cluster: &ClusterSpec) -> Result<(), ServiceError> {
        match cluster.servers.iter().find(|s| self.retiring.contains(&s.name)) {
            Some(server) => Err(ServiceError::ServerRetiring(server.name.clone())),
            None => Ok(()),
        }
    }

    /// Decommission servers picked by a mutation. Runs without the planning
    /// lock; each name is planable again once its server is gone.
    async fn retire_all(&self, servers: &[String]) {
        join_all(servers.iter().map(|server| async move {
            if let Err(e) = self.orchestrator.decommission(server).await {
                warn!("Could not decommission '{}': {}", server, e);
            }
            if let Err(e) = self.writer.remove(server).await {
                warn!("Could not remove artifacts of '{}': {}", server, e);
            }
            self.retiring.remove(server);
        }))
        .await;
    }

    /// Plan, write artifacts and store the cluster. Nothing is stored when
    /// writing fails. Servers that leave the plan are marked as retiring and
    /// must be passed to `retire_all` once the planning lock is released.
    /// Caller holds the planning lock.
    async fn apply_locked(
        &self,
        request: &ClusterRequest,
        previous: Option<&ClusterSpec>,
        force: bool,
    ) -> Result<ApplyReport, ServiceError> {
        let planner = self.planner_for(&request.name).await?;
        let cluster = planner.plan(request)?;
        self.ensure_not_retiring(&cluster)?;

        let artifacts = self.write_artifacts(&cluster, force).await?;
        self.store.put_cluster(&cluster).await?;

        let removed = previous
            .map(|old| dropped_servers(old, &cluster))
            .unwrap_or_default();
        for server in &removed {
            self.retiring.insert(server.clone());
        }
        Ok(ApplyReport {
            cluster,
            artifacts,
            removed,
        })
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Create a cluster. Planning and storing happen before this returns, so
    /// invalid requests are rejected synchronously; writing artifacts and
    /// provisioning servers run as a `create-cluster` job.
    pub async fn create(self: &Arc<Self>, request: ClusterRequest) -> Result<(ClusterSpec, Uuid), ServiceError> {
        let cluster = {
            let _guard = self.planning.lock().await;
            let existing = self.store.list_clusters().await?;
            if let Some(clash) = name_clash(&existing, &request.name) {
                return Err(ServiceError::ClusterExists(clash.name.clone()));
            }
            let planner = self.planner_for(&request.name).await?;
            let cluster = planner.plan(&request)?;
            self.ensure_not_retiring(&cluster)?;
            self.store.put_cluster(&cluster).await?;
            cluster
        };
        info!(
            "Created cluster '{}' with {} server(s)",
            cluster.name,
            cluster.servers.len()
        );

        let svc = self.clone();
        let planned = cluster.clone();
        let job = self
            .jobs
            .enqueue(JobKind::CreateCluster, Some(cluster.name.clone()), move |handle| async move {
                let global = svc.store.get_global().await?;
                let total = planned.servers.len();
                for (i, server) in planned.servers.iter().enumerate() {
                    if handle.is_cancelled() {
                        anyhow::bail!("cancelled after {} of {} servers", i, total);
                    }
                    let artifact = generate(server, &global);
                    svc.writer.write(&artifact, false).await?;
                    svc.orchestrator.update(server, &artifact).await?;
                    handle.progress(
                        ((i + 1) * 100 / total) as u8,
                        format!("Provisioned {}", server.name),
                    );
                }
                Ok(json!({
                    "cluster": planned.name,
                    "servers": planned.server_names(),
                }))
            })
            .await;

        Ok((cluster, job))
    }

    /// Replace a cluster's request (maps, ports, settings, mods)
    pub async fn update(&self, request: ClusterRequest, force: bool) -> Result<ApplyReport, ServiceError> {
        let report = {
            let _guard = self.planning.lock().await;
            let previous = self.get(&request.name).await?;
            self.apply_locked(&request, Some(&previous), force).await?
        };
        self.retire_all(&report.removed).await;
        info!("Updated cluster '{}'", request.name);
        Ok(report)
    }

    /// Re-plan a cluster from its stored request and rewrite its artifacts.
    /// Idempotent: an unchanged host yields the same servers and ports.
    pub async fn regenerate(&self, name: &str, force: bool) -> Result<ApplyReport, ServiceError> {
        let report = {
            let _guard = self.planning.lock().await;
            let previous = self.get(name).await?;
            self.apply_locked(&previous.to_request(), Some(&previous), force)
                .await?
        };
        self.retire_all(&report.removed).await;
        info!("Regenerated cluster '{}'", name);
        Ok(report)
    }

    /// Delete a cluster: servers are stopped (with save) and removed, their
    /// generated files deleted. Save data stays on disk.
    pub async fn delete(&self, name: &str) -> Result<ClusterSpec, ServiceError> {
        let (cluster, servers) = {
            let _guard = self.planning.lock().await;
            let cluster = self.get(name).await?;
            self.store.delete_cluster(name).await?;
            let servers = cluster.server_names();
            for server in &servers {
                self.retiring.insert(server.clone());
            }
            (cluster, servers)
        };
        self.retire_all(&servers).await;
        info!("Deleted cluster '{}'", name);
        Ok(cluster)
    }

    /// Remove one server from its cluster
    pub async fn delete_server(&self, server: &str) -> Result<ApplyReport, ServiceError> {
        let (cluster, report) = {
            let _guard = self.planning.lock().await;
            let (cluster, _) = self.locate(server).await?;
            let request = request_without(&cluster, server)?;
            let report = self.apply_locked(&request, Some(&cluster), false).await?;
            (cluster, report)
        };
        self.retire_all(&report.removed).await;
        info!("Removed server '{}' from '{}'", server, cluster.name);
        Ok(report)
    }

    /// Regenerate artifacts and apply them to one server
    pub async fn update_server(&self, server: &str) -> Result<WriteReport, ServiceError> {
        let (_, spec) = self.locate(server).await?;
        let global = self.store.get_global().await?;
        let artifact = generate(&spec, &global);
        let report = self.writer.write(&artifact, false).await?;
        self.orchestrator.update(&spec, &artifact).await?;
        Ok(report)
    }

    /// Regenerate and apply artifacts for every server of one cluster (or all
    /// clusters) as an `update-all` job whose result is the per-server
    /// outcome list.
    pub async fn update_all(self: &Arc<Self>, cluster: Option<String>) -> Result<Uuid, ServiceError> {
        let clusters = match &cluster {
            Some(name) => vec![self.get(name).await?],
            None => self.store.list_clusters().await?,
        };
        let svc = self.clone();
        let job = self
            .jobs
            .enqueue(JobKind::UpdateAll, cluster, move |handle| async move {
                let global = svc.store.get_global().await?;
                let mut items = Vec::new();
                for server in clusters.iter().flat_map(|c| c.servers.iter()) {
                    let artifact = generate(server, &global);
                    svc.writer.write(&artifact, false).await?;
                    items.push((server.clone(), artifact));
                }
                handle.progress(10, format!("Generated artifacts for {} server(s)", items.len()));

                let progress = handle.clone();
                let result = svc
                    .orchestrator
                    .update_all(&items, move |done, total| {
                        progress.progress(
                            (10 + done * 90 / total.max(1)) as u8,
                            format!("Updated {}/{}", done, total),
                        )
                    })
                    .await;
                Ok(serde_json::to_value(result)?)
            })
            .await;
        Ok(job)
    }

    /// Install or update server binaries as an `install-binaries` job
    pub async fn install_binaries(&self, validate: bool) -> Result<Uuid, ServiceError> {
        let installer = self.installer.clone().ok_or(ServiceError::InstallUnavailable)?;
        let job = self
            .jobs
            .enqueue(JobKind::InstallBinaries, None, move |handle| async move {
                let report = installer.run(&handle, validate).await?;
                Ok(serde_json::to_value(report)?)
            })
            .await;
        Ok(job)
    }
}
