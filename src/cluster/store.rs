//! ConfigStore - persistence boundary for clusters and global config
//!
//! Records are validated on the way in, so anything read back from a store
//! already satisfies the ClusterSpec invariants.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::planner::{ClusterSpec, PlanError};
use crate::config::GlobalConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cluster '{0}' rejected by store: {1}")]
    Invalid(String, PlanError),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record '{0}': {1}")]
    Corrupt(String, String),

    #[error("Failed to serialize '{0}': {1}")]
    Serialize(String, String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows in-memory stores in tests)
// ============================================================================

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError>;

    async fn put_cluster(&self, cluster: &ClusterSpec) -> Result<(), StoreError>;

    async fn delete_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError>;

    async fn list_clusters(&self) -> Result<Vec<ClusterSpec>, StoreError>;

    async fn get_global(&self) -> Result<GlobalConfig, StoreError>;

    async fn put_global(&self, config: &GlobalConfig) -> Result<(), StoreError>;
}

fn check(cluster: &ClusterSpec) -> Result<(), StoreError> {
    cluster
        .validate()
        .map_err(|e| StoreError::Invalid(cluster.name.clone(), e))
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    clusters: DashMap<String, ClusterSpec>,
    global: RwLock<GlobalConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError> {
        Ok(self.clusters.get(name).map(|r| r.clone()))
    }

    async fn put_cluster(&self, cluster: &ClusterSpec) -> Result<(), StoreError> {
        check(cluster)?;
        self.clusters.insert(cluster.name.clone(), cluster.clone());
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError> {
        Ok(self.clusters.remove(name).map(|(_, c)| c))
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterSpec>, StoreError> {
        let mut clusters: Vec<ClusterSpec> = self.clusters.iter().map(|r| r.clone()).collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    async fn get_global(&self) -> Result<GlobalConfig, StoreError> {
        Ok(self.global.read().await.clone())
    }

    async fn put_global(&self, config: &GlobalConfig) -> Result<(), StoreError> {
        *self.global.write().await = config.clone();
        Ok(())
    }
}

// ============================================================================
// JSON file store: <root>/clusters/<name>.json and <root>/global.json
// ============================================================================

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn clusters_dir(&self) -> PathBuf {
        self.root.join("clusters")
    }

    fn cluster_path(&self, name: &str) -> PathBuf {
        self.clusters_dir().join(format!("{}.json", name))
    }

    fn global_path(&self) -> PathBuf {
        self.root.join("global.json")
    }

    async fn read_cluster(path: &Path, name: &str) -> Result<ClusterSpec, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        let cluster: ClusterSpec = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(name.to_string(), e.to_string()))?;
        check(&cluster)?;
        Ok(cluster)
    }
}

/// Write to a sibling temp file, then rename over the target
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError> {
        let path = self.cluster_path(name);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_cluster(&path, name).await.map(Some)
    }

    async fn put_cluster(&self, cluster: &ClusterSpec) -> Result<(), StoreError> {
        check(cluster)?;
        let content = serde_json::to_vec_pretty(cluster)
            .map_err(|e| StoreError::Serialize(cluster.name.clone(), e.to_string()))?;
        write_atomic(&self.cluster_path(&cluster.name), &content).await?;
        debug!("Stored cluster '{}'", cluster.name);
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<Option<ClusterSpec>, StoreError> {
        let existing = self.get_cluster(name).await?;
        if existing.is_some() {
            tokio::fs::remove_file(self.cluster_path(name)).await?;
        }
        Ok(existing)
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterSpec>, StoreError> {
        let dir = self.clusters_dir();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut clusters = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            // One unreadable record must not hide every other cluster
            match Self::read_cluster(&path, &name).await {
                Ok(cluster) => clusters.push(cluster),
                Err(e @ (StoreError::Corrupt(..) | StoreError::Invalid(..))) => {
                    warn!("Skipping {}: {}", path.display(), e)
                }
                Err(e) => return Err(e),
            }
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    async fn get_global(&self) -> Result<GlobalConfig, StoreError> {
        let path = self.global_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(GlobalConfig::default());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt("global".to_string(), e.to_string()))
    }

    async fn put_global(&self, config: &GlobalConfig) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(config)
            .map_err(|e| StoreError::Serialize("global".to_string(), e.to_string()))?;
        write_atomic(&self.global_path(), &content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::planner::{plan, ClusterRequest, MapSelection};
    use crate::cluster::server::GameMap;
    use tempfile::TempDir;

    fn cluster(name: &str) -> ClusterSpec {
        plan(&ClusterRequest::new(
            name,
            vec![MapSelection {
                map: GameMap::TheIsland,
                count: 2,
            }],
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        store.put_cluster(&cluster("b")).await.unwrap();
        store.put_cluster(&cluster("a")).await.unwrap();

        let names: Vec<String> = store
            .list_clusters()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete_cluster("a").await.unwrap().is_some());
        assert!(store.get_cluster("a").await.unwrap().is_none());
        assert!(store.delete_cluster("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_cluster() {
        let store = MemoryStore::new();
        let mut bad = cluster("bad");
        bad.servers[1].ports = bad.servers[0].ports;
        assert!(matches!(
            store.put_cluster(&bad).await,
            Err(StoreError::Invalid(ref name, _)) if name == "bad"
        ));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.list_clusters().await.unwrap().is_empty());
        assert_eq!(store.get_global().await.unwrap(), GlobalConfig::default());

        let original = cluster("Cluster1");
        store.put_cluster(&original).await.unwrap();
        assert_eq!(store.get_cluster("Cluster1").await.unwrap(), Some(original.clone()));

        let mut global = GlobalConfig::default();
        global.excluded_servers.insert("Cluster1-TheIsland-1".into());
        store.put_global(&global).await.unwrap();
        assert_eq!(store.get_global().await.unwrap(), global);

        let reopened = FileStore::new(dir.path());
        assert_eq!(reopened.list_clusters().await.unwrap(), vec![original]);

        assert!(reopened.delete_cluster("Cluster1").await.unwrap().is_some());
        assert!(reopened.get_cluster("Cluster1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join("clusters")).await.unwrap();
        tokio::fs::write(dir.path().join("clusters").join("x.json"), "{}")
            .await
            .unwrap();
        assert!(matches!(
            store.get_cluster("x").await,
            Err(StoreError::Corrupt(..))
        ));
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.put_cluster(&cluster("Cluster1")).await.unwrap();
        store.put_cluster(&cluster("Cluster2")).await.unwrap();
        tokio::fs::write(dir.path().join("clusters").join("Broken.json"), "{not json")
            .await
            .unwrap();

        let names: Vec<String> = store
            .list_clusters()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Cluster1", "Cluster2"]);
    }
}
