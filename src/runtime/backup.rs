//! Filesystem snapshots of a server's data directory
//!
//! Snapshots live under `<backups>/<server>/<id>/` where the id is a UTC
//! timestamp with an optional label suffix. Process coordination (saving the
//! world first, refusing to restore over a live server) is the lifecycle
//! orchestrator's job; this module only moves files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup '{backup}' not found for server '{server}'")]
    NotFound { server: String, backup: String },

    #[error("Invalid backup label '{0}': use letters, digits, '-' or '_'")]
    InvalidLabel(String),

    #[error("Nothing to back up for '{0}': data directory missing")]
    NoData(String),

    #[error("Backup I/O error for '{0}': {1}")]
    Io(String, std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Backup id: UTC timestamp, optionally `-label`
    pub id: String,
    /// Server the backup was taken from
    pub server: String,
    /// Operator-supplied label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When the backup was taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

const ID_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Build a backup id from a timestamp and optional label
pub fn backup_id(at: DateTime<Utc>, label: Option<&str>) -> Result<String, BackupError> {
    let stamp = at.format(ID_FORMAT).to_string();
    match label {
        None => Ok(stamp),
        Some(l) if valid_label(l) => Ok(format!("{}-{}", stamp, l)),
        Some(l) => Err(BackupError::InvalidLabel(l.to_string())),
    }
}

/// Split a backup id back into its timestamp and label
pub fn parse_backup_id(server: &str, id: &str) -> BackupInfo {
    let (stamp, label) = match id.split_once('-') {
        Some((s, l)) => (s, Some(l.to_string())),
        None => (id, None),
    };
    let created_at = NaiveDateTime::parse_from_str(stamp, ID_FORMAT)
        .ok()
        .map(|n| n.and_utc());
    BackupInfo {
        id: id.to_string(),
        server: server.to_string(),
        label,
        created_at,
    }
}

/// Whether `id` has the shape `backup_id` produces. Anything else (including
/// `.` and `..`) never names a snapshot directory.
pub fn is_backup_id(id: &str) -> bool {
    let (stamp, label) = match id.split_once('-') {
        Some((s, l)) => (s, Some(l)),
        None => (id, None),
    };
    NaiveDateTime::parse_from_str(stamp, ID_FORMAT).is_ok() && label.map_or(true, valid_label)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

// ============================================================================
// SBIO: Trait for abstraction
// ============================================================================

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn snapshot(&self, server: &str, label: Option<&str>) -> Result<BackupInfo, BackupError>;

    /// Newest first
    async fn list(&self, server: &str) -> Result<Vec<BackupInfo>, BackupError>;

    async fn restore(&self, server: &str, backup: &str) -> Result<(), BackupError>;
}

/// Copies `<servers>/<name>` to and from `<backups>/<name>/<id>`
pub struct FsSnapshotStore {
    servers_root: PathBuf,
    backups_root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(servers_root: impl Into<PathBuf>, backups_root: impl Into<PathBuf>) -> Self {
        Self {
            servers_root: servers_root.into(),
            backups_root: backups_root.into(),
        }
    }

    fn backup_dir(&self, server: &str, id: &str) -> PathBuf {
        self.backups_root.join(server).join(id)
    }
}

async fn blocking_copy(server: &str, src: PathBuf, dst: PathBuf) -> Result<u64, BackupError> {
    let io = |e| BackupError::Io(server.to_string(), e);
    tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
        .await
        .map_err(|e| io(std::io::Error::other(e)))?
        .map_err(io)
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn snapshot(&self, server: &str, label: Option<&str>) -> Result<BackupInfo, BackupError> {
        let src = self.servers_root.join(server);
        if !tokio::fs::try_exists(&src)
            .await
            .map_err(|e| BackupError::Io(server.to_string(), e))?
        {
            return Err(BackupError::NoData(server.to_string()));
        }

        let id = backup_id(Utc::now(), label)?;
        let files = blocking_copy(server, src, self.backup_dir(server, &id)).await?;
        info!("Backed up '{}' as {} ({} files)", server, id, files);
        Ok(parse_backup_id(server, &id))
    }

    async fn list(&self, server: &str) -> Result<Vec<BackupInfo>, BackupError> {
        let dir = self.backups_root.join(server);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::Io(server.to_string(), e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Io(server.to_string(), e))?
        {
            match entry.file_name().to_str() {
                Some(id) if is_backup_id(id) => backups.push(parse_backup_id(server, id)),
                _ => {}
            }
        }
        // Ids start with a sortable timestamp
        backups.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(backups)
    }

    /// The restored tree is staged next to the live directory and swapped in
    /// with renames, so a failed copy leaves the live data untouched.
    async fn restore(&self, server: &str, backup: &str) -> Result<(), BackupError> {
        let io = |e| BackupError::Io(server.to_string(), e);
        let not_found = || BackupError::NotFound {
            server: server.to_string(),
            backup: backup.to_string(),
        };
        if !is_backup_id(backup) {
            return Err(not_found());
        }
        let src = self.backup_dir(server, backup);
        if !tokio::fs::try_exists(&src).await.map_err(io)? {
            return Err(not_found());
        }

        let dst = self.servers_root.join(server);
        let staging = self.servers_root.join(format!(".restore-{}", server));
        let previous = self.servers_root.join(format!(".previous-{}", server));
        for stale in [&staging, &previous] {
            remove_if_exists(stale).await.map_err(io)?;
        }

        let files = match blocking_copy(server, src, staging.clone()).await {
            Ok(files) => files,
            Err(e) => {
                let _ = remove_if_exists(&staging).await;
                return Err(e);
            }
        };

        let had_data = tokio::fs::try_exists(&dst).await.map_err(io)?;
        if had_data {
            tokio::fs::rename(&dst, &previous).await.map_err(io)?;
        }
        if let Err(e) = tokio::fs::rename(&staging, &dst).await {
            if had_data {
                let _ = tokio::fs::rename(&previous, &dst).await;
            }
            return Err(io(e));
        }
        if let Err(e) = remove_if_exists(&previous).await {
            warn!("Could not remove replaced data of '{}': {}", server, e);
        }

        info!("Restored '{}' from {} ({} files)", server, backup, files);
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
