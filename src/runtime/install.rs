//! Server binary installation through SteamCMD
//!
//! Runs `app_update` for the dedicated server app and turns SteamCMD's
//! `progress: NN.NN` lines into job progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::jobs::JobHandle;
use crate::config::InstallConfig;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to run SteamCMD '{0}': {1}")]
    Spawn(String, std::io::Error),

    #[error("SteamCMD exited with {code:?}: {last_line}")]
    Failed { code: Option<i32>, last_line: String },

    #[error("Installation cancelled")]
    Cancelled,

    #[error("Install I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    /// Installed Steam app
    pub app_id: u32,
    /// Install directory
    pub install_dir: PathBuf,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// SteamCMD arguments installing or updating an app
pub fn steamcmd_args(install_dir: &Path, app_id: u32, validate: bool) -> Vec<String> {
    let mut args = vec![
        // The ASA dedicated server ships Windows binaries only
        "+@sSteamCmdForcePlatformType".to_string(),
        "windows".to_string(),
        "+force_install_dir".to_string(),
        install_dir.display().to_string(),
        "+login".to_string(),
        "anonymous".to_string(),
        "+app_update".to_string(),
        app_id.to_string(),
    ];
    if validate {
        args.push("validate".to_string());
    }
    args.push("+quit".to_string());
    args
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"progress:\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"))
}

/// Extract the percentage from a SteamCMD status line
pub fn parse_progress(line: &str) -> Option<f64> {
    progress_pattern()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0))
}

/// Whether a line reports a completed install
pub fn is_success_line(line: &str, app_id: u32) -> bool {
    line.contains("Success!") && line.contains(&format!("'{}'", app_id))
}

// ============================================================================
// I/O: run SteamCMD
// ============================================================================

pub struct BinaryInstaller {
    config: InstallConfig,
    install_dir: PathBuf,
}

impl BinaryInstaller {
    pub fn new(config: InstallConfig, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            install_dir: install_dir.into(),
        }
    }

    /// Run SteamCMD, reporting progress on `job`. Progress stays below 100
    /// until SteamCMD confirms the install.
    pub async fn run(&self, job: &JobHandle, validate: bool) -> Result<InstallReport, InstallError> {
        tokio::fs::create_dir_all(&self.install_dir).await?;
        let args = steamcmd_args(&self.install_dir, self.config.app_id, validate);
        info!(
            "Installing app {} into {}",
            self.config.app_id,
            self.install_dir.display()
        );

        let mut child = Command::new(&self.config.steamcmd)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstallError::Spawn(self.config.steamcmd.clone(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InstallError::Io(std::io::Error::other("stdout not captured")))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line = String::new();
        let mut succeeded = false;

        job.progress(1, "Starting SteamCMD");
        while let Some(line) = lines.next_line().await? {
            if job.is_cancelled() {
                warn!("Install cancelled, killing SteamCMD");
                child.kill().await?;
                return Err(InstallError::Cancelled);
            }
            debug!("steamcmd: {}", line);
            if let Some(pct) = parse_progress(&line) {
                job.progress((pct as u8).min(99), line.trim());
            }
            if is_success_line(&line, self.config.app_id) {
                succeeded = true;
            }
            if !line.trim().is_empty() {
                last_line = line.trim().to_string();
            }
        }

        let status = child.wait().await?;
        if !status.success() && !succeeded {
            return Err(InstallError::Failed {
                code: status.code(),
                last_line,
            });
        }

        job.progress(100, "Installed");
        info!("App {} installed", self.config.app_id);
        Ok(InstallReport {
            app_id: self.config.app_id,
            install_dir: self.install_dir.clone(),
        })
    }
}
