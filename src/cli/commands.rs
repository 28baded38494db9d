//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, printing is handled by the caller

use std::path::Path;

use thiserror::Error;

use crate::cluster::planner::{ClusterPlanner, ClusterRequest, ClusterSpec, PlanError};
use crate::config::{load_request_file, ConfigError, GlobalConfig};
use crate::runtime::artifacts::{generate, RuntimeArtifact};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Server '{server}' is not part of cluster '{cluster}'")]
    UnknownServer { cluster: String, server: String },
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Pure business logic
// ============================================================================

/// Plan a parsed request against an empty host
pub fn plan_request(request: &ClusterRequest) -> CommandResult<ClusterSpec> {
    Ok(ClusterPlanner::new().plan(request)?)
}

/// Artifacts for every planned server, or only `server` when given
pub fn render_cluster(
    cluster: &ClusterSpec,
    server: Option<&str>,
    global: &GlobalConfig,
) -> CommandResult<Vec<RuntimeArtifact>> {
    match server {
        Some(name) => {
            let spec = cluster.server(name).ok_or_else(|| CommandError::UnknownServer {
                cluster: cluster.name.clone(),
                server: name.to_string(),
            })?;
            Ok(vec![generate(spec, global)])
        }
        None => Ok(cluster.servers.iter().map(|s| generate(s, global)).collect()),
    }
}

/// Result of validating a cluster request
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the request plans cleanly
    pub valid: bool,
    /// Cluster name
    pub cluster: Option<String>,
    /// Planned server count
    pub servers: usize,
    /// Why planning failed
    pub error: Option<String>,
}

/// Validate a request: it must parse and plan cleanly
pub fn validate_request(request: Result<ClusterRequest, CommandError>) -> ValidationResult {
    match request.and_then(|r| plan_request(&r)) {
        Ok(cluster) => ValidationResult {
            valid: true,
            cluster: Some(cluster.name),
            servers: cluster.servers.len(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            cluster: None,
            servers: 0,
            error: Some(e.to_string()),
        },
    }
}

// ============================================================================
// I/O wrappers
// ============================================================================

pub fn load_request(path: &Path) -> CommandResult<ClusterRequest> {
    Ok(load_request_file(path)?)
}

pub fn plan_file(path: &Path) -> CommandResult<ClusterSpec> {
    plan_request(&load_request(path)?)
}

pub fn validate_file(path: &Path) -> ValidationResult {
    validate_request(load_request(path))
}
