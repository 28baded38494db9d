//! ProcessSupervisor - the seam to whatever actually runs the servers
//!
//! The orchestrator only ever talks to this trait. A container engine or a
//! native process manager can sit behind it; tests substitute a recording
//! double.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifacts::RuntimeArtifact;
use crate::cluster::ports::PortAssignment;
use crate::cluster::server::ServerSpec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Supervisor unavailable: {0}")]
    Unavailable(String),

    #[error("Server '{0}' not known to the supervisor")]
    NotFound(String),

    #[error("Command failed for '{name}': {message}")]
    CommandFailed { name: String, message: String },

    #[error("Operation '{0}' not supported by this supervisor")]
    Unsupported(&'static str),
}

/// Observed state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Unknown,
}

impl ServerState {
    /// Whether an operation is in flight
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Stopping | ServerState::Restarting
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Restarting => "restarting",
            ServerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Read model of a server as the supervisor sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server name
    pub name: String,
    /// Observed state
    pub status: ServerState,
    /// Published ports, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortAssignment>,
    /// When the runnable unit was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ServerStatus {
    pub fn new(name: impl Into<String>, status: ServerState) -> Self {
        Self {
            name: name.into(),
            status,
            ports: None,
            created_at: None,
        }
    }
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, name: &str) -> Result<(), SupervisorError>;

    async fn stop(&self, name: &str) -> Result<(), SupervisorError>;

    /// Native restart; supervisors without one return `Unsupported` and the
    /// orchestrator composes stop + start instead.
    async fn restart(&self, _name: &str) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported("restart"))
    }

    async fn status(&self, name: &str) -> Result<ServerStatus, SupervisorError>;

    /// Run an RCON command against the server and return its text output
    async fn exec(&self, name: &str, command: &str) -> Result<String, SupervisorError>;

    /// Create (or recreate) the runnable unit for a server from its artifacts
    async fn provision(&self, _spec: &ServerSpec, _artifact: &RuntimeArtifact) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported("provision"))
    }

    /// Remove the runnable unit of a deleted server
    async fn remove(&self, _name: &str) -> Result<(), SupervisorError> {
        Err(SupervisorError::Unsupported("remove"))
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mock::MockSupervisor;
    use super::*;

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&ServerState::Running).unwrap(), "\"running\"");
        assert!(ServerState::Starting.is_transitional());
        assert!(!ServerState::Unknown.is_transitional());
    }

    #[tokio::test]
    async fn test_default_restart_is_unsupported() {
        let mock = MockSupervisor::with_servers(&[("a", ServerState::Running)]);
        assert_eq!(
            mock.restart("a").await,
            Err(SupervisorError::Unsupported("restart"))
        );
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockSupervisor::with_servers(&[("a", ServerState::Stopped)]);
        mock.start("a").await.unwrap();
        mock.exec("a", "SaveWorld").await.unwrap();
        assert_eq!(mock.calls(), vec!["start:a", "exec(SaveWorld):a"]);
        assert!(matches!(mock.stop("zzz").await, Err(SupervisorError::NotFound(_))));
    }
}
