//! Docker-backed ProcessSupervisor
//!
//! One container per server. Argument generation and `docker inspect`
//! parsing are pure functions; `DockerSupervisor` is the thin layer that runs
//! the docker CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use super::artifacts::RuntimeArtifact;
use super::supervisor::{ProcessSupervisor, ServerState, ServerStatus, SupervisorError};
use crate::cluster::ports::PortAssignment;
use crate::cluster::server::ServerSpec;
use crate::config::SupervisorConfig;

/// Label carrying the owning cluster id
pub const CLUSTER_LABEL: &str = "arkfleet.cluster";

/// Label carrying `game,query,rcon`
pub const PORTS_LABEL: &str = "arkfleet.ports";

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate `docker create` arguments for a server
pub fn generate_create_args(
    config: &SupervisorConfig,
    spec: &ServerSpec,
    artifact: &RuntimeArtifact,
    host_data_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        config.restart_policy.clone(),
    ];

    // Game and query traffic is UDP, RCON is TCP
    args.push("-p".to_string());
    args.push(format!("{0}:{0}/udp", spec.ports.game));
    args.push("-p".to_string());
    args.push(format!("{0}:{0}/udp", spec.ports.query));
    args.push("-p".to_string());
    args.push(format!("{0}:{0}/tcp", spec.ports.rcon));

    args.push("-v".to_string());
    args.push(format!(
        "{}:{}",
        host_data_dir.display(),
        config.container_data_path
    ));

    for (key, value) in &artifact.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push("--label".to_string());
    args.push(format!("{}={}", CLUSTER_LABEL, spec.cluster_id));
    args.push("--label".to_string());
    args.push(format!(
        "{}={},{},{}",
        PORTS_LABEL, spec.ports.game, spec.ports.query, spec.ports.rcon
    ));

    args.push(config.image.clone());
    args
}

/// Generate `docker exec` arguments for an RCON command
pub fn generate_exec_args(config: &SupervisorConfig, name: &str, command: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string(), name.to_string()];
    args.extend(config.rcon_exec.iter().cloned());
    args.push(command.to_string());
    args
}

/// Generate Docker stop arguments
pub fn generate_stop_args(container_name: &str) -> Vec<String> {
    vec!["stop".to_string(), container_name.to_string()]
}

/// Generate Docker rm arguments
pub fn generate_rm_args(container_name: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), container_name.to_string()]
}

/// Map a docker `State.Status` to a server state
pub fn map_container_state(status: &str) -> ServerState {
    match status {
        "running" => ServerState::Running,
        "restarting" => ServerState::Restarting,
        "created" | "exited" | "dead" => ServerState::Stopped,
        "removing" => ServerState::Stopping,
        _ => ServerState::Unknown,
    }
}

fn parse_ports_label(value: &str) -> Option<PortAssignment> {
    let parts: Vec<u16> = value
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [game, query, rcon] => Some(PortAssignment {
            game: *game,
            query: *query,
            rcon: *rcon,
        }),
        _ => None,
    }
}

/// Parse `docker inspect <name>` output into a ServerStatus
pub fn parse_inspect(name: &str, output: &str) -> Result<ServerStatus, SupervisorError> {
    let parsed: Value = serde_json::from_str(output).map_err(|e| SupervisorError::CommandFailed {
        name: name.to_string(),
        message: format!("unreadable inspect output: {}", e),
    })?;
    let container = parsed
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

    let state = container["State"]["Status"]
        .as_str()
        .map(map_container_state)
        .unwrap_or(ServerState::Unknown);
    let created_at = container["Created"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let ports = container["Config"]["Labels"][PORTS_LABEL]
        .as_str()
        .and_then(parse_ports_label);

    Ok(ServerStatus {
        name: name.to_string(),
        status: state,
        ports,
        created_at,
    })
}

/// Classify a failed docker invocation by its stderr
pub fn classify_failure(name: &str, stderr: &str) -> SupervisorError {
    if stderr.contains("No such container") || stderr.contains("No such object") {
        SupervisorError::NotFound(name.to_string())
    } else if stderr.contains("Cannot connect to the Docker daemon") {
        SupervisorError::Unavailable(stderr.trim().to_string())
    } else {
        SupervisorError::CommandFailed {
            name: name.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}

// ============================================================================
// I/O: docker CLI
// ============================================================================

pub struct DockerSupervisor {
    config: SupervisorConfig,
    /// Host directory holding one data directory per server
    servers_root: PathBuf,
}

impl DockerSupervisor {
    pub fn new(config: SupervisorConfig, servers_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            servers_root: servers_root.into(),
        }
    }

    async fn docker(&self, name: &str, args: &[String]) -> Result<String, SupervisorError> {
        debug!("docker {:?}", args);
        let output = Command::new(&self.config.docker_binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SupervisorError::Unavailable(format!(
                    "failed to run {}: {}",
                    self.config.docker_binary, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(name, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn docker_simple(&self, op: &str, name: &str) -> Result<(), SupervisorError> {
        self.docker(name, &[op.to_string(), name.to_string()]).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for DockerSupervisor {
    async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.docker_simple("start", name).await
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.docker(name, &generate_stop_args(name)).await?;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.docker_simple("restart", name).await
    }

    async fn status(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        let output = self
            .docker(name, &["inspect".to_string(), name.to_string()])
            .await?;
        parse_inspect(name, &output)
    }

    async fn exec(&self, name: &str, command: &str) -> Result<String, SupervisorError> {
        let args = generate_exec_args(&self.config, name, command);
        let output = self.docker(name, &args).await?;
        Ok(output.trim_end().to_string())
    }

    async fn provision(&self, spec: &ServerSpec, artifact: &RuntimeArtifact) -> Result<(), SupervisorError> {
        match self.docker(&spec.name, &generate_rm_args(&spec.name)).await {
            Ok(_) | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let host_dir = self.servers_root.join(&spec.name);
        let args = generate_create_args(&self.config, spec, artifact, &host_dir);
        self.docker(&spec.name, &args).await?;
        info!("Provisioned container '{}' ({})", spec.name, self.config.image);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        self.docker(name, &generate_rm_args(name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::server::GameMap;
    use crate::config::GlobalConfig;
    use crate::runtime::artifacts::generate;

    fn spec() -> ServerSpec {
        ServerSpec {
            name: "c-Ragnarok".into(),
            map: GameMap::Ragnarok,
            session_name: "c-Ragnarok".into(),
            ports: PortAssignment {
                game: 7779,
                query: 27017,
                rcon: 27022,
            },
            max_players: 20,
            password: String::new(),
            admin_password: "admin".into(),
            mods: vec![1],
            cluster_id: "c".into(),
            game_rules: Default::default(),
        }
    }

    #[test]
    fn test_generate_create_args() {
        let config = SupervisorConfig::default();
        let spec = spec();
        let artifact = generate(&spec, &GlobalConfig::default());
        let args = generate_create_args(&config, &spec, &artifact, Path::new("/srv/ark/c-Ragnarok"));

        assert_eq!(&args[..3], &["create", "--name", "c-Ragnarok"]);
        assert!(args.contains(&"7779:7779/udp".to_string()));
        assert!(args.contains(&"27017:27017/udp".to_string()));
        assert!(args.contains(&"27022:27022/tcp".to_string()));
        assert!(args.contains(&"/srv/ark/c-Ragnarok:/home/gameserver/server-files".to_string()));
        assert!(args.iter().any(|a| a == "MOD_IDS=1"));
        assert!(args.contains(&"arkfleet.ports=7779,27017,27022".to_string()));
        assert_eq!(args.last().unwrap(), &config.image);
    }

    #[test]
    fn test_generate_exec_args() {
        let config = SupervisorConfig::default();
        let args = generate_exec_args(&config, "srv", "SaveWorld");
        assert_eq!(args, vec!["exec", "srv", "asa-ctrl", "rcon", "--exec", "SaveWorld"]);
    }

    #[test]
    fn test_generate_stop_and_rm_args() {
        assert_eq!(generate_stop_args("my-container"), vec!["stop", "my-container"]);
        assert_eq!(generate_rm_args("my-container"), vec!["rm", "-f", "my-container"]);
    }

    #[test]
    fn test_map_container_state() {
        assert_eq!(map_container_state("running"), ServerState::Running);
        assert_eq!(map_container_state("exited"), ServerState::Stopped);
        assert_eq!(map_container_state("created"), ServerState::Stopped);
        assert_eq!(map_container_state("restarting"), ServerState::Restarting);
        assert_eq!(map_container_state("paused"), ServerState::Unknown);
    }

    #[test]
    fn test_parse_inspect() {
        let output = r#"[{
            "Created": "2025-03-01T10:00:00.123456789Z",
            "State": {"Status": "running"},
            "Config": {"Labels": {"arkfleet.ports": "7777,27015,27020"}}
        }]"#;
        let status = parse_inspect("srv", output).unwrap();
        assert_eq!(status.status, ServerState::Running);
        assert_eq!(status.ports.unwrap().rcon, 27020);
        assert!(status.created_at.is_some());
    }

    #[test]
    fn test_parse_inspect_empty_and_garbage() {
        assert!(matches!(parse_inspect("srv", "[]"), Err(SupervisorError::NotFound(_))));
        assert!(matches!(
            parse_inspect("srv", "nope"),
            Err(SupervisorError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("x", "Error: No such container: x"),
            SupervisorError::NotFound("x".into())
        );
        assert!(matches!(
            classify_failure("x", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            SupervisorError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("x", "port is already allocated"),
            SupervisorError::CommandFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_unavailable() {
        let config = SupervisorConfig {
            docker_binary: "/nonexistent/docker-binary".into(),
            ..Default::default()
        };
        let supervisor = DockerSupervisor::new(config, "/tmp");
        assert!(matches!(
            supervisor.start("srv").await,
            Err(SupervisorError::Unavailable(_))
        ));
    }
}
