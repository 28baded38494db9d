//! Cluster planning
//!
//! Expands a ClusterRequest (maps x counts, shared settings, overrides) into a
//! ClusterSpec with deterministic names and ports. Planning the same request
//! against the same host state always yields the same servers, so operators
//! can regenerate freely without port churn.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::mods::{ModConfig, ModId};
use super::ports::{find_duplicate, PortAllocator, PortConfig, PortError, PortKind, PortOverride, PortTable};
use super::server::{
    build, BuildInput, ClusterContext, GameMap, ServerSettings, ServerSpec, SpecError,
    DEFAULT_MAX_PLAYERS,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Invalid cluster request '{cluster}': {reason}")]
    InvalidRequest { cluster: String, reason: String },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Server name '{0}' is planned twice")]
    DuplicateServerName(String),
}

/// How many servers of one map to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSelection {
    /// Map to host
    pub map: GameMap,
    /// Number of servers on it
    #[serde(alias = "enabledCount")]
    pub count: usize,
}

/// Per-server adjustments, keyed by the derived server name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOverride {
    /// Fixed ports; unset kinds are derived
    #[serde(default, skip_serializing_if = "PortOverride::is_empty")]
    pub ports: PortOverride,
    /// Player slots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    /// Join password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Admin password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    /// Extra `ServerSettings` keys for this server only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub game_rules: BTreeMap<String, String>,
}

/// A request to create or regenerate a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    /// Cluster name; also the prefix of every server name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// In the order the operator selected them
    pub maps: Vec<MapSelection>,
    /// Port bases and increments
    #[serde(flatten)]
    pub ports: PortConfig,
    /// Player slots per server unless overridden
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    /// Join password; empty means none
    #[serde(default)]
    pub password: String,
    /// Admin password; empty means none
    #[serde(default)]
    pub admin_password: String,
    /// Extra `ServerSettings` keys applied to every server
    #[serde(default)]
    pub global_settings: BTreeMap<String, String>,
    /// Shared mods and per-server mod changes
    #[serde(flatten)]
    pub mods: ModConfig,
    /// Per-server overrides keyed by server name
    #[serde(default)]
    pub overrides: BTreeMap<String, ServerOverride>,
}

fn default_max_players() -> u32 {
    DEFAULT_MAX_PLAYERS
}

impl ClusterRequest {
    /// Minimal request with defaults for everything but name and maps
    pub fn new(name: impl Into<String>, maps: Vec<MapSelection>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            maps,
            ports: PortConfig::default(),
            max_players: DEFAULT_MAX_PLAYERS,
            password: String::new(),
            admin_password: String::new(),
            global_settings: BTreeMap::new(),
            mods: ModConfig::default(),
            overrides: BTreeMap::new(),
        }
    }

    /// Total number of servers this request plans
    pub fn server_count(&self) -> usize {
        self.maps.iter().map(|m| m.count).sum()
    }

    fn settings_for(&self, server: &str) -> ServerSettings {
        let mut settings = ServerSettings {
            max_players: self.max_players,
            password: self.password.clone(),
            admin_password: self.admin_password.clone(),
            game_rules: self.global_settings.clone(),
        };
        if let Some(o) = self.overrides.get(server) {
            if let Some(max) = o.max_players {
                settings.max_players = max;
            }
            if let Some(pw) = &o.password {
                settings.password = pw.clone();
            }
            if let Some(pw) = &o.admin_password {
                settings.admin_password = pw.clone();
            }
            for (k, v) in &o.game_rules {
                settings.game_rules.insert(k.clone(), v.clone());
            }
        }
        settings
    }
}

/// The planned cluster (aggregate root; owns its servers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Lowercased name, passed to every server as `-clusterid`
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Map selection the servers were planned from
    pub maps: Vec<MapSelection>,
    /// Port bases and increments the plan used
    pub base_port_config: PortConfig,
    /// Default player slots
    pub max_players: u32,
    /// Join password
    #[serde(default)]
    pub password: String,
    /// Admin password
    #[serde(default)]
    pub admin_password: String,
    /// Extra `ServerSettings` keys
    #[serde(default)]
    pub global_settings: BTreeMap<String, String>,
    /// Mod configuration
    #[serde(default)]
    pub mods: ModConfig,
    /// Per-server overrides
    #[serde(default)]
    pub overrides: BTreeMap<String, ServerOverride>,
    /// Planned servers, in map selection order
    pub servers: Vec<ServerSpec>,
}

impl ClusterSpec {
    /// The request this cluster was planned from
    pub fn to_request(&self) -> ClusterRequest {
        ClusterRequest {
            name: self.name.clone(),
            description: self.description.clone(),
            maps: self.maps.clone(),
            ports: self.base_port_config,
            max_players: self.max_players,
            password: self.password.clone(),
            admin_password: self.admin_password.clone(),
            global_settings: self.global_settings.clone(),
            mods: self.mods.clone(),
            overrides: self.overrides.clone(),
        }
    }

    pub fn server(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Shared mod list
    pub fn global_mods(&self) -> &[ModId] {
        &self.mods.shared_mods
    }

    /// Check the invariants a stored cluster must hold.
    ///
    /// Server names are unique, no `(kind, port)` pair repeats, every port is
    /// either an explicit override or lies on its kind's `base + k * increment`
    /// sequence, and every mod list matches a fresh resolution.
    pub fn validate(&self) -> Result<(), PlanError> {
        validate_cluster_name(&self.name)?;

        let planned: HashSet<String> = planned_names(&self.name, &self.maps).into_iter().collect();
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(PlanError::DuplicateServerName(server.name.clone()));
            }
            if !planned.contains(&server.name) {
                return Err(self.invalid(format!("server '{}' is not part of the map selection", server.name)));
            }
            server.validate()?;

            let overrides = self
                .overrides
                .get(&server.name)
                .map(|o| o.ports)
                .unwrap_or_default();
            for kind in PortKind::ALL {
                let port = server.ports.get(kind);
                if overrides.get(kind) == Some(port) {
                    continue;
                }
                let (base, increment) = self.base_port_config.range(kind);
                let on_sequence = match increment {
                    0 => port == base,
                    inc => port >= base && (port - base) % inc == 0,
                };
                if !on_sequence {
                    return Err(self.invalid(format!(
                        "{} port {} of '{}' does not follow base {} / increment {}",
                        kind, port, server.name, base, increment
                    )));
                }
            }

            if server.mods != self.mods.resolve_for(&server.name) {
                return Err(self.invalid(format!("mod list of '{}' is out of date", server.name)));
            }
        }

        if let Some(err) = find_duplicate(self.servers.iter().map(|s| (s.name.as_str(), &s.ports))) {
            return Err(err.into());
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> PlanError {
        PlanError::InvalidRequest {
            cluster: self.name.clone(),
            reason,
        }
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"))
}

fn validate_cluster_name(name: &str) -> Result<(), PlanError> {
    if !name_pattern().is_match(name) {
        return Err(PlanError::InvalidRequest {
            cluster: name.to_string(),
            reason: "name must be 1-64 characters of letters, digits, '-' or '_'".to_string(),
        });
    }
    Ok(())
}

/// Stable cluster id derived from the name, used for `-clusterid`. Names
/// that differ only in case share an id, so only one of them may exist.
pub fn cluster_id(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Server names in plan order
pub fn planned_names(cluster_name: &str, maps: &[MapSelection]) -> Vec<String> {
    maps.iter()
        .flat_map(|sel| {
            (0..sel.count).map(move |i| super::server::server_name(cluster_name, sel.map, i, sel.count))
        })
        .collect()
}

/// Plans clusters against a snapshot of ports already used on the host
#[derive(Debug, Clone, Default)]
pub struct ClusterPlanner {
    existing: PortTable,
}

impl ClusterPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports held by servers outside the cluster being planned
    pub fn with_existing(existing: PortTable) -> Self {
        Self { existing }
    }

    pub fn plan(&self, request: &ClusterRequest) -> Result<ClusterSpec, PlanError> {
        validate_cluster_name(&request.name)?;
        let invalid = |reason: String| PlanError::InvalidRequest {
            cluster: request.name.clone(),
            reason,
        };

        let mut maps_seen = HashSet::new();
        for sel in &request.maps {
            if !maps_seen.insert(sel.map) {
                return Err(invalid(format!("map {} selected twice", sel.map)));
            }
        }

        let names = planned_names(&request.name, &request.maps);
        let known: HashSet<&str> = names.iter().map(String::as_str).collect();
        if let Some(unknown) = request.overrides.keys().find(|k| !known.contains(k.as_str())) {
            return Err(invalid(format!("override for unknown server '{}'", unknown)));
        }

        let context = ClusterContext {
            cluster_id: cluster_id(&request.name),
            cluster_name: request.name.clone(),
        };

        let mut allocator = PortAllocator::new(request.ports).with_existing(&self.existing);
        let no_override = ServerOverride::default();
        let override_for = |name: &str| request.overrides.get(name).unwrap_or(&no_override);
        allocator.reserve_overrides(names.iter().map(|n| (n.as_str(), &override_for(n).ports)))?;

        let mut servers = Vec::with_capacity(names.len());
        let mut names_iter = names.iter();
        for sel in &request.maps {
            for index in 0..sel.count {
                let name = names_iter
                    .next()
                    .ok_or_else(|| invalid("server name sequence ended early".to_string()))?;
                let ports = allocator.assign(name, &override_for(name).ports)?;
                let settings = request.settings_for(name);
                let spec = build(
                    &context,
                    BuildInput {
                        map: sel.map,
                        index,
                        count_for_map: sel.count,
                        ports,
                        mods: request.mods.resolve_for(name),
                        settings: &settings,
                    },
                )?;
                servers.push(spec);
            }
        }

        if let Some(err) = find_duplicate(servers.iter().map(|s| (s.name.as_str(), &s.ports))) {
            return Err(err.into());
        }

        Ok(ClusterSpec {
            id: context.cluster_id,
            name: request.name.clone(),
            description: request.description.clone(),
            maps: request.maps.clone(),
            base_port_config: request.ports,
            max_players: request.max_players,
            password: request.password.clone(),
            admin_password: request.admin_password.clone(),
            global_settings: request.global_settings.clone(),
            mods: request.mods.clone(),
            overrides: request.overrides.clone(),
            servers,
        })
    }
}

/// Plan a request on an empty host
pub fn plan(request: &ClusterRequest) -> Result<ClusterSpec, PlanError> {
    ClusterPlanner::new().plan(request)
}
