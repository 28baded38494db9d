//! ServerSpec - the declarative description of one server instance
//!
//! A ServerSpec is immutable once built. Changing a server's settings means
//! building a new spec and regenerating its artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::mods::ModId;
use super::ports::PortAssignment;

/// Lowest accepted player slot count
pub const MIN_PLAYERS: u32 = 1;

/// Highest accepted player slot count
pub const MAX_PLAYERS: u32 = 100;

/// Default player slot count for new servers
pub const DEFAULT_MAX_PLAYERS: u32 = 70;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Invalid server spec '{server}': {reason}")]
    InvalidServerSpec { server: String, reason: String },

    #[error("Unsupported map '{0}'")]
    UnsupportedMap(String),
}

/// Maps an ASA server can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GameMap {
    TheIsland,
    ScorchedEarth,
    TheCenter,
    Aberration,
    Extinction,
    Ragnarok,
    Valguero,
    Astraeos,
    LostColony,
    ClubArk,
}

impl GameMap {
    pub const ALL: [GameMap; 10] = [
        GameMap::TheIsland,
        GameMap::ScorchedEarth,
        GameMap::TheCenter,
        GameMap::Aberration,
        GameMap::Extinction,
        GameMap::Ragnarok,
        GameMap::Valguero,
        GameMap::Astraeos,
        GameMap::LostColony,
        GameMap::ClubArk,
    ];

    /// Name used in server names and the API
    pub fn name(&self) -> &'static str {
        match self {
            GameMap::TheIsland => "TheIsland",
            GameMap::ScorchedEarth => "ScorchedEarth",
            GameMap::TheCenter => "TheCenter",
            GameMap::Aberration => "Aberration",
            GameMap::Extinction => "Extinction",
            GameMap::Ragnarok => "Ragnarok",
            GameMap::Valguero => "Valguero",
            GameMap::Astraeos => "Astraeos",
            GameMap::LostColony => "LostColony",
            GameMap::ClubArk => "ClubArk",
        }
    }

    /// Level name passed on the server command line
    pub fn launch_id(&self) -> &'static str {
        match self {
            GameMap::TheIsland => "TheIsland_WP",
            GameMap::ScorchedEarth => "ScorchedEarth_WP",
            GameMap::TheCenter => "TheCenter_WP",
            GameMap::Aberration => "Aberration_WP",
            GameMap::Extinction => "Extinction_WP",
            GameMap::Ragnarok => "Ragnarok_WP",
            GameMap::Valguero => "Valguero_WP",
            GameMap::Astraeos => "Astraeos_WP",
            GameMap::LostColony => "LostColony_WP",
            GameMap::ClubArk => "BobsMissions_WP",
        }
    }
}

impl fmt::Display for GameMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GameMap {
    type Err = SpecError;

    /// Accepts the display name or the launch id, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameMap::ALL
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(s) || m.launch_id().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| SpecError::UnsupportedMap(s.to_string()))
    }
}

impl TryFrom<String> for GameMap {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GameMap> for String {
    fn from(map: GameMap) -> Self {
        map.name().to_string()
    }
}

/// Identity of the cluster a server is being built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterContext {
    pub cluster_id: String,
    pub cluster_name: String,
}

/// Scalar server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Player slots
    pub max_players: u32,
    /// Join password
    #[serde(default)]
    pub password: String,
    /// Admin password
    #[serde(default)]
    pub admin_password: String,
    /// Game-rule key/values for the `[ServerSettings]` section
    #[serde(default)]
    pub game_rules: BTreeMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_players: DEFAULT_MAX_PLAYERS,
            password: String::new(),
            admin_password: String::new(),
            game_rules: BTreeMap::new(),
        }
    }
}

/// One planned server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Unique server name (`{cluster}-{map}[-{n}]`)
    pub name: String,
    /// Hosted map
    pub map: GameMap,
    /// Name shown in the server browser
    pub session_name: String,
    /// Assigned ports
    pub ports: PortAssignment,
    /// Player slots
    pub max_players: u32,
    /// Join password; empty means none
    #[serde(default)]
    pub password: String,
    /// Admin password; empty means none
    #[serde(default)]
    pub admin_password: String,
    /// Effective mod list, in load order
    #[serde(default)]
    pub mods: Vec<ModId>,
    /// Lookup-only reference to the owning cluster
    pub cluster_id: String,
    /// Extra `ServerSettings` keys
    #[serde(default)]
    pub game_rules: BTreeMap<String, String>,
}

/// `{cluster}-{map}` for a single instance, `{cluster}-{map}-{n}` (1-based) otherwise
pub fn server_name(cluster_name: &str, map: GameMap, index: usize, count_for_map: usize) -> String {
    if count_for_map == 1 {
        format!("{}-{}", cluster_name, map.name())
    } else {
        format!("{}-{}-{}", cluster_name, map.name(), index + 1)
    }
}

/// Everything the builder needs for one server
#[derive(Debug, Clone)]
pub struct BuildInput<'a> {
    pub map: GameMap,
    /// Index among servers of the same map
    pub index: usize,
    /// Number of servers planned for this map
    pub count_for_map: usize,
    pub ports: PortAssignment,
    pub mods: Vec<ModId>,
    pub settings: &'a ServerSettings,
}

/// Build and validate a ServerSpec
pub fn build(context: &ClusterContext, input: BuildInput<'_>) -> Result<ServerSpec, SpecError> {
    let name = server_name(&context.cluster_name, input.map, input.index, input.count_for_map);
    let settings = input.settings;

    validate_max_players(&name, settings.max_players)?;
    validate_password(&name, "password", &settings.password)?;
    validate_password(&name, "adminPassword", &settings.admin_password)?;

    Ok(ServerSpec {
        session_name: name.clone(),
        name,
        map: input.map,
        ports: input.ports,
        max_players: settings.max_players,
        password: settings.password.clone(),
        admin_password: settings.admin_password.clone(),
        mods: input.mods,
        cluster_id: context.cluster_id.clone(),
        game_rules: settings.game_rules.clone(),
    })
}

fn validate_max_players(server: &str, max_players: u32) -> Result<(), SpecError> {
    if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&max_players) {
        return Err(SpecError::InvalidServerSpec {
            server: server.to_string(),
            reason: format!(
                "maxPlayers {} outside [{}, {}]",
                max_players, MIN_PLAYERS, MAX_PLAYERS
            ),
        });
    }
    Ok(())
}

/// Passwords end up inside the `?key=value` launch URL, so its separators,
/// quotes and whitespace are rejected.
fn validate_password(server: &str, field: &str, password: &str) -> Result<(), SpecError> {
    match password
        .chars()
        .find(|c| matches!(c, '?' | '=' | '"' | '\\') || c.is_whitespace() || c.is_control())
    {
        Some(c) => Err(SpecError::InvalidServerSpec {
            server: server.to_string(),
            reason: format!("{} contains unsupported character {:?}", field, c),
        }),
        None => Ok(()),
    }
}

impl ServerSpec {
    /// Re-check invariants on a spec that arrived from outside (store, API)
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_max_players(&self.name, self.max_players)?;
        validate_password(&self.name, "password", &self.password)?;
        validate_password(&self.name, "adminPassword", &self.admin_password)?;
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.mods.iter().find(|id| !seen.insert(**id)) {
            return Err(SpecError::InvalidServerSpec {
                server: self.name.clone(),
                reason: format!("mod {} listed twice", dup),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ClusterContext {
        ClusterContext {
            cluster_id: "c-123".to_string(),
            cluster_name: "Cluster1".to_string(),
        }
    }

    fn ports() -> PortAssignment {
        PortAssignment {
            game: 7777,
            query: 27015,
            rcon: 27020,
        }
    }

    #[test]
    fn test_server_name_single_and_multiple() {
        assert_eq!(server_name("Cluster1", GameMap::Ragnarok, 0, 1), "Cluster1-Ragnarok");
        assert_eq!(server_name("Cluster1", GameMap::TheIsland, 0, 2), "Cluster1-TheIsland-1");
        assert_eq!(server_name("Cluster1", GameMap::TheIsland, 1, 2), "Cluster1-TheIsland-2");
    }

    #[test]
    fn test_map_parsing() {
        assert_eq!("TheIsland".parse::<GameMap>().unwrap(), GameMap::TheIsland);
        assert_eq!("ragnarok_wp".parse::<GameMap>().unwrap(), GameMap::Ragnarok);
        assert_eq!("BobsMissions_WP".parse::<GameMap>().unwrap(), GameMap::ClubArk);
        assert_eq!(
            "Genesis".parse::<GameMap>(),
            Err(SpecError::UnsupportedMap("Genesis".to_string()))
        );
    }

    #[test]
    fn test_map_serde_rejects_unknown() {
        let map: GameMap = serde_json::from_str(r#""Valguero""#).unwrap();
        assert_eq!(map, GameMap::Valguero);
        assert!(serde_json::from_str::<GameMap>(r#""Fjordur""#).is_err());
    }

    #[test]
    fn test_build() {
        let settings = ServerSettings {
            max_players: 20,
            admin_password: "secret".into(),
            ..Default::default()
        };
        let spec = build(
            &context(),
            BuildInput {
                map: GameMap::TheIsland,
                index: 1,
                count_for_map: 2,
                ports: ports(),
                mods: vec![1, 2],
                settings: &settings,
            },
        )
        .unwrap();

        assert_eq!(spec.name, "Cluster1-TheIsland-2");
        assert_eq!(spec.session_name, spec.name);
        assert_eq!(spec.cluster_id, "c-123");
        assert_eq!(spec.max_players, 20);
        assert_eq!(spec.password, "");
        assert_eq!(spec.mods, vec![1, 2]);
    }

    #[test]
    fn test_build_rejects_max_players() {
        for bad in [0, 101] {
            let settings = ServerSettings {
                max_players: bad,
                ..Default::default()
            };
            let err = build(
                &context(),
                BuildInput {
                    map: GameMap::Aberration,
                    index: 0,
                    count_for_map: 1,
                    ports: ports(),
                    mods: vec![],
                    settings: &settings,
                },
            )
            .unwrap_err();
            assert!(matches!(err, SpecError::InvalidServerSpec { ref server, .. } if server == "Cluster1-Aberration"));
        }
    }

    #[test]
    fn test_validate_duplicate_mods() {
        let spec = ServerSpec {
            name: "s".into(),
            map: GameMap::TheCenter,
            session_name: "s".into(),
            ports: ports(),
            max_players: 10,
            password: String::new(),
            admin_password: String::new(),
            mods: vec![5, 6, 5],
            cluster_id: "c".into(),
            game_rules: BTreeMap::new(),
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_password_with_url_separators_rejected() {
        for bad in ["a?b", "key=value", "two words", "tab\there", "quo\"te"] {
            let settings = ServerSettings {
                password: bad.to_string(),
                ..ServerSettings::default()
            };
            let input = BuildInput {
                map: GameMap::TheIsland,
                index: 0,
                count_for_map: 1,
                ports: ports(),
                mods: vec![],
                settings: &settings,
            };
            assert!(
                matches!(build(&context(), input), Err(SpecError::InvalidServerSpec { .. })),
                "{:?} accepted",
                bad
            );
        }

        let settings = ServerSettings {
            admin_password: "S3cret!#&".to_string(),
            ..ServerSettings::default()
        };
        let input = BuildInput {
            map: GameMap::TheIsland,
            index: 0,
            count_for_map: 1,
            ports: ports(),
            mods: vec![],
            settings: &settings,
        };
        let spec = build(&context(), input).unwrap();
        spec.validate().unwrap();

        let mut stored = spec;
        stored.admin_password = "x y".into();
        assert!(stored.validate().is_err());
    }
}
