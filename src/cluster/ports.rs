//! Port allocation for servers sharing a cluster
//!
//! Every server needs three ports: the game port, the Steam query port and the
//! RCON port. Each kind has its own base and increment so operators can keep
//! the ranges apart. Derived ports follow `base + k * increment`; explicit
//! overrides are reserved up front and the derived sequence skips them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default ASA game port
pub const DEFAULT_GAME_PORT: u16 = 7777;

/// Default Steam query port
pub const DEFAULT_QUERY_PORT: u16 = 27015;

/// Default RCON port
pub const DEFAULT_RCON_PORT: u16 = 27020;

/// Errors raised while allocating ports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("{kind} port range exhausted: base {base} + {index} x {increment} exceeds 65535")]
    PortRangeExhausted {
        kind: PortKind,
        base: u16,
        increment: u16,
        index: usize,
    },

    #[error("{kind} port {port} requested by '{server}' is already assigned to '{holder}'")]
    PortConflict {
        kind: PortKind,
        port: u16,
        server: String,
        holder: String,
    },
}

/// The three port kinds every server exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Game,
    Query,
    Rcon,
}

impl PortKind {
    pub const ALL: [PortKind; 3] = [PortKind::Game, PortKind::Query, PortKind::Rcon];
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Game => write!(f, "game"),
            PortKind::Query => write!(f, "query"),
            PortKind::Rcon => write!(f, "rcon"),
        }
    }
}

/// Base port and increment per kind, as entered in the cluster form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    /// First game port
    #[serde(default = "default_game_port")]
    pub base_port: u16,
    /// Step between game ports
    #[serde(default = "default_increment")]
    pub port_increment: u16,
    /// First query port
    #[serde(default = "default_query_port")]
    pub query_port_base: u16,
    /// Step between query ports
    #[serde(default = "default_increment")]
    pub query_port_increment: u16,
    /// First RCON port
    #[serde(default = "default_rcon_port")]
    pub rcon_port_base: u16,
    /// Step between RCON ports
    #[serde(default = "default_increment")]
    pub rcon_port_increment: u16,
}

fn default_game_port() -> u16 {
    DEFAULT_GAME_PORT
}

fn default_query_port() -> u16 {
    DEFAULT_QUERY_PORT
}

fn default_rcon_port() -> u16 {
    DEFAULT_RCON_PORT
}

fn default_increment() -> u16 {
    1
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_GAME_PORT,
            port_increment: 1,
            query_port_base: DEFAULT_QUERY_PORT,
            query_port_increment: 1,
            rcon_port_base: DEFAULT_RCON_PORT,
            rcon_port_increment: 1,
        }
    }
}

impl PortConfig {
    /// Base and increment for one port kind
    pub fn range(&self, kind: PortKind) -> (u16, u16) {
        match kind {
            PortKind::Game => (self.base_port, self.port_increment),
            PortKind::Query => (self.query_port_base, self.query_port_increment),
            PortKind::Rcon => (self.rcon_port_base, self.rcon_port_increment),
        }
    }
}

/// Concrete ports of one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Game port (UDP)
    pub game: u16,
    /// Steam query port (UDP)
    pub query: u16,
    /// RCON port (TCP)
    pub rcon: u16,
}

impl PortAssignment {
    pub fn get(&self, kind: PortKind) -> u16 {
        match kind {
            PortKind::Game => self.game,
            PortKind::Query => self.query,
            PortKind::Rcon => self.rcon,
        }
    }

    fn set(&mut self, kind: PortKind, port: u16) {
        match kind {
            PortKind::Game => self.game = port,
            PortKind::Query => self.query = port,
            PortKind::Rcon => self.rcon = port,
        }
    }
}

/// Explicit per-server port overrides; unset kinds are derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOverride {
    /// Game port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<u16>,
    /// Query port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<u16>,
    /// RCON port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcon: Option<u16>,
}

impl PortOverride {
    pub fn get(&self, kind: PortKind) -> Option<u16> {
        match kind {
            PortKind::Game => self.game,
            PortKind::Query => self.query,
            PortKind::Rcon => self.rcon,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.game.is_none() && self.query.is_none() && self.rcon.is_none()
    }
}

// ============================================================================
// SBIO: Pure allocation logic
// ============================================================================

/// `base + index * increment`, or `PortRangeExhausted` past 65535
pub fn allocate(kind: PortKind, base: u16, increment: u16, index: usize) -> Result<u16, PortError> {
    let exhausted = || PortError::PortRangeExhausted {
        kind,
        base,
        increment,
        index,
    };
    let offset = u32::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(u32::from(increment)))
        .ok_or_else(exhausted)?;
    let port = u32::from(base) + offset;
    u16::try_from(port).map_err(|_| exhausted())
}

/// Ports already taken on the host, keyed by kind, with their holder's name
pub type PortTable = BTreeMap<PortKind, BTreeMap<u16, String>>;

/// Assigns ports for a whole plan in one pass.
///
/// The allocator holds a consistent view of every reserved port, so callers
/// must build it from a snapshot of the host's assignments and finish the
/// plan before releasing that snapshot.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    config: PortConfig,
    taken: PortTable,
    cursors: BTreeMap<PortKind, usize>,
}

impl PortAllocator {
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            taken: PortTable::new(),
            cursors: BTreeMap::new(),
        }
    }

    /// Reserve ports owned by servers outside this plan
    pub fn with_existing(mut self, existing: &PortTable) -> Self {
        for (kind, ports) in existing {
            let entry = self.taken.entry(*kind).or_default();
            for (port, holder) in ports {
                entry.insert(*port, holder.clone());
            }
        }
        self
    }

    /// Reserve every explicit override before any derived port is handed out.
    ///
    /// `overrides` is in plan order, keyed by server name.
    pub fn reserve_overrides<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = (&'a str, &'a PortOverride)>,
    ) -> Result<(), PortError> {
        for (server, ports) in overrides {
            for kind in PortKind::ALL {
                if let Some(port) = ports.get(kind) {
                    self.claim(kind, port, server)?;
                }
            }
        }
        Ok(())
    }

    /// Ports for the next server in plan order
    pub fn assign(&mut self, server: &str, overrides: &PortOverride) -> Result<PortAssignment, PortError> {
        let mut assignment = PortAssignment {
            game: 0,
            query: 0,
            rcon: 0,
        };
        for kind in PortKind::ALL {
            let port = match overrides.get(kind) {
                Some(port) => {
                    self.claim(kind, port, server)?;
                    port
                }
                None => self.next_derived(kind, server)?,
            };
            assignment.set(kind, port);
        }
        Ok(assignment)
    }

    /// Snapshot of all ports this allocator knows about
    pub fn taken(&self) -> &PortTable {
        &self.taken
    }

    fn claim(&mut self, kind: PortKind, port: u16, server: &str) -> Result<(), PortError> {
        let entry = self.taken.entry(kind).or_default();
        if let Some(holder) = entry.get(&port) {
            if holder != server {
                return Err(PortError::PortConflict {
                    kind,
                    port,
                    server: server.to_string(),
                    holder: holder.clone(),
                });
            }
        }
        entry.insert(port, server.to_string());
        Ok(())
    }

    fn next_derived(&mut self, kind: PortKind, server: &str) -> Result<u16, PortError> {
        let (base, increment) = self.config.range(kind);
        let cursor = self.cursors.entry(kind).or_insert(0);

        loop {
            let port = allocate(kind, base, increment, *cursor)?;
            let holder = self.taken.get(&kind).and_then(|t| t.get(&port)).cloned();
            match holder {
                None => {
                    *cursor += 1;
                    self.taken
                        .entry(kind)
                        .or_default()
                        .insert(port, server.to_string());
                    return Ok(port);
                }
                // A zero increment never moves past a taken port
                Some(holder) if increment == 0 => {
                    return Err(PortError::PortConflict {
                        kind,
                        port,
                        server: server.to_string(),
                        holder,
                    });
                }
                Some(_) => *cursor += 1,
            }
        }
    }
}

/// Find the first `(kind, port)` pair shared by two servers
pub fn find_duplicate<'a>(
    servers: impl IntoIterator<Item = (&'a str, &'a PortAssignment)>,
) -> Option<PortError> {
    let mut seen: PortTable = PortTable::new();
    for (name, ports) in servers {
        for kind in PortKind::ALL {
            let port = ports.get(kind);
            let entry = seen.entry(kind).or_default();
            if let Some(holder) = entry.get(&port) {
                return Some(PortError::PortConflict {
                    kind,
                    port,
                    server: name.to_string(),
                    holder: holder.clone(),
                });
            }
            entry.insert(port, name.to_string());
        }
    }
    None
}

/// Collect a port table from named assignments
pub fn port_table<'a>(servers: impl IntoIterator<Item = (&'a str, &'a PortAssignment)>) -> PortTable {
    let mut table = PortTable::new();
    for (name, ports) in servers {
        for kind in PortKind::ALL {
            table
                .entry(kind)
                .or_default()
                .insert(ports.get(kind), name.to_string());
        }
    }
    table
}

/// Set of every port in use for one kind
pub fn ports_of_kind(table: &PortTable, kind: PortKind) -> BTreeSet<u16> {
    table
        .get(&kind)
        .map(|t| t.keys().copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_linear() {
        assert_eq!(allocate(PortKind::Game, 7777, 1, 0).unwrap(), 7777);
        assert_eq!(allocate(PortKind::Game, 7777, 2, 3).unwrap(), 7783);
    }

    #[test]
    fn test_allocate_overflow() {
        let err = allocate(PortKind::Query, 65530, 3, 2).unwrap_err();
        assert!(matches!(err, PortError::PortRangeExhausted { index: 2, .. }));
        assert_eq!(allocate(PortKind::Query, 65530, 5, 1).unwrap(), 65535);
    }

    #[test]
    fn test_kinds_are_independent() {
        let config = PortConfig {
            base_port: 7777,
            port_increment: 2,
            query_port_base: 27015,
            query_port_increment: 1,
            rcon_port_base: 32330,
            rcon_port_increment: 10,
        };
        let mut allocator = PortAllocator::new(config);
        let none = PortOverride::default();
        let first = allocator.assign("a", &none).unwrap();
        let second = allocator.assign("b", &none).unwrap();

        assert_eq!(first, PortAssignment { game: 7777, query: 27015, rcon: 32330 });
        assert_eq!(second, PortAssignment { game: 7779, query: 27016, rcon: 32340 });
    }

    #[test]
    fn test_override_is_skipped_by_derived_sequence() {
        let mut allocator = PortAllocator::new(PortConfig::default());
        let pinned = PortOverride {
            game: Some(7778),
            ..Default::default()
        };
        allocator.reserve_overrides([("b", &pinned)]).unwrap();

        let a = allocator.assign("a", &PortOverride::default()).unwrap();
        let b = allocator.assign("b", &pinned).unwrap();
        let c = allocator.assign("c", &PortOverride::default()).unwrap();

        assert_eq!(a.game, 7777);
        assert_eq!(b.game, 7778);
        assert_eq!(c.game, 7779);
        // query ports were never overridden, so they stay dense
        assert_eq!((a.query, b.query, c.query), (27015, 27016, 27017));
    }

    #[test]
    fn test_override_collision() {
        let mut allocator = PortAllocator::new(PortConfig::default());
        let one = PortOverride {
            rcon: Some(30000),
            ..Default::default()
        };
        let err = allocator
            .reserve_overrides([("a", &one), ("b", &one)])
            .unwrap_err();
        assert_eq!(
            err,
            PortError::PortConflict {
                kind: PortKind::Rcon,
                port: 30000,
                server: "b".into(),
                holder: "a".into(),
            }
        );
    }

    #[test]
    fn test_existing_ports_are_skipped() {
        let existing = port_table([(
            "other",
            &PortAssignment {
                game: 7777,
                query: 27015,
                rcon: 27020,
            },
        )]);
        let mut allocator = PortAllocator::new(PortConfig::default()).with_existing(&existing);
        let ports = allocator.assign("mine", &PortOverride::default()).unwrap();
        assert_eq!(ports, PortAssignment { game: 7778, query: 27016, rcon: 27021 });
    }

    #[test]
    fn test_zero_increment_conflicts_on_second_server() {
        let config = PortConfig {
            port_increment: 0,
            ..Default::default()
        };
        let mut allocator = PortAllocator::new(config);
        allocator.assign("a", &PortOverride::default()).unwrap();
        let err = allocator.assign("b", &PortOverride::default()).unwrap_err();
        assert!(matches!(err, PortError::PortConflict { kind: PortKind::Game, .. }));
    }

    #[test]
    fn test_find_duplicate() {
        let a = PortAssignment { game: 1, query: 2, rcon: 3 };
        let b = PortAssignment { game: 4, query: 2, rcon: 5 };
        let err = find_duplicate([("a", &a), ("b", &b)]).unwrap();
        assert!(matches!(err, PortError::PortConflict { kind: PortKind::Query, port: 2, .. }));
        assert!(find_duplicate([("a", &a)]).is_none());
    }

    #[test]
    fn test_port_config_deserializes_camel_case() {
        let json = r#"{"basePort": 8000, "portIncrement": 2}"#;
        let config: PortConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.base_port, 8000);
        assert_eq!(config.port_increment, 2);
        assert_eq!(config.query_port_base, DEFAULT_QUERY_PORT);
    }
}
