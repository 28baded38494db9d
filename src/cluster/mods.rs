//! Mod list resolution
//!
//! Shared (cluster-wide) mods load first, then the server's own additions.
//! Load order matters to the game, so resolution never reorders ids; it only
//! drops later duplicates.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Steam Workshop / CurseForge mod id
pub type ModId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModError {
    #[error("Invalid mod id '{0}': mod ids are numeric")]
    InvalidModId(String),
}

/// Per-server adjustments to the shared mod list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerModOverride {
    /// Mods loaded after the shared ones
    #[serde(default)]
    pub additional_mods: Vec<ModId>,
    /// Shared mods this server leaves out
    #[serde(default)]
    pub exclude_shared_mods: bool,
}

/// Mod configuration for a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModConfig {
    /// Mods every server loads
    #[serde(default)]
    pub shared_mods: Vec<ModId>,
    /// Keyed by server name
    #[serde(default)]
    pub server_mods: BTreeMap<String, ServerModOverride>,
}

impl ModConfig {
    /// Final ordered mod list for the named server
    pub fn resolve_for(&self, server: &str) -> Vec<ModId> {
        match self.server_mods.get(server) {
            Some(overrides) => resolve(&self.shared_mods, overrides),
            None => dedup_preserving_order(&self.shared_mods),
        }
    }
}

/// Merge shared mods with a server override.
///
/// With `exclude_shared_mods` only the server's additions are used.
/// Otherwise shared mods come first and keep precedence over additions.
pub fn resolve(shared: &[ModId], overrides: &ServerModOverride) -> Vec<ModId> {
    if overrides.exclude_shared_mods {
        return dedup_preserving_order(&overrides.additional_mods);
    }
    let merged: Vec<ModId> = shared
        .iter()
        .chain(overrides.additional_mods.iter())
        .copied()
        .collect();
    dedup_preserving_order(&merged)
}

/// Remove duplicates, keeping the first occurrence
pub fn dedup_preserving_order(ids: &[ModId]) -> Vec<ModId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Parse a comma separated list as typed into the dashboard ("123, 456")
pub fn parse_mod_list(input: &str) -> Result<Vec<ModId>, ModError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ModId>().map_err(|_| ModError::InvalidModId(s.to_string())))
        .collect()
}

/// Render a mod list for the `-mods=` launch flag
pub fn format_mod_list(ids: &[ModId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ModId = 928102085;
    const B: ModId = 929420;
    const C: ModId = 931874;

    fn overrides(additional: Vec<ModId>, exclude: bool) -> ServerModOverride {
        ServerModOverride {
            additional_mods: additional,
            exclude_shared_mods: exclude,
        }
    }

    #[test]
    fn test_shared_then_additional() {
        assert_eq!(resolve(&[A, B], &overrides(vec![C], false)), vec![A, B, C]);
    }

    #[test]
    fn test_duplicate_keeps_first_occurrence() {
        assert_eq!(resolve(&[A, B], &overrides(vec![B, C], false)), vec![A, B, C]);
        assert_eq!(resolve(&[B, A], &overrides(vec![A], false)), vec![B, A]);
    }

    #[test]
    fn test_exclude_shared() {
        assert_eq!(resolve(&[A, B], &overrides(vec![C], true)), vec![C]);
        assert_eq!(resolve(&[A], &overrides(vec![C, C, B], true)), vec![C, B]);
        assert!(resolve(&[A, B], &overrides(vec![], true)).is_empty());
    }

    #[test]
    fn test_resolve_for_server_without_override() {
        let config = ModConfig {
            shared_mods: vec![A, A, B],
            server_mods: BTreeMap::new(),
        };
        assert_eq!(config.resolve_for("anything"), vec![A, B]);
    }

    #[test]
    fn test_resolve_for_server_with_override() {
        let mut server_mods = BTreeMap::new();
        server_mods.insert("c1-Ragnarok".to_string(), overrides(vec![C], false));
        let config = ModConfig {
            shared_mods: vec![A],
            server_mods,
        };
        assert_eq!(config.resolve_for("c1-Ragnarok"), vec![A, C]);
        assert_eq!(config.resolve_for("c1-TheIsland"), vec![A]);
    }

    #[test]
    fn test_parse_mod_list() {
        assert_eq!(parse_mod_list("1, 2,3,").unwrap(), vec![1, 2, 3]);
        assert!(parse_mod_list("").unwrap().is_empty());
        assert_eq!(
            parse_mod_list("1,abc"),
            Err(ModError::InvalidModId("abc".to_string()))
        );
    }

    #[test]
    fn test_format_mod_list() {
        assert_eq!(format_mod_list(&[3, 1, 2]), "3,1,2");
        assert_eq!(format_mod_list(&[]), "");
    }

    #[test]
    fn test_mod_config_json_shape() {
        let json = r#"{
            "sharedMods": [1, 2],
            "serverMods": {"c-TheIsland": {"additionalMods": [3], "excludeSharedMods": true}}
        }"#;
        let config: ModConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.resolve_for("c-TheIsland"), vec![3]);
    }
}
