//! Host-wide game configuration shared by every managed server

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// INI sections keyed by section name, then key -> value.
///
/// Ordered maps keep rendering deterministic.
pub type IniSections = BTreeMap<String, BTreeMap<String, String>>;

/// Global config overrides applied to generated config files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Overrides for `GameUserSettings.ini`
    #[serde(default)]
    pub game_user_settings: IniSections,

    /// Overrides for `Game.ini`
    #[serde(default)]
    pub game_ini: IniSections,

    /// Servers that only ever receive default config (externally managed)
    #[serde(default)]
    pub excluded_servers: BTreeSet<String>,

    /// Servers hidden from listings
    #[serde(default)]
    pub hidden_servers: BTreeSet<String>,
}

impl GlobalConfig {
    pub fn is_excluded(&self, server: &str) -> bool {
        self.excluded_servers.contains(server)
    }

    pub fn is_hidden(&self, server: &str) -> bool {
        self.hidden_servers.contains(server)
    }

    /// Set one `GameUserSettings.ini` override
    pub fn set_game_user_setting(
        &mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.game_user_settings
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Set one `Game.ini` override
    pub fn set_game_ini(
        &mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.game_ini
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_and_hidden() {
        let mut config = GlobalConfig::default();
        config.excluded_servers.insert("legacy".into());
        config.hidden_servers.insert("scratch".into());
        assert!(config.is_excluded("legacy"));
        assert!(!config.is_excluded("scratch"));
        assert!(config.is_hidden("scratch"));
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "gameUserSettings": {"ServerSettings": {"XPMultiplier": "3"}},
            "excludedServers": ["legacy"]
        }"#;
        let config: GlobalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.game_user_settings["ServerSettings"]["XPMultiplier"], "3");
        assert!(config.game_ini.is_empty());
        assert!(config.is_excluded("legacy"));
    }
}
