//! Artifact generation - ServerSpec -> launch command, scripts, config files
//!
//! `generate` is a pure function of the ServerSpec and the GlobalConfig:
//! calling it twice with the same inputs produces byte-identical artifacts,
//! which is what lets the dashboard diff against what is on disk.
//!
//! `ArtifactWriter` is the I/O side. It remembers the checksum of every file
//! it writes and refuses to overwrite a file that was edited by hand unless
//! the caller forces a regeneration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ini::{merge_into, render_ini, set};
use crate::cluster::mods::format_mod_list;
use crate::cluster::server::ServerSpec;
use crate::config::{GlobalConfig, IniSections};

/// File name of the user settings fragment
pub const GAME_USER_SETTINGS: &str = "GameUserSettings.ini";

/// File name of the game rules fragment
pub const GAME_INI: &str = "Game.ini";

/// Generated start script
pub const LAUNCH_SCRIPT: &str = "launch.sh";

/// Generated environment file
pub const ENV_FILE: &str = "server.env";

/// Where the server reads its INI files, relative to the server directory
pub const CONFIG_SUBDIR: &str = "ShooterGame/Saved/Config/WindowsServer";

const MANIFEST: &str = ".arkfleet-manifest.json";

const SERVER_BINARY: &str = "ShooterGame/Binaries/Win64/ArkAscendedServer.exe";

const SERVER_SETTINGS: &str = "ServerSettings";
const SESSION_SETTINGS: &str = "SessionSettings";
const GAME_SESSION: &str = "/Script/Engine.GameSession";
const GAME_MODE: &str = "/Script/ShooterGame.ShooterGameMode";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O error for '{0}': {1}")]
    Io(String, std::io::Error),

    #[error("Corrupt artifact manifest for '{0}': {1}")]
    Manifest(String, String),
}

/// Everything a supervisor needs to run one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeArtifact {
    /// Server the artifacts belong to
    pub server: String,
    /// Full command line, binary included
    pub launch_command: String,
    /// Arguments passed to the server binary
    pub launch_args: Vec<String>,
    /// Start script
    pub script_content: String,
    /// File name -> content
    pub config_fragments: BTreeMap<String, String>,
    /// Environment of the server process
    pub environment: BTreeMap<String, String>,
    /// SHA-256 over every generated byte
    pub checksum: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Built-in defaults every server receives
pub fn default_game_user_settings() -> IniSections {
    let mut sections = IniSections::new();
    set(&mut sections, SERVER_SETTINGS, "DifficultyOffset", "1.0");
    set(&mut sections, SERVER_SETTINGS, "XPMultiplier", "1.0");
    set(&mut sections, SERVER_SETTINGS, "TamingSpeedMultiplier", "1.0");
    set(&mut sections, SERVER_SETTINGS, "HarvestAmountMultiplier", "1.0");
    set(&mut sections, SERVER_SETTINGS, "AllowThirdPersonPlayer", "True");
    set(&mut sections, SERVER_SETTINGS, "ServerCrosshair", "True");
    sections
}

/// Built-in `Game.ini` defaults
pub fn default_game_ini() -> IniSections {
    let mut sections = IniSections::new();
    set(&mut sections, GAME_MODE, "bUseSingleplayerSettings", "False");
    sections
}

/// Launch arguments: `Map?opt=value?...` followed by dash flags
pub fn launch_args(spec: &ServerSpec) -> Vec<String> {
    let mut url = format!(
        "{}?listen?SessionName={}?Port={}?QueryPort={}?RCONEnabled=True?RCONPort={}?MaxPlayers={}",
        spec.map.launch_id(),
        spec.session_name,
        spec.ports.game,
        spec.ports.query,
        spec.ports.rcon,
        spec.max_players
    );
    // An empty password means "no password" and is left out entirely
    if !spec.password.is_empty() {
        url.push_str(&format!("?ServerPassword={}", spec.password));
    }
    if !spec.admin_password.is_empty() {
        url.push_str(&format!("?ServerAdminPassword={}", spec.admin_password));
    }

    let mut args = vec![url, format!("-WinLiveMaxPlayers={}", spec.max_players)];
    args.push(format!("-clusterid={}", spec.cluster_id));
    args.push("-NoTransferFromFiltering".to_string());
    if !spec.mods.is_empty() {
        args.push(format!("-mods={}", format_mod_list(&spec.mods)));
    }
    args.push("-servergamelog".to_string());
    args
}

/// Render `GameUserSettings.ini` for a server.
///
/// Excluded servers get the built-in defaults plus their identity keys only;
/// global overrides and the server's game rules are never applied to them.
pub fn render_game_user_settings(spec: &ServerSpec, global: &GlobalConfig) -> String {
    let mut sections = default_game_user_settings();

    if !global.is_excluded(&spec.name) {
        merge_into(&mut sections, &global.game_user_settings);
        for (key, value) in &spec.game_rules {
            set(&mut sections, SERVER_SETTINGS, key, value.clone());
        }
    }

    set(&mut sections, SERVER_SETTINGS, "RCONEnabled", "True");
    set(&mut sections, SERVER_SETTINGS, "RCONPort", spec.ports.rcon.to_string());
    set(&mut sections, SERVER_SETTINGS, "ServerPassword", spec.password.clone());
    set(&mut sections, SERVER_SETTINGS, "ServerAdminPassword", spec.admin_password.clone());
    set(&mut sections, SESSION_SETTINGS, "SessionName", spec.session_name.clone());
    set(&mut sections, SESSION_SETTINGS, "Port", spec.ports.game.to_string());
    set(&mut sections, SESSION_SETTINGS, "QueryPort", spec.ports.query.to_string());
    set(&mut sections, GAME_SESSION, "MaxPlayers", spec.max_players.to_string());

    render_ini(&sections)
}

/// Render `Game.ini` for a server; excluded servers get defaults only
pub fn render_game_ini(spec: &ServerSpec, global: &GlobalConfig) -> String {
    let mut sections = default_game_ini();
    if !global.is_excluded(&spec.name) {
        merge_into(&mut sections, &global.game_ini);
    }
    render_ini(&sections)
}

/// Environment variables for container-based supervisors
pub fn environment(spec: &ServerSpec, args: &[String]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("ASA_START_PARAMS".to_string(), args.join(" "));
    env.insert("SERVER_MAP".to_string(), spec.map.launch_id().to_string());
    env.insert("SESSION_NAME".to_string(), spec.session_name.clone());
    env.insert("SERVER_PORT".to_string(), spec.ports.game.to_string());
    env.insert("QUERY_PORT".to_string(), spec.ports.query.to_string());
    env.insert("RCON_PORT".to_string(), spec.ports.rcon.to_string());
    env.insert("MAX_PLAYERS".to_string(), spec.max_players.to_string());
    env.insert("SERVER_PASSWORD".to_string(), spec.password.clone());
    env.insert("ADMIN_PASSWORD".to_string(), spec.admin_password.clone());
    env.insert("MOD_IDS".to_string(), format_mod_list(&spec.mods));
    env.insert("CLUSTER_ID".to_string(), spec.cluster_id.clone());
    env
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn render_script(spec: &ServerSpec, args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    format!(
        "#!/usr/bin/env bash\n\
         # {name} ({map}) - generated by arkfleet, regenerate instead of editing\n\
         set -euo pipefail\n\
         cd \"$(dirname \"$0\")\"\n\
         exec \"${{ASA_BINARY:-./{binary}}}\" {args}\n",
        name = spec.name,
        map = spec.map,
        binary = SERVER_BINARY,
        args = quoted.join(" ")
    )
}

fn render_env_file(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("{}={}\n", k, shell_quote(v)))
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn artifact_checksum(
    launch_command: &str,
    script: &str,
    fragments: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(launch_command.as_bytes());
    hasher.update([0]);
    hasher.update(script.as_bytes());
    for (name, content) in fragments {
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
    }
    for (key, value) in env {
        hasher.update([0]);
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Render every runtime artifact for a server
pub fn generate(spec: &ServerSpec, global: &GlobalConfig) -> RuntimeArtifact {
    let args = launch_args(spec);
    let launch_command = format!("{} {}", SERVER_BINARY, args.join(" "));
    let script_content = render_script(spec, &args);

    let mut config_fragments = BTreeMap::new();
    config_fragments.insert(
        GAME_USER_SETTINGS.to_string(),
        render_game_user_settings(spec, global),
    );
    config_fragments.insert(GAME_INI.to_string(), render_game_ini(spec, global));

    let environment = environment(spec, &args);
    let checksum = artifact_checksum(&launch_command, &script_content, &config_fragments, &environment);

    RuntimeArtifact {
        server: spec.name.clone(),
        launch_command,
        launch_args: args,
        script_content,
        config_fragments,
        environment,
        checksum,
    }
}

impl RuntimeArtifact {
    /// Relative path -> content of every file the writer lays down
    pub fn files(&self) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert(LAUNCH_SCRIPT.to_string(), self.script_content.clone());
        files.insert(ENV_FILE.to_string(), render_env_file(&self.environment));
        for (name, content) in &self.config_fragments {
            files.insert(format!("{}/{}", CONFIG_SUBDIR, name), content.clone());
        }
        files
    }
}

// ============================================================================
// I/O: writing artifacts without clobbering manual edits
// ============================================================================

/// Checksums of the files last written for a server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    /// Checksum of the generation fully on disk; empty while files are skipped
    pub checksum: String,
    /// When the manifest was last written
    pub generated_at: Option<DateTime<Utc>>,
    /// Relative path -> SHA-256 of the content written
    pub files: BTreeMap<String, String>,
}

/// Outcome of writing one server's artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReport {
    /// Files (re)written
    pub written: Vec<String>,
    /// Files already current
    pub unchanged: Vec<String>,
    /// Files edited outside arkfleet, left untouched
    pub skipped: Vec<String>,
}

/// Writes artifacts under `<root>/<server>/`
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one server's files (also its data mount)
    pub fn server_dir(&self, server: &str) -> PathBuf {
        self.root.join(server)
    }

    async fn read_manifest(&self, server: &str) -> Result<ArtifactManifest, ArtifactError> {
        let path = self.server_dir(server).join(MANIFEST);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| ArtifactError::Manifest(server.to_string(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ArtifactManifest::default()),
            Err(e) => Err(ArtifactError::Io(server.to_string(), e)),
        }
    }

    async fn write_file(&self, server: &str, path: &Path, content: &str) -> Result<(), ArtifactError> {
        let io = |e| ArtifactError::Io(server.to_string(), e);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(path, content).await.map_err(io)
    }

    /// Write a server's artifacts.
    ///
    /// A file whose on-disk content no longer matches what was last written
    /// (or that exists without having been written by us) is left alone
    /// unless `force` is set.
    pub async fn write(&self, artifact: &RuntimeArtifact, force: bool) -> Result<WriteReport, ArtifactError> {
        let server = artifact.server.as_str();
        let dir = self.server_dir(server);
        let mut manifest = self.read_manifest(server).await?;
        let mut report = WriteReport::default();

        for (rel, content) in artifact.files() {
            let path = dir.join(&rel);
            let wanted = sha256_hex(content.as_bytes());

            let on_disk = match tokio::fs::read(&path).await {
                Ok(bytes) => Some(sha256_hex(&bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(ArtifactError::Io(server.to_string(), e)),
            };

            match on_disk {
                Some(current) if current == wanted => {
                    manifest.files.insert(rel.clone(), wanted);
                    report.unchanged.push(rel);
                    continue;
                }
                Some(current) if !force && manifest.files.get(&rel) != Some(&current) => {
                    warn!(
                        "Not overwriting {} for '{}': edited outside arkfleet (force to regenerate)",
                        rel, server
                    );
                    report.skipped.push(rel);
                    continue;
                }
                _ => {}
            }

            self.write_file(server, &path, &content).await?;
            manifest.files.insert(rel.clone(), wanted);
            report.written.push(rel);
        }

        // Skipped files mean disk does not hold this generation
        let checksum = if report.skipped.is_empty() {
            artifact.checksum.clone()
        } else {
            String::new()
        };
        if !report.written.is_empty() || manifest.checksum != checksum {
            manifest.checksum = checksum;
            manifest.generated_at = Some(Utc::now());
            let json = serde_json::to_string_pretty(&manifest)
                .map_err(|e| ArtifactError::Manifest(server.to_string(), e.to_string()))?;
            self.write_file(server, &dir.join(MANIFEST), &json).await?;
        }

        info!(
            "Artifacts for '{}': {} written, {} unchanged, {} skipped",
            server,
            report.written.len(),
            report.unchanged.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Delete the generated files of a server. Save data is kept.
    pub async fn remove(&self, server: &str) -> Result<usize, ArtifactError> {
        let dir = self.server_dir(server);
        let manifest = self.read_manifest(server).await?;
        let mut removed = 0;
        for rel in manifest.files.keys().map(String::as_str).chain([MANIFEST]) {
            match tokio::fs::remove_file(dir.join(rel)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ArtifactError::Io(server.to_string(), e)),
            }
        }
        debug!("Removed {} artifact file(s) for '{}'", removed, server);
        Ok(removed)
    }

    /// Manifest of the last write, if any
    pub async fn manifest(&self, server: &str) -> Result<ArtifactManifest, ArtifactError> {
        self.read_manifest(server).await
    }
}
