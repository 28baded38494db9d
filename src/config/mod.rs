pub mod global;
pub mod manager;
pub mod request;

pub use global::{GlobalConfig, IniSections};
pub use manager::{
    default_config_path, load_config_from, parse_config, save_config_to, ApiConfig,
    InstallConfig, LifecycleConfig, ManagerConfig, SupervisorConfig,
};
pub use request::{parse_cluster_request, strip_jsonc_comments, RequestError};

use std::path::Path;
use thiserror::Error;

use crate::cluster::planner::ClusterRequest;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cluster request error: {0}")]
    RequestError(#[from] RequestError),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid path '{0}': {1}")]
    InvalidPath(String, String),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a cluster request file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure parsing functions.
pub fn load_request_file(path: &Path) -> Result<ClusterRequest, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let request = parse_cluster_request(&content)?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_request_file() {
        let content = r#"{
            "name": "Cluster1",
            "maps": [{"map": "TheIsland", "count": 1}]
        }"#;

        let file = create_temp_file(content);
        let request = load_request_file(file.path()).unwrap();
        assert_eq!(request.server_count(), 1);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_request_file(Path::new("/nonexistent/file.json"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_malformed_request() {
        let file = create_temp_file("{ not json");
        let result = load_request_file(file.path());
        assert!(matches!(result, Err(ConfigError::RequestError(_))));
    }
}
