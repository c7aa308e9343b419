//! Server settings.
//!
//! Where to listen, where the project index lives, and how dispatch logs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main settings for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerSettings {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path to the project index file
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,

    /// Serve this project at the root instead of routing by the first
    /// path segment
    #[serde(default)]
    pub project: Option<String>,

    /// Dispatch logging
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_index_file() -> PathBuf {
    PathBuf::from("mocks/index.yaml")
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            index_file: default_index_file(),
            project: None,
            dispatch: DispatchSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Load settings from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_yaml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index_file.as_os_str().is_empty() {
            anyhow::bail!("indexFile cannot be empty");
        }
        if let Some(project) = &self.project {
            if project.trim().is_empty() {
                anyhow::bail!("project cannot be blank");
            }
        }
        Ok(())
    }
}

/// Which dispatch outcomes are logged at info/warn level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchSettings {
    /// Log requests answered by a rule
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no rule answered
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_config() {
        let yaml = include_str!("../config/default-config.yaml");
        let settings: ServerSettings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.listen, default_listen());
        assert_eq!(settings.index_file, PathBuf::from("mocks/index.yaml"));
        assert!(settings.project.is_none());
        assert!(settings.dispatch.log_unmatched);
    }

    #[test]
    fn test_parse_minimal_config() {
        let settings: ServerSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.listen.port(), 8080);
        assert!(settings.dispatch.log_matches);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: 0.0.0.0:9090
indexFile: /srv/mocks/index.yaml
project: shop
dispatch:
  logMatches: false
"#;
        let settings: ServerSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.listen.port(), 9090);
        assert_eq!(settings.project.as_deref(), Some("shop"));
        assert!(!settings.dispatch.log_matches);
        assert!(settings.dispatch.log_unmatched);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<ServerSettings, _> = serde_yaml::from_str("listen: 127.0.0.1:1\nport: 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_project_rejected() {
        let settings = ServerSettings {
            project: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("server.yaml");
        std::fs::write(&path, "indexFile: ''\n").unwrap();
        assert!(ServerSettings::from_file(&path).is_err());

        std::fs::write(&path, "indexFile: rules/index.yaml\n").unwrap();
        let settings = ServerSettings::from_file(&path).unwrap();
        assert_eq!(settings.index_file, PathBuf::from("rules/index.yaml"));
    }
}
