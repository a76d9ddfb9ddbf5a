//! Launcher configuration: TOML file, env overrides, defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::karl::KarlParameters;
use crate::karl::nginx::NginxParameters;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins over it.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxConfig {
    pub port: u16,
    pub config_file: PathBuf,
    pub route_prefix: String,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            port: 0,
            config_file: PathBuf::new(),
            route_prefix: "/live".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub url: String,
    pub external_url: String,
    pub svg_name: String,
    pub github_repo_url: String,
    pub service_timeout_seconds: u64,
    pub logging: LoggingConfig,
    pub nginx: Option<NginxConfig>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let defaults = KarlParameters::default();
        Self {
            port: defaults.port,
            data_dir: PathBuf::from("./karl-data"),
            url: defaults.url,
            external_url: defaults.external_url,
            svg_name: defaults.svg_name,
            github_repo_url: defaults.github_repo_url,
            service_timeout_seconds: defaults.service_timeout_interval.as_secs(),
            logging: LoggingConfig::default(),
            nginx: None,
        }
    }
}

impl LauncherConfig {
    /// Loads the config file when present, otherwise the defaults, then
    /// applies `KARL_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("KARL_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(dir) = std::env::var("KARL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(filter) = std::env::var("KARL_LOG") {
            self.logging.filter = Some(filter);
        }
    }

    pub fn karl_parameters(&self) -> KarlParameters {
        KarlParameters {
            port: self.port,
            url: self.url.clone(),
            external_url: self.external_url.clone(),
            svg_name: self.svg_name.clone(),
            github_repo_url: self.github_repo_url.clone(),
            service_timeout_interval: std::time::Duration::from_secs(
                self.service_timeout_seconds,
            ),
            nginx: self.nginx.as_ref().map(|nginx| NginxParameters {
                port: nginx.port,
                config_file: nginx.config_file.clone(),
                route_prefix: nginx.route_prefix.clone(),
            }),
            timeout_scan_floor: None,
        }
    }

    pub fn keepalive_log_path(&self) -> PathBuf {
        self.data_dir.join("keepalives.json")
    }

    pub fn store_log_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = LauncherConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap();
        assert_eq!(config.port, KarlParameters::default().port);
        assert!(config.nginx.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("karl.toml");
        std::fs::write(
            &path,
            "port = 9999\nservice_timeout_seconds = 5\n\n[nginx]\nport = 8123\nconfig_file = \"/tmp/live.conf\"\n",
        )
        .unwrap();
        let config = LauncherConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.service_timeout_seconds, 5);
        let params = config.karl_parameters();
        let nginx = config.nginx.expect("nginx section");
        assert_eq!(nginx.port, 8123);
        assert_eq!(nginx.route_prefix, "/live");

        assert_eq!(params.service_timeout_interval.as_secs(), 5);
        assert!(params.nginx.is_some());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("karl.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            LauncherConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
