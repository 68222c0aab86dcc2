//! `hatch.toml` configuration.
//!
//! Every field is optional. A missing file means all defaults: local state
//! in `hatch-state.json`, the in-process remote store, and one application
//! per known client with its default collection.
//!
//! # Example
//!
//! ```toml
//! storage_path = "/var/lib/hatch/state.json"
//!
//! [remote]
//! url = "https://remote-settings.example.com/v1"
//! auth = "publisher:s3cret"
//! timeout_secs = 30
//!
//! [server]
//! port = 8080
//!
//! [scheduler]
//! publish_interval_secs = 300
//! liveness_interval_secs = 120
//! jitter_secs = 10
//!
//! [[applications]]
//! application = "desktop"
//! collection = "nimbus-desktop-experiments"
//!
//! [[applications]]
//! application = "fenix"
//! collection = "nimbus-mobile-experiments"
//! review_required = false
//! ```
//!
//! Environment overrides: `HATCH_REMOTE_URL`, `HATCH_REMOTE_AUTH`
//! (`user:password`), `HATCH_REMOTE_TOKEN` (bearer) and `HATCH_PORT`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hatch_core::Application;
use hatch_engine::remote::KintoAuth;
use hatch_engine::{ApplicationConfig, RemoteError, SchedulerConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "hatch.toml";
pub const DEFAULT_STORAGE_PATH: &str = "hatch-state.json";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("scheduler.{0} must be at least 1 second")]
    ZeroInterval(&'static str),

    #[error("application {0} is configured twice")]
    DuplicateApplication(Application),

    #[error("invalid remote credentials: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HatchConfig {
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

/// `[remote]`: where records are published. No URL means the in-process store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    pub url: Option<String>,
    /// Basic credential, `user:password`.
    pub auth: Option<String>,
    /// Bearer token; takes precedence over `auth`.
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    pub publish_interval_secs: Option<u64>,
    pub liveness_interval_secs: Option<u64>,
    pub jitter_secs: Option<u64>,
}

impl HatchConfig {
    /// Load `path` and apply environment overrides. An explicitly given
    /// path must exist; the default path may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.check()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override file values with whatever `lookup` finds set.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());
        if let Some(url) = get("HATCH_REMOTE_URL") {
            self.remote.url = Some(url);
        }
        if let Some(auth) = get("HATCH_REMOTE_AUTH") {
            self.remote.auth = Some(auth);
        }
        if let Some(token) = get("HATCH_REMOTE_TOKEN") {
            self.remote.token = Some(token);
        }
        if let Some(port) = get("HATCH_PORT") {
            let port = port.parse().map_err(|e| ConfigError::Env {
                var: "HATCH_PORT",
                message: format!("'{port}': {e}"),
            })?;
            self.server.port = Some(port);
        }
        Ok(())
    }

    fn check(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("publish_interval_secs", self.scheduler.publish_interval_secs),
            ("liveness_interval_secs", self.scheduler.liveness_interval_secs),
        ];
        if let Some((field, _)) = intervals.iter().find(|(_, secs)| *secs == Some(0)) {
            return Err(ConfigError::ZeroInterval(*field));
        }

        let mut seen = Vec::new();
        for app in &self.applications {
            if seen.contains(&app.application) {
                return Err(ConfigError::DuplicateApplication(app.application));
            }
            seen.push(app.application);
        }
        self.remote_auth()?;
        Ok(())
    }

    pub fn storage_path(&self) -> &Path {
        self.storage_path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_STORAGE_PATH))
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS))
    }

    pub fn remote_auth(&self) -> Result<KintoAuth, ConfigError> {
        match (&self.remote.token, &self.remote.auth) {
            (Some(token), _) => Ok(KintoAuth::Bearer(token.clone())),
            (None, Some(credential)) => Ok(KintoAuth::basic(credential)?),
            (None, None) => Ok(KintoAuth::Anonymous),
        }
    }

    /// Configured applications, or every known application with defaults.
    pub fn applications(&self) -> Vec<ApplicationConfig> {
        if self.applications.is_empty() {
            Application::ALL
                .iter()
                .map(|app| ApplicationConfig::new(*app))
                .collect()
        } else {
            self.applications.clone()
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        SchedulerConfig {
            publish_interval: secs(self.scheduler.publish_interval_secs, defaults.publish_interval),
            liveness_interval: secs(
                self.scheduler.liveness_interval_secs,
                defaults.liveness_interval,
            ),
            jitter: secs(self.scheduler.jitter_secs, defaults.jitter),
        }
    }
}
