// pf.yaml: alias table, parallelism, package manager and SSH settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::inventory::{AliasValue, EnvAliases, LOCAL_ENTRY};
use crate::modules::PackageManagerSetting;
use crate::output::errors::PfError;

/// File looked up next to the Pfyfile when no explicit config is given
pub const CONFIG_FILE_NAME: &str = "pf.yaml";

/// Hard ceiling on concurrently running targets
pub const MAX_PARALLEL: usize = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PfConfig {
    pub environments: EnvAliases,
    pub max_parallel: usize,
    pub package_manager: PackageManagerSetting,
    /// Per-step timeout in seconds; none by default
    pub step_timeout: Option<u64>,
    pub ssh: SshSettings,
}

impl Default for PfConfig {
    fn default() -> Self {
        PfConfig {
            environments: EnvAliases::default(),
            max_parallel: MAX_PARALLEL,
            package_manager: PackageManagerSetting::default(),
            step_timeout: None,
            ssh: SshSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub private_key: Option<String>,
    pub password: Option<String>,
    /// Seconds
    pub connect_timeout: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            private_key: None,
            password: None,
            connect_timeout: 30,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    /// Private key path with a leading `~/` expanded
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.private_key.as_deref().map(expand_home)
    }
}

impl PfConfig {
    /// Parse a YAML document
    pub fn from_yaml(source: &str, path: Option<&Path>) -> Result<Self, PfError> {
        let mut config: PfConfig = if source.trim().is_empty() {
            PfConfig::default()
        } else {
            serde_yaml::from_str(source).map_err(|e| PfError::Config {
                message: format!("Invalid configuration: {}", e),
                path: path.map(Path::to_path_buf),
            })?
        };

        if config.environments.get("local").is_none() {
            config.environments = config
                .environments
                .with_alias("local", AliasValue::List(vec![LOCAL_ENTRY.to_string()]));
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PfError> {
        let source = std::fs::read_to_string(path).map_err(|e| PfError::Config {
            message: format!("Failed to read configuration: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        debug!(path = %path.display(), "loading configuration");
        PfConfig::from_yaml(&source, Some(path))
    }

    /// Load `explicit` if given (it must exist), else `pf.yaml` next to the
    /// Pfyfile if present, else defaults
    pub fn discover(explicit: Option<&Path>, pfyfile: &Path) -> Result<Self, PfError> {
        if let Some(path) = explicit {
            return PfConfig::load(path);
        }

        let candidate = pfyfile
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(CONFIG_FILE_NAME);

        if candidate.is_file() {
            PfConfig::load(&candidate)
        } else {
            debug!("no {} found, using defaults", CONFIG_FILE_NAME);
            Ok(PfConfig::default())
        }
    }

    /// `max_parallel` clamped to 1..=32
    pub fn parallelism(&self) -> usize {
        self.max_parallel.clamp(1, MAX_PARALLEL)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|_| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
