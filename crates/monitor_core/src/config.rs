use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use discovery::AGENT_SERVICE_TYPE;
use serde::{Deserialize, Serialize};
use shared::domain::PropertyKey;
use tracing::warn;

use crate::{error::ConfigError, ingest::IngestSettings, transport::TransportSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub secure: bool,
}

impl ServerConfig {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub servers: Vec<ServerConfig>,
    pub service_type: String,
    pub hello_delay_ms: u64,
    pub preview_enable_delay_ms: u64,
    pub reconnect_debounce_ms: u64,
    /// How often the host re-checks discovery. 0 turns periodic rescans off.
    pub rescan_interval_ms: u64,
    pub auto_enable_previews: bool,
    /// Rendered `device | group | item` keys forwarded to the remote mirror.
    pub mirror_keys: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            service_type: AGENT_SERVICE_TYPE.into(),
            hello_delay_ms: 500,
            preview_enable_delay_ms: 1000,
            reconnect_debounce_ms: 500,
            rescan_interval_ms: 5000,
            auto_enable_previews: true,
            mirror_keys: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Configured server names in order, first occurrence wins.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            if !names.contains(&server.name) {
                names.push(server.name.clone());
            }
        }
        names
    }

    pub fn is_secure(&self, name: &str) -> bool {
        self.servers
            .iter()
            .find(|server| server.name == name)
            .is_some_and(|server| server.secure)
    }

    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }

    pub fn transport_settings(&self, name: &str) -> TransportSettings {
        TransportSettings {
            secure: self.is_secure(name),
            hello_delay: Duration::from_millis(self.hello_delay_ms),
            store_epoch: 0,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        let mirror_keys = self
            .mirror_keys
            .iter()
            .filter_map(|raw| match raw.parse::<PropertyKey>() {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!(key = %raw, error = %err, "config: ignoring unusable mirror key");
                    None
                }
            })
            .collect();
        IngestSettings {
            auto_enable_previews: self.auto_enable_previews,
            preview_enable_delay: Duration::from_millis(self.preview_enable_delay_ms),
            mirror_keys,
        }
    }
}

/// Defaults, then the TOML file at `path` (if it exists), then the process environment.
pub fn load_config(path: Option<&Path>) -> Result<MonitorConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_config_file(path)?.unwrap_or_default(),
        None => MonitorConfig::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Option<MonitorConfig>, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&raw)
        .map(Some)
        .map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// `MONITOR_SERVERS` is a comma list of names; a `wss://` prefix marks a secure server.
pub fn apply_env_overrides(config: &mut MonitorConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("MONITOR_SERVERS") {
        config.servers = v
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| match name.strip_prefix("wss://") {
                Some(name) => ServerConfig {
                    name: name.to_string(),
                    secure: true,
                },
                None => ServerConfig::plain(name),
            })
            .collect();
    }

    if let Some(v) = env("APP__SERVICE_TYPE") {
        config.service_type = v;
    }

    for (name, slot) in [
        ("APP__HELLO_DELAY_MS", &mut config.hello_delay_ms),
        ("APP__PREVIEW_ENABLE_DELAY_MS", &mut config.preview_enable_delay_ms),
        ("APP__RECONNECT_DEBOUNCE_MS", &mut config.reconnect_debounce_ms),
        ("APP__RESCAN_INTERVAL_MS", &mut config.rescan_interval_ms),
    ] {
        if let Some(v) = env(name) {
            match v.trim().parse::<u64>() {
                Ok(parsed) => *slot = parsed,
                Err(_) => warn!(var = name, value = %v, "config: ignoring non-numeric override"),
            }
        }
    }

    if let Some(v) = env("APP__AUTO_ENABLE_PREVIEWS") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => config.auto_enable_previews = true,
            "0" | "false" | "no" | "off" => config.auto_enable_previews = false,
            _ => warn!(value = %v, "config: ignoring non-boolean APP__AUTO_ENABLE_PREVIEWS"),
        }
    }
}

/// Where the orchestrator persists configuration changes.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<MonitorConfig, ConfigError>;
    fn save(&self, config: &MonitorConfig) -> Result<(), ConfigError>;
}

pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<MonitorConfig, ConfigError> {
        Ok(read_config_file(&self.path)?.unwrap_or_default())
    }

    fn save(&self, config: &MonitorConfig) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(config)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, raw).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Default)]
pub struct MemoryConfigStore {
    saved: Mutex<Option<MonitorConfig>>,
}

impl MemoryConfigStore {
    pub fn saved(&self) -> Option<MonitorConfig> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<MonitorConfig, ConfigError> {
        Ok(self.saved().unwrap_or_default())
    }

    fn save(&self, config: &MonitorConfig) -> Result<(), ConfigError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
