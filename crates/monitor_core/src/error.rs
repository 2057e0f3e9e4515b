use std::path::PathBuf;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("probe connection to {endpoint} failed: {source}")]
    Probe {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe connection to {0} reported no usable remote address")]
    Unresolved(String),
    #[error("invalid session url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("session upgrade to {url} failed: {source}")]
    Upgrade {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("receive failed: {0}")]
    Receive(#[source] Box<tungstenite::Error>),
    #[error("send failed: {0}")]
    Send(#[source] Box<tungstenite::Error>),
}

impl TransportError {
    /// True for failures raised before any session object existed.
    pub fn is_pre_session(&self) -> bool {
        matches!(self, Self::Probe { .. } | Self::Unresolved(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is no longer running")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
