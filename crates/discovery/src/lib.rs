//! Name to endpoint lookup over the currently advertised agent services.
//!
//! Browsing the local network is somebody else's job; the monitor only asks
//! "where is server X right now?" through [`ServiceResolver`].

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Service type agents advertise themselves under.
pub const AGENT_SERVICE_TYPE: &str = "_indigo._tcp";

/// Where an advertised service can be reached. `host` may be symbolic
/// (e.g. `observatory.local`); the transport resolves it during its probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("endpoint {0:?} is missing a port")]
    MissingPort(String),
    #[error("endpoint {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("endpoint {0:?} has an empty host")]
    EmptyHost(String),
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(raw.to_string()))?;
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(raw.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(raw.to_string()))?;
        Ok(Self::new(host, port))
    }
}

pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Endpoint>;
}

/// Resolver that never finds anything.
pub struct MissingResolver;

impl ServiceResolver for MissingResolver {
    fn resolve(&self, _name: &str) -> Option<Endpoint> {
        None
    }
}

/// In-memory advertised set, fed by whatever browses the network (or by hand).
#[derive(Default)]
pub struct StaticResolver {
    services: RwLock<HashMap<String, Endpoint>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = (String, Endpoint)>) -> Self {
        Self {
            services: RwLock::new(services.into_iter().collect()),
        }
    }

    pub fn advertise(&self, name: impl Into<String>, endpoint: Endpoint) {
        let name = name.into();
        debug!(server = %name, endpoint = %endpoint, "discovery: service advertised");
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, endpoint);
    }

    pub fn withdraw(&self, name: &str) -> Option<Endpoint> {
        debug!(server = %name, "discovery: service withdrawn");
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
