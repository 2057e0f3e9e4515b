pub mod config;
pub mod error;
pub mod ingest;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod store;
pub mod transport;

pub use config::{load_config, ConfigStore, MemoryConfigStore, MonitorConfig, ServerConfig, TomlConfigStore};
pub use orchestrator::{Collaborators, ConnectionOrchestrator, OrchestratorStatus};
pub use progress::{compute_progress, SequenceProgress, SequenceStatus};
pub use store::{PropertyStore, PropertyTable, StoreEpoch, StoreWriter};

/// Notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ServerReady {
        server: String,
    },
    ServerLost {
        server: String,
        expected: bool,
        reason: String,
    },
    StoreReinitialised {
        servers: Vec<String>,
    },
    PreviewImage {
        device: String,
        url: String,
    },
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
