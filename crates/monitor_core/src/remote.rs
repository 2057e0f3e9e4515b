use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{PropertyKey, PropertyRecord};
use tokio::sync::mpsc;
use tracing::warn;

/// Commands issued further than this many seconds from now are discarded.
pub const REMOTE_COMMAND_MAX_AGE_SECS: i64 = 120;

#[async_trait]
pub trait RemoteMirror: Send + Sync {
    async fn publish(&self, key: &PropertyKey, record: &PropertyRecord) -> Result<()>;
}

pub struct NoRemoteMirror;

#[async_trait]
impl RemoteMirror for NoRemoteMirror {
    async fn publish(&self, _key: &PropertyKey, _record: &PropertyRecord) -> Result<()> {
        Ok(())
    }
}

/// Publishes mirrored records one at a time, in ingestion order.
#[derive(Clone)]
pub struct MirrorQueue {
    tx: mpsc::UnboundedSender<(PropertyKey, PropertyRecord)>,
}

impl MirrorQueue {
    pub fn spawn(mirror: Arc<dyn RemoteMirror>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(PropertyKey, PropertyRecord)>();
        tokio::spawn(async move {
            while let Some((key, record)) = rx.recv().await {
                if let Err(err) = mirror.publish(&key, &record).await {
                    warn!(key = %key, error = %err, "remote: mirror publish failed");
                }
            }
        });
        Self { tx }
    }

    pub fn enqueue(&self, key: PropertyKey, record: PropertyRecord) {
        let _ = self.tx.send((key, record));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommandKind {
    EmergencyStop,
    EnablePreviews,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub kind: RemoteCommandKind,
    pub issued_at: DateTime<Utc>,
}

impl RemoteCommand {
    pub fn new(kind: RemoteCommandKind, issued_at: DateTime<Utc>) -> Self {
        Self { kind, issued_at }
    }

    /// Issued within the cutoff on either side of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.issued_at);
        let cutoff = Duration::seconds(REMOTE_COMMAND_MAX_AGE_SECS);
        age <= cutoff && age >= -cutoff
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
