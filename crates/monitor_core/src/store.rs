use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use shared::domain::{PropertyKey, PropertyRecord, PropertyState};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    records: HashMap<PropertyKey, PropertyRecord>,
    updated_at: Option<DateTime<Utc>>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PropertyKey) -> Option<&PropertyRecord> {
        self.records.get(key)
    }

    pub fn lookup(&self, device: &str, group: &str, item: &str) -> Option<&PropertyRecord> {
        let key = PropertyKey::new(device, group, item).ok()?;
        self.records.get(&key)
    }

    pub fn keys(&self) -> HashSet<PropertyKey> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn set(&mut self, key: PropertyKey, record: PropertyRecord) {
        self.records.insert(key, record);
        self.touch();
    }

    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        let removed = self.records.remove(key).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    pub fn delete_matching(&mut self, device: &str, group: Option<&str>) -> usize {
        let before = self.records.len();
        self.records.retain(|key, _| !key.belongs_to(device, group));
        let removed = before - self.records.len();
        if removed > 0 {
            self.touch();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

pub type StoreEpoch = u64;

enum StoreCommand {
    Set {
        epoch: StoreEpoch,
        key: PropertyKey,
        record: PropertyRecord,
    },
    Delete {
        epoch: StoreEpoch,
        key: PropertyKey,
    },
    DeleteMatching {
        epoch: StoreEpoch,
        device: String,
        group: Option<String>,
    },
    Clear {
        epoch: StoreEpoch,
    },
    Get {
        key: PropertyKey,
        reply: oneshot::Sender<Option<PropertyRecord>>,
    },
    Keys {
        reply: oneshot::Sender<HashSet<PropertyKey>>,
    },
    Snapshot {
        reply: oneshot::Sender<PropertyTable>,
    },
}

/// Writes tagged with an epoch older than the latest `clear` are dropped.
#[derive(Clone)]
pub struct PropertyStore {
    tx: mpsc::UnboundedSender<StoreCommand>,
    epoch: Arc<AtomicU64>,
}

impl PropertyStore {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_store_queue(rx));
        Self {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn epoch(&self) -> StoreEpoch {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn writer(&self, epoch: StoreEpoch) -> StoreWriter<'_> {
        StoreWriter { store: self, epoch }
    }

    pub fn set(
        &self,
        key: PropertyKey,
        value: impl Into<String>,
        state: PropertyState,
        target: Option<String>,
    ) {
        self.set_record(key, PropertyRecord::new(value, state, target));
    }

    pub fn set_record(&self, key: PropertyKey, record: PropertyRecord) {
        self.writer(self.epoch()).set_record(key, record);
    }

    pub fn delete(&self, key: PropertyKey) {
        self.writer(self.epoch()).delete(key);
    }

    pub fn delete_vector(&self, device: impl Into<String>, group: impl Into<String>) {
        self.writer(self.epoch()).delete_vector(device, group);
    }

    pub fn delete_device(&self, device: impl Into<String>) {
        self.writer(self.epoch()).delete_device(device);
    }

    pub fn clear(&self) -> StoreEpoch {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.submit(StoreCommand::Clear { epoch });
        epoch
    }

    pub async fn get(&self, key: &PropertyKey) -> Option<PropertyRecord> {
        let (reply, rx) = oneshot::channel();
        self.submit(StoreCommand::Get {
            key: key.clone(),
            reply,
        });
        rx.await.ok().flatten()
    }

    pub async fn keys(&self) -> HashSet<PropertyKey> {
        let (reply, rx) = oneshot::channel();
        self.submit(StoreCommand::Keys { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self) -> PropertyTable {
        let (reply, rx) = oneshot::channel();
        self.submit(StoreCommand::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    fn submit(&self, command: StoreCommand) {
        if self.tx.send(command).is_err() {
            debug!("store: queue stopped, dropping command");
        }
    }
}

pub struct StoreWriter<'a> {
    store: &'a PropertyStore,
    epoch: StoreEpoch,
}

impl StoreWriter<'_> {
    pub fn set_record(&self, key: PropertyKey, record: PropertyRecord) {
        self.store.submit(StoreCommand::Set {
            epoch: self.epoch,
            key,
            record,
        });
    }

    pub fn delete(&self, key: PropertyKey) {
        self.store.submit(StoreCommand::Delete {
            epoch: self.epoch,
            key,
        });
    }

    pub fn delete_vector(&self, device: impl Into<String>, group: impl Into<String>) {
        self.store.submit(StoreCommand::DeleteMatching {
            epoch: self.epoch,
            device: device.into(),
            group: Some(group.into()),
        });
    }

    pub fn delete_device(&self, device: impl Into<String>) {
        self.store.submit(StoreCommand::DeleteMatching {
            epoch: self.epoch,
            device: device.into(),
            group: None,
        });
    }
}

async fn run_store_queue(mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    let mut table = PropertyTable::new();
    let mut current: StoreEpoch = 0;
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Set { epoch, key, record } => {
                if epoch < current {
                    trace!(key = %key, epoch, current, "store: dropping write from earlier epoch");
                    continue;
                }
                trace!(key = %key, value = %record.value, "store: set");
                table.set(key, record);
            }
            StoreCommand::Delete { epoch, key } => {
                if epoch < current {
                    continue;
                }
                trace!(key = %key, "store: delete");
                table.delete(&key);
            }
            StoreCommand::DeleteMatching {
                epoch,
                device,
                group,
            } => {
                if epoch < current {
                    continue;
                }
                let removed = table.delete_matching(&device, group.as_deref());
                trace!(device = %device, group = ?group, removed, "store: delete matching");
            }
            StoreCommand::Clear { epoch } => {
                debug!(records = table.len(), epoch, "store: cleared");
                current = current.max(epoch);
                table.clear();
            }
            StoreCommand::Get { key, reply } => {
                let _ = reply.send(table.get(&key).cloned());
            }
            StoreCommand::Keys { reply } => {
                let _ = reply.send(table.keys());
            }
            StoreCommand::Snapshot { reply } => {
                let _ = reply.send(table.clone());
            }
        }
    }
    debug!("store: queue finished");
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
