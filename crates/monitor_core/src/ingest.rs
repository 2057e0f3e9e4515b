use std::{
    collections::HashSet,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use shared::{
    domain::{is_tracked_device, PropertyKey, PropertyRecord, PropertyState, GUIDER_AGENT, IMAGER_AGENT},
    error::ProtocolError,
    protocol::{
        parse_server_message, ClientRequest, InboundVector, VectorOp, PREVIEW_IMAGE_GROUP,
        PREVIEW_IMAGE_ITEM, PREVIEW_SWITCH_GROUP, PREVIEW_SWITCH_ITEM,
    },
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    remote::MirrorQueue,
    store::PropertyStore,
    transport::{MessageHandler, SessionLink},
    MonitorEvent,
};

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub auto_enable_previews: bool,
    pub preview_enable_delay: Duration,
    pub mirror_keys: HashSet<PropertyKey>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            auto_enable_previews: true,
            preview_enable_delay: Duration::from_secs(1),
            mirror_keys: HashSet::new(),
        }
    }
}

/// Latest preview image URL per agent, for whoever draws them.
#[derive(Clone)]
pub struct PreviewSlots {
    imager: watch::Sender<Option<String>>,
    guider: watch::Sender<Option<String>>,
}

impl Default for PreviewSlots {
    fn default() -> Self {
        Self {
            imager: watch::channel(None).0,
            guider: watch::channel(None).0,
        }
    }
}

impl PreviewSlots {
    pub fn imager(&self) -> watch::Receiver<Option<String>> {
        self.imager.subscribe()
    }

    pub fn guider(&self) -> watch::Receiver<Option<String>> {
        self.guider.subscribe()
    }

    fn slot(&self, device: &str) -> Option<&watch::Sender<Option<String>>> {
        match device {
            IMAGER_AGENT => Some(&self.imager),
            GUIDER_AGENT => Some(&self.guider),
            _ => None,
        }
    }

    fn publish(&self, device: &str, url: String) -> bool {
        match self.slot(device) {
            Some(slot) => {
                slot.send_replace(Some(url));
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.imager.send_replace(None);
        self.guider.send_replace(None);
    }
}

/// Turns inbound protocol documents into store mutations and follow-up commands.
pub struct ProtocolIngester {
    store: PropertyStore,
    previews: PreviewSlots,
    mirror: MirrorQueue,
    events: broadcast::Sender<MonitorEvent>,
    settings: RwLock<IngestSettings>,
}

impl ProtocolIngester {
    pub fn new(
        store: PropertyStore,
        previews: PreviewSlots,
        mirror: MirrorQueue,
        events: broadcast::Sender<MonitorEvent>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            previews,
            mirror,
            events,
            settings: RwLock::new(settings),
        }
    }

    pub fn update_settings(&self, settings: IngestSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn settings(&self) -> IngestSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies one whole inbound message. Returns how many vectors were applied.
    pub fn ingest(&self, text: &str, link: &SessionLink) -> Result<usize, ProtocolError> {
        let vectors = parse_server_message(text)?;
        if link.epoch() != self.store.epoch() {
            trace!(server = %link.server(), session = link.session(), "ingest: session predates the last store clear");
            return Ok(0);
        }
        let settings = self.settings();
        let mut applied = 0;
        for vector in vectors {
            if !is_tracked_device(&vector.device) {
                trace!(device = %vector.device, "ingest: ignoring untracked device");
                continue;
            }
            match vector.op {
                VectorOp::Define | VectorOp::Set => self.apply_update(&vector, link, &settings),
                VectorOp::Delete => self.apply_delete(&vector, link),
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_update(&self, vector: &InboundVector, link: &SessionLink, settings: &IngestSettings) {
        let Some(group) = vector.name.as_deref() else {
            return;
        };
        for item in &vector.items {
            let key = match PropertyKey::new(&vector.device, group, &item.name) {
                Ok(key) => key,
                Err(err) => {
                    warn!(server = %link.server(), error = %err, "ingest: skipping item with unusable key");
                    continue;
                }
            };
            let record = PropertyRecord::new(item.value.clone(), vector.state, item.target.clone());

            if settings.mirror_keys.contains(&key) {
                self.mirror.enqueue(key.clone(), record.clone());
            }

            if vector.op == VectorOp::Define
                && settings.auto_enable_previews
                && is_preview_switch(&key)
                && !record.is_on()
            {
                schedule_enable_previews(link, &vector.device, settings.preview_enable_delay);
            }

            if is_preview_image(&key) && record.state == PropertyState::Ok && !record.value.is_empty() {
                let url = preview_url(link.image_base(), &record.value);
                if self.previews.publish(&vector.device, url.clone()) {
                    debug!(server = %link.server(), device = %vector.device, url = %url, "ingest: preview image");
                    let _ = self.events.send(MonitorEvent::PreviewImage {
                        device: vector.device.clone(),
                        url,
                    });
                }
            }

            self.store.writer(link.epoch()).set_record(key, record);
        }
    }

    fn apply_delete(&self, vector: &InboundVector, link: &SessionLink) {
        let store = self.store.writer(link.epoch());
        match vector.name.as_deref() {
            None => store.delete_device(vector.device.clone()),
            Some(group) if vector.items.is_empty() => store.delete_vector(vector.device.clone(), group),
            Some(group) => {
                for item in &vector.items {
                    if let Ok(key) = PropertyKey::new(&vector.device, group, &item.name) {
                        store.delete(key);
                    }
                }
            }
        }
    }
}

impl MessageHandler for ProtocolIngester {
    fn handle(&self, text: &str, link: &SessionLink) {
        if let Err(err) = self.ingest(text, link) {
            warn!(server = %link.server(), error = %err, "ingest: discarding malformed message");
        }
    }
}

fn is_preview_switch(key: &PropertyKey) -> bool {
    matches!(key.device(), IMAGER_AGENT | GUIDER_AGENT)
        && key.group() == PREVIEW_SWITCH_GROUP
        && key.item() == PREVIEW_SWITCH_ITEM
}

fn is_preview_image(key: &PropertyKey) -> bool {
    key.group() == PREVIEW_IMAGE_GROUP && key.item() == PREVIEW_IMAGE_ITEM
}

fn schedule_enable_previews(link: &SessionLink, device: &str, delay: Duration) {
    let link = link.clone();
    let request = ClientRequest::enable_previews(device);
    debug!(server = %link.server(), device, "ingest: scheduling preview enable");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        link.send(&request);
    });
}

/// Absolute, cache-busting URL for a preview path reported by an agent.
pub fn preview_url(image_base: &str, path: &str) -> String {
    let separator = if path.starts_with('/') { "" } else { "/" };
    let query = if path.contains('?') { '&' } else { '?' };
    format!("{image_base}{separator}{path}{query}{}", Uuid::new_v4().simple())
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
