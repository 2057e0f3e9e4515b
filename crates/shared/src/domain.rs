use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

pub const IMAGER_AGENT: &str = "Imager Agent";
pub const GUIDER_AGENT: &str = "Guider Agent";
pub const MOUNT_AGENT: &str = "Mount Agent";
pub const SERVER_DEVICE: &str = "Server";

/// Devices whose properties are tracked. Everything else is dropped on ingest.
pub const TRACKED_DEVICES: [&str; 4] = [IMAGER_AGENT, GUIDER_AGENT, MOUNT_AGENT, SERVER_DEVICE];

pub fn is_tracked_device(device: &str) -> bool {
    TRACKED_DEVICES.contains(&device)
}

/// Separator used by the rendered `"device | group | item"` form.
pub const KEY_SEPARATOR: &str = " | ";

/// Identity of one property item.
///
/// Equality and hashing are structural over the three components. The rendered
/// form is only used for display, logs and config files; components are rejected
/// if they would make that form ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey {
    device: String,
    group: String,
    item: String,
}

impl PropertyKey {
    pub fn new(
        device: impl Into<String>,
        group: impl Into<String>,
        item: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let key = Self {
            device: device.into(),
            group: group.into(),
            item: item.into(),
        };
        for component in [&key.device, &key.group, &key.item] {
            if component.trim().is_empty() {
                return Err(KeyError::EmptyComponent(key.to_string()));
            }
            if component.contains(KEY_SEPARATOR) {
                return Err(KeyError::SeparatorInComponent(component.clone()));
            }
        }
        Ok(key)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn belongs_to(&self, device: &str, group: Option<&str>) -> bool {
        self.device == device && group.map_or(true, |group| self.group == group)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.device, self.group, self.item
        )
    }
}

impl FromStr for PropertyKey {
    type Err = KeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split(KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(group), Some(item), None) => Self::new(device, group, item),
            _ => Err(KeyError::Malformed(raw.to_string())),
        }
    }
}

impl Serialize for PropertyKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PropertyKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropertyState {
    Ok,
    Busy,
    Alert,
    Idle,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PropertyState {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("Ok") => Self::Ok,
            Some("Busy") => Self::Busy,
            Some("Alert") => Self::Alert,
            Some("Idle") => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// One item's last known state. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub value: String,
    pub state: PropertyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl PropertyRecord {
    pub fn new(value: impl Into<String>, state: PropertyState, target: Option<String>) -> Self {
        Self {
            value: value.into(),
            state,
            target,
        }
    }

    pub fn value_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    pub fn target_f64(&self) -> Option<f64> {
        self.target.as_deref().and_then(|t| t.trim().parse().ok())
    }

    pub fn is_on(&self) -> bool {
        self.value.eq_ignore_ascii_case("true")
    }
}
