use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{PropertyState, IMAGER_AGENT, MOUNT_AGENT},
    error::ProtocolError,
};

pub const PROTOCOL_VERSION: u32 = 512;

pub const PREVIEW_SWITCH_GROUP: &str = "CCD_PREVIEW";
pub const PREVIEW_SWITCH_ITEM: &str = "ENABLED";
pub const PREVIEW_IMAGE_GROUP: &str = "CCD_PREVIEW_IMAGE";
pub const PREVIEW_IMAGE_ITEM: &str = "IMAGE";
pub const PARK_GROUP: &str = "MOUNT_PARK";
pub const PARK_ITEM: &str = "PARKED";
pub const COOLER_GROUP: &str = "CCD_COOLER";
pub const COOLER_OFF_ITEM: &str = "OFF";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchItem {
    pub name: String,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchVector {
    pub device: String,
    pub name: String,
    pub items: Vec<SwitchItem>,
}

/// Outbound documents. Serialized externally tagged, so each becomes
/// `{ "<tag>": { ... } }` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    #[serde(rename = "getProperties")]
    GetProperties { version: u32 },
    #[serde(rename = "newSwitchVector")]
    NewSwitchVector(SwitchVector),
}

impl ClientRequest {
    pub fn hello() -> Self {
        Self::GetProperties {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn switch(device: &str, name: &str, item: &str, value: bool) -> Self {
        Self::NewSwitchVector(SwitchVector {
            device: device.to_string(),
            name: name.to_string(),
            items: vec![SwitchItem {
                name: item.to_string(),
                value,
            }],
        })
    }

    pub fn enable_previews(device: &str) -> Self {
        Self::switch(device, PREVIEW_SWITCH_GROUP, PREVIEW_SWITCH_ITEM, true)
    }

    pub fn park_mount() -> Self {
        Self::switch(MOUNT_AGENT, PARK_GROUP, PARK_ITEM, true)
    }

    pub fn cooler_off() -> Self {
        Self::switch(IMAGER_AGENT, COOLER_GROUP, COOLER_OFF_ITEM, true)
    }

    pub fn to_text(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Define,
    Set,
    Delete,
}

impl VectorOp {
    /// Only the first three characters of the top-level key are significant.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.get(..3)? {
            "def" => Some(Self::Define),
            "set" => Some(Self::Set),
            "del" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundItem {
    pub name: String,
    pub value: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundVector {
    pub op: VectorOp,
    pub tag: String,
    pub device: String,
    pub name: Option<String>,
    pub state: PropertyState,
    pub items: Vec<InboundItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    name: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    target: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawVector {
    device: Option<String>,
    name: Option<String>,
    state: Option<String>,
    #[serde(default)]
    items: Vec<RawItem>,
}

/// Splits one inbound document into its property vectors.
///
/// Top-level keys that are not `def*`, `set*` or `del*` are skipped. A recognised
/// key with a body of the wrong shape fails the whole message.
pub fn parse_server_message(text: &str) -> Result<Vec<InboundVector>, ProtocolError> {
    let document: Value = serde_json::from_str(text)?;
    let Value::Object(entries) = document else {
        return Err(ProtocolError::NotAnObject);
    };

    let mut vectors = Vec::new();
    for (tag, body) in entries {
        let Some(op) = VectorOp::from_tag(&tag) else {
            continue;
        };
        let raw: RawVector =
            serde_json::from_value(body).map_err(|err| ProtocolError::MalformedVector {
                kind: tag.clone(),
                reason: err.to_string(),
            })?;
        let device = raw.device.ok_or_else(|| ProtocolError::MalformedVector {
            kind: tag.clone(),
            reason: "missing device".to_string(),
        })?;
        if op != VectorOp::Delete && raw.name.is_none() {
            return Err(ProtocolError::MalformedVector {
                kind: tag,
                reason: "missing name".to_string(),
            });
        }

        vectors.push(InboundVector {
            op,
            tag,
            device,
            name: raw.name,
            state: PropertyState::parse(raw.state.as_deref()),
            items: raw
                .items
                .into_iter()
                .map(|item| InboundItem {
                    name: item.name,
                    value: scalar_to_string(&item.value),
                    target: item.target.as_ref().map(scalar_to_string),
                })
                .collect(),
        });
    }
    Ok(vectors)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
