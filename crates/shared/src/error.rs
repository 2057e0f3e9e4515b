use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("property key has an empty component: {0:?}")]
    EmptyComponent(String),
    #[error("property key component contains the key separator: {0:?}")]
    SeparatorInComponent(String),
    #[error("malformed property key: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("inbound message is not JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("inbound message is not a JSON object")]
    NotAnObject,
    #[error("malformed {kind} vector: {reason}")]
    MalformedVector { kind: String, reason: String },
}
