use crate::{
    domain::{PropertyKey, PropertyRecord, PropertyState},
    error::{KeyError, ProtocolError},
    protocol::{parse_server_message, ClientRequest, VectorOp},
};

#[test]
fn property_key_renders_and_parses_canonical_form() {
    let key = PropertyKey::new("Imager Agent", "AGENT_IMAGER_STATS", "FRAME").expect("key");
    assert_eq!(key.to_string(), "Imager Agent | AGENT_IMAGER_STATS | FRAME");

    let parsed: PropertyKey = "Imager Agent | AGENT_IMAGER_STATS | FRAME"
        .parse()
        .expect("parse");
    assert_eq!(parsed, key);
}

#[test]
fn property_key_rejects_empty_and_ambiguous_components() {
    assert!(matches!(
        PropertyKey::new("", "GROUP", "ITEM"),
        Err(KeyError::EmptyComponent(_))
    ));
    assert!(matches!(
        PropertyKey::new("Mount Agent", "A | B", "ITEM"),
        Err(KeyError::SeparatorInComponent(_))
    ));
    assert!(matches!(
        "only | two".parse::<PropertyKey>(),
        Err(KeyError::Malformed(_))
    ));
}

#[test]
fn pipe_without_spaces_is_a_plain_character() {
    let key = PropertyKey::new("Mount Agent", "A|B", "ITEM").expect("key");
    let parsed: PropertyKey = key.to_string().parse().expect("parse");
    assert_eq!(parsed.group(), "A|B");
}

#[test]
fn hello_matches_wire_shape() {
    let value: serde_json::Value =
        serde_json::from_str(&ClientRequest::hello().to_text()).expect("json");
    assert_eq!(value, serde_json::json!({ "getProperties": { "version": 512 } }));
}

#[test]
fn park_command_matches_wire_shape() {
    let value: serde_json::Value =
        serde_json::from_str(&ClientRequest::park_mount().to_text()).expect("json");
    assert_eq!(
        value,
        serde_json::json!({
            "newSwitchVector": {
                "device": "Mount Agent",
                "name": "MOUNT_PARK",
                "items": [ { "name": "PARKED", "value": true } ]
            }
        })
    );
}

#[test]
fn parses_def_vector_with_mixed_item_values() {
    let text = r#"{
        "defNumberVector": {
            "device": "Mount Agent",
            "name": "AGENT_LIMITS",
            "state": "Busy",
            "perm": "rw",
            "items": [
                { "name": "HA_TRACKING", "value": 23.5, "target": 1.0 },
                { "name": "LABEL", "value": "east" },
                { "name": "FLAG", "value": true }
            ]
        }
    }"#;

    let vectors = parse_server_message(text).expect("parse");
    assert_eq!(vectors.len(), 1);
    let vector = &vectors[0];
    assert_eq!(vector.op, VectorOp::Define);
    assert_eq!(vector.device, "Mount Agent");
    assert_eq!(vector.name.as_deref(), Some("AGENT_LIMITS"));
    assert_eq!(vector.state, PropertyState::Busy);
    assert_eq!(vector.items[0].value, "23.5");
    assert_eq!(vector.items[0].target.as_deref(), Some("1.0"));
    assert_eq!(vector.items[1].value, "east");
    assert_eq!(vector.items[2].value, "true");
}

#[test]
fn only_tag_prefix_selects_operation() {
    assert_eq!(VectorOp::from_tag("setTextVector"), Some(VectorOp::Set));
    assert_eq!(VectorOp::from_tag("delProperty"), Some(VectorOp::Delete));
    assert_eq!(VectorOp::from_tag("defBLOBVector"), Some(VectorOp::Define));
    assert_eq!(VectorOp::from_tag("message"), None);
    assert_eq!(VectorOp::from_tag("de"), None);
}

#[test]
fn unknown_top_level_keys_are_ignored() {
    let vectors =
        parse_server_message(r#"{ "newFancyThing": { "device": "Server" } }"#).expect("parse");
    assert!(vectors.is_empty());
}

#[test]
fn delete_without_name_or_items_is_accepted() {
    let vectors = parse_server_message(r#"{ "deleteProperty": { "device": "Imager Agent" } }"#)
        .expect("parse");
    assert_eq!(vectors[0].op, VectorOp::Delete);
    assert!(vectors[0].name.is_none());
    assert!(vectors[0].items.is_empty());
}

#[test]
fn malformed_documents_are_reported() {
    assert!(matches!(
        parse_server_message("not json"),
        Err(ProtocolError::NotJson(_))
    ));
    assert!(matches!(
        parse_server_message("[1, 2]"),
        Err(ProtocolError::NotAnObject)
    ));
    assert!(matches!(
        parse_server_message(r#"{ "setNumberVector": { "name": "X" } }"#),
        Err(ProtocolError::MalformedVector { .. })
    ));
    assert!(matches!(
        parse_server_message(r#"{ "setNumberVector": { "device": "Server", "items": 5 } }"#),
        Err(ProtocolError::MalformedVector { .. })
    ));
}

#[test]
fn unknown_state_strings_map_to_unknown() {
    assert_eq!(PropertyState::parse(Some("Weird")), PropertyState::Unknown);
    assert_eq!(PropertyState::parse(None), PropertyState::Unknown);

    let record = PropertyRecord::new("12.5", PropertyState::Ok, Some("3".into()));
    assert_eq!(record.value_f64(), Some(12.5));
    assert_eq!(record.target_f64(), Some(3.0));
}
