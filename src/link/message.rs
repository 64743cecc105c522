//! Link message model and flat key-value codec
//!
//! Every message crossing the link is a flat map of primitive values. Three
//! reserved keys carry the envelope:
//!
//! - `_type`: `request`, `reply` or `event`
//! - `_kind`: message kind (`schedule`, `metrics`, ...)
//! - `_id`: correlation id, present on requests and replies only
//!
//! All other keys are message parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;

pub const KEY_TYPE: &str = "_type";
pub const KEY_KIND: &str = "_kind";
pub const KEY_ID: &str = "_id";

const RESERVED_KEYS: [&str; 3] = [KEY_TYPE, KEY_KIND, KEY_ID];

/// Primitive payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for Primitive {
    fn from(v: bool) -> Self {
        Primitive::Bool(v)
    }
}

impl From<f64> for Primitive {
    fn from(v: f64) -> Self {
        Primitive::Number(v)
    }
}

impl From<u32> for Primitive {
    fn from(v: u32) -> Self {
        Primitive::Number(v as f64)
    }
}

impl From<&str> for Primitive {
    fn from(v: &str) -> Self {
        Primitive::Text(v.to_string())
    }
}

impl From<String> for Primitive {
    fn from(v: String) -> Self {
        Primitive::Text(v)
    }
}

impl Primitive {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Primitive::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Message parameters: string keys to primitive values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Primitive>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Primitive>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Primitive>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Primitive::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Primitive::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Primitive::as_bool)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, LinkError> {
        self.get_str(key)
            .ok_or_else(|| LinkError::Serialization(format!("missing text field '{}'", key)))
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, LinkError> {
        self.get_f64(key)
            .ok_or_else(|| LinkError::Serialization(format!("missing number field '{}'", key)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Primitive)> {
        self.0.iter()
    }
}

/// Wire form of a link message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(BTreeMap<String, Primitive>);

impl Frame {
    pub fn to_json(&self) -> Result<String, LinkError> {
        serde_json::to_string(&self.0).map_err(|e| LinkError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        serde_json::from_str(json)
            .map(Frame)
            .map_err(|e| LinkError::Serialization(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.0.get(key)
    }
}

/// Message exchanged over the link. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Request {
        id: Uuid,
        kind: String,
        params: Params,
    },
    Reply {
        id: Uuid,
        kind: String,
        payload: Params,
    },
    Event {
        kind: String,
        params: Params,
    },
}

impl LinkMessage {
    /// New request with a fresh correlation id
    pub fn request(kind: impl Into<String>, params: Params) -> Self {
        LinkMessage::Request {
            id: Uuid::new_v4(),
            kind: kind.into(),
            params,
        }
    }

    pub fn reply(id: Uuid, kind: impl Into<String>, payload: Params) -> Self {
        LinkMessage::Reply {
            id,
            kind: kind.into(),
            payload,
        }
    }

    pub fn event(kind: impl Into<String>, params: Params) -> Self {
        LinkMessage::Event {
            kind: kind.into(),
            params,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            LinkMessage::Request { kind, .. }
            | LinkMessage::Reply { kind, .. }
            | LinkMessage::Event { kind, .. } => kind,
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            LinkMessage::Request { .. } => "request",
            LinkMessage::Reply { .. } => "reply",
            LinkMessage::Event { .. } => "event",
        }
    }

    /// Flatten into the wire map. Params named like a reserved key are dropped.
    pub fn to_frame(&self) -> Frame {
        let (id, body) = match self {
            LinkMessage::Request { id, params, .. } => (Some(id), params),
            LinkMessage::Reply { id, payload, .. } => (Some(id), payload),
            LinkMessage::Event { params, .. } => (None, params),
        };

        let mut map: BTreeMap<String, Primitive> = body
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        map.insert(KEY_TYPE.to_string(), self.type_tag().into());
        map.insert(KEY_KIND.to_string(), self.kind().into());
        if let Some(id) = id {
            map.insert(KEY_ID.to_string(), id.to_string().into());
        }
        Frame(map)
    }

    /// Rebuild a message from the wire map
    pub fn from_frame(frame: Frame) -> Result<Self, LinkError> {
        let mut map = frame.0;

        let type_tag = take_text(&mut map, KEY_TYPE)?;
        let kind = take_text(&mut map, KEY_KIND)?;
        let id = match map.remove(KEY_ID) {
            Some(Primitive::Text(raw)) => Some(
                Uuid::parse_str(&raw)
                    .map_err(|e| LinkError::Serialization(format!("invalid _id: {}", e)))?,
            ),
            Some(_) => return Err(LinkError::Serialization("_id must be text".to_string())),
            None => None,
        };
        let params = Params(map);

        match (type_tag.as_str(), id) {
            ("request", Some(id)) => Ok(LinkMessage::Request { id, kind, params }),
            ("reply", Some(id)) => Ok(LinkMessage::Reply {
                id,
                kind,
                payload: params,
            }),
            ("event", _) => Ok(LinkMessage::Event { kind, params }),
            ("request", None) | ("reply", None) => Err(LinkError::Serialization(format!(
                "{} without correlation id",
                type_tag
            ))),
            (other, _) => Err(LinkError::Serialization(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}

fn take_text(map: &mut BTreeMap<String, Primitive>, key: &str) -> Result<String, LinkError> {
    match map.remove(key) {
        Some(Primitive::Text(value)) => Ok(value),
        Some(_) => Err(LinkError::Serialization(format!("{} must be text", key))),
        None => Err(LinkError::Serialization(format!("missing {}", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_is_flat() {
        let message = LinkMessage::event(
            "metrics",
            Params::new().with("heartRate", 142.0).with("activity", "running"),
        );
        let frame = message.to_frame();

        assert_eq!(frame.get(KEY_TYPE), Some(&Primitive::from("event")));
        assert_eq!(frame.get(KEY_KIND), Some(&Primitive::from("metrics")));
        assert_eq!(frame.get("heartRate"), Some(&Primitive::Number(142.0)));
        assert!(frame.get(KEY_ID).is_none());

        assert_eq!(LinkMessage::from_frame(frame).unwrap(), message);
    }

    #[test]
    fn test_request_keeps_correlation_id_through_json() {
        let message = LinkMessage::request("schedule", Params::new());
        let json = message.to_frame().to_json().unwrap();
        let decoded = LinkMessage::from_frame(Frame::from_json(&json).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_reserved_param_names_are_not_smuggled() {
        let message = LinkMessage::event("ended", Params::new().with(KEY_TYPE, "reply"));
        let decoded = LinkMessage::from_frame(message.to_frame()).unwrap();
        assert_eq!(decoded, LinkMessage::event("ended", Params::new()));
    }

    #[test]
    fn test_reply_without_id_is_rejected() {
        let frame = Frame::from_json(r#"{"_type":"reply","_kind":"schedule"}"#).unwrap();
        assert!(matches!(
            LinkMessage::from_frame(frame),
            Err(LinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_nested_values_are_not_primitives() {
        assert!(Frame::from_json(r#"{"_type":"event","_kind":"x","nested":{"a":1}}"#).is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let frame = Frame::from_json(r#"{"_type":"broadcast","_kind":"metrics"}"#).unwrap();
        assert!(LinkMessage::from_frame(frame).is_err());
    }
}
