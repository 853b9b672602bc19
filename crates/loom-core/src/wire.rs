//! Loom wire format — the frames exchanged with a worker over stdin/stdout.
//!
//! One JSON object per line, UTF-8, discriminated by `type`. Every request
//! except `handshake` carries a caller-assigned correlation `id`, and the
//! worker echoes it on the matching `result` or `error`. Responses may arrive
//! in any order; matching is by id only.
//!
//! Changing a variant or field name here is a breaking change for every
//! worker runtime and user transform script in the wild.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Worker exit code for a line that is not valid JSON.
pub const EXIT_MALFORMED_INPUT: i32 = 1;

/// Worker exit code for a frame with an unrecognised `type`.
pub const EXIT_UNKNOWN_TYPE: i32 = 2;

/// Every `type` value the protocol defines. Anything else is fatal.
pub const MESSAGE_TYPES: &[&str] = &[
    "handshake",
    "transform",
    "load_model",
    "load",
    "process",
    "train",
    "save",
    "result",
    "error",
];

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Sent bare by the supervisor; the worker answers with its identity.
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Apply a user transform script to one object.
    Transform { id: String, object: Value },

    /// Load a serialized model state from a local path.
    LoadModel { id: String, path: String },

    /// Register one labelled example. The object id is the correlation id.
    Load {
        id: String,
        input: Value,
        #[serde(default)]
        output: Value,
    },

    /// Run the model over previously loaded objects, in this order.
    Process { id: String, ids: Vec<String> },

    /// Run one training iteration over previously loaded objects.
    Train {
        id: String,
        ids: Vec<String>,
        iteration: u64,
    },

    /// Persist the current model state to a local path.
    Save { id: String, path: String },

    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        value: Value,
    },

    /// With an id: that request failed, the connection stays usable.
    /// Without an id: the worker is terminating.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

impl Message {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Transform { .. } => "transform",
            Message::LoadModel { .. } => "load_model",
            Message::Load { .. } => "load",
            Message::Process { .. } => "process",
            Message::Train { .. } => "train",
            Message::Save { .. } => "save",
            Message::Result { .. } => "result",
            Message::Error { .. } => "error",
        }
    }

    /// Correlation id, if the frame carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Handshake { .. } => None,
            Message::Transform { id, .. }
            | Message::LoadModel { id, .. }
            | Message::Load { id, .. }
            | Message::Process { id, .. }
            | Message::Train { id, .. }
            | Message::Save { id, .. } => Some(id),
            Message::Result { id, .. } | Message::Error { id, .. } => id.as_deref(),
        }
    }

    /// True for frames only the supervisor sends.
    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Message::Handshake { .. } | Message::Result { .. } | Message::Error { .. }
        )
    }

    pub fn handshake_request() -> Self {
        Message::Handshake {
            name: None,
            version: None,
        }
    }
}

/// Worker identity returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub name: String,
    pub version: String,
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// A request body before it is tagged with a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Transform { object: Value },
    LoadModel { path: String },
    Load { input: Value, output: Value },
    Process { ids: Vec<String> },
    Train { ids: Vec<String>, iteration: u64 },
    Save { path: String },
}

impl Request {
    pub fn into_message(self, id: String) -> Message {
        match self {
            Request::Transform { object } => Message::Transform { id, object },
            Request::LoadModel { path } => Message::LoadModel { id, path },
            Request::Load { input, output } => Message::Load { id, input, output },
            Request::Process { ids } => Message::Process { id, ids },
            Request::Train { ids, iteration } => Message::Train { id, ids, iteration },
            Request::Save { path } => Message::Save { id, path },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Transform { .. } => "transform",
            Request::LoadModel { .. } => "load_model",
            Request::Load { .. } => "load",
            Request::Process { .. } => "process",
            Request::Train { .. } => "train",
            Request::Save { .. } => "save",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_snake_case_type_tags() {
        let msg = Request::LoadModel {
            path: "/tmp/model.json".into(),
        }
        .into_message("r-1".into());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({"type": "load_model", "id": "r-1", "path": "/tmp/model.json"}));
        assert_eq!(msg.kind(), "load_model");
    }

    #[test]
    fn bare_handshake_has_no_identity_fields() {
        let v = serde_json::to_value(Message::handshake_request()).unwrap();
        assert_eq!(v, json!({"type": "handshake"}));
    }

    #[test]
    fn result_without_id_or_value_parses() {
        let msg: Message = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Result {
                id: None,
                value: Value::Null
            }
        );
        assert!(msg.id().is_none());
    }

    #[test]
    fn every_kind_is_listed() {
        let samples = [
            Message::handshake_request(),
            Request::Transform { object: json!(1) }.into_message("a".into()),
            Request::LoadModel { path: "p".into() }.into_message("b".into()),
            Request::Load {
                input: json!([1]),
                output: json!(0),
            }
            .into_message("c".into()),
            Request::Process { ids: vec![] }.into_message("d".into()),
            Request::Train {
                ids: vec![],
                iteration: 0,
            }
            .into_message("e".into()),
            Request::Save { path: "p".into() }.into_message("f".into()),
            Message::Result {
                id: None,
                value: Value::Null,
            },
            Message::Error {
                id: None,
                message: "x".into(),
            },
        ];
        for m in &samples {
            assert!(MESSAGE_TYPES.contains(&m.kind()), "{} missing", m.kind());
        }
        assert_eq!(samples.len(), MESSAGE_TYPES.len());
    }

    #[test]
    fn only_supervisor_frames_are_requests() {
        assert!(!Message::handshake_request().is_request());
        assert!(Request::Save { path: "p".into() }
            .into_message("x".into())
            .is_request());
        assert!(!Message::Error {
            id: Some("x".into()),
            message: "boom".into()
        }
        .is_request());
    }
}
