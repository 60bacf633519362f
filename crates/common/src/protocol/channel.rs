// Per-document channel messages exchanged between editors and the relay.

use serde::{Deserialize, Serialize};

use crate::types::Revision;

/// Every envelope on a document topic. Binary CRDT payloads travel as
/// standard base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Server -> Client: full CRDT state on subscribe.
    Sync { state: String },

    /// Client -> Server: an incremental edit. Server -> Client (broadcast):
    /// the same edit fanned out; editors drop updates carrying their own
    /// sender id.
    Update { update: String, sender: String },

    /// Bidirectional: ephemeral presence data, relayed verbatim and never stored.
    Awareness { update: serde_json::Value, sender: String },

    /// Client -> Server: persist now. With a base revision the save fails
    /// instead of overwriting when the durable copy moved on.
    Save {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_revision: Option<Revision>,
    },

    /// Server -> Client: the requested save has completed.
    Saved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<Revision>,
    },

    /// Server -> Client (broadcast): the durable copy changed underneath;
    /// refetch.
    FileChanged,

    /// Server -> Client: a request could not be served.
    Error { code: String, message: String, retryable: bool },
}

impl ChannelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
            Self::Save { .. } => "save",
            Self::Saved { .. } => "saved",
            Self::FileChanged => "file_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn to_value(message: &ChannelMessage) -> Value {
        serde_json::to_value(message).expect("channel message should serialize")
    }

    #[test]
    fn envelopes_are_tagged_with_snake_case_type() {
        let cases = [
            (ChannelMessage::Sync { state: "AA==".into() }, "sync"),
            (ChannelMessage::Update { update: "AQ==".into(), sender: "a".into() }, "update"),
            (ChannelMessage::Awareness { update: json!({"cursor": 3}), sender: "a".into() }, "awareness"),
            (ChannelMessage::Save { base_revision: None }, "save"),
            (ChannelMessage::Saved { revision: None }, "saved"),
            (ChannelMessage::FileChanged, "file_changed"),
        ];

        for (message, expected) in cases {
            assert_eq!(to_value(&message)["type"], expected);
            assert_eq!(message.kind(), expected);
        }
    }

    #[test]
    fn file_changed_has_no_payload() {
        assert_eq!(to_value(&ChannelMessage::FileChanged), json!({ "type": "file_changed" }));
    }

    #[test]
    fn save_without_base_revision_parses_from_bare_envelope() {
        let parsed: ChannelMessage = serde_json::from_str(r#"{"type":"save"}"#).unwrap();
        assert_eq!(parsed, ChannelMessage::Save { base_revision: None });
    }

    #[test]
    fn save_carries_optional_base_revision() {
        let parsed: ChannelMessage =
            serde_json::from_str(r#"{"type":"save","base_revision":"abc123"}"#).unwrap();
        assert_eq!(parsed, ChannelMessage::Save { base_revision: Some(Revision::new("abc123")) });
    }

    #[test]
    fn awareness_payload_is_opaque_json() {
        let raw = r#"{"type":"awareness","update":{"user":{"name":"ada"},"cursor":[1,2]},"sender":"s1"}"#;
        let parsed: ChannelMessage = serde_json::from_str(raw).unwrap();
        let ChannelMessage::Awareness { update, sender } = parsed else {
            panic!("expected awareness");
        };
        assert_eq!(sender, "s1");
        assert_eq!(update["user"]["name"], "ada");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ChannelMessage>(r#"{"type":"subscribe"}"#).is_err());
    }
}
