use chrono::Utc;
use serde::Serialize;

/// The message types the hub can emit (spec.md §4.6), plus the `SESSION`
/// handshake frame that carries `is_admin` to the client (spec.md:207).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Session,
    StatusUpdate,
    TalkerEvent,
    LinkAdded,
    LinkRemoved,
    LinkTxBatch,
    SourceNodeKeying,
    SourceNodeKeyingEvent,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Session => "SESSION",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::TalkerEvent => "TALKER_EVENT",
            MessageType::LinkAdded => "LINK_ADDED",
            MessageType::LinkRemoved => "LINK_REMOVED",
            MessageType::LinkTxBatch => "LINK_TX_BATCH",
            MessageType::SourceNodeKeying => "SOURCE_NODE_KEYING",
            MessageType::SourceNodeKeyingEvent => "SOURCE_NODE_KEYING_EVENT",
        }
    }
}

/// Serializes `data` into the `{messageType, data, timestamp}` envelope
/// (spec.md §4.6) as a JSON text frame.
pub fn envelope(message_type: MessageType, data: impl Serialize) -> String {
    serde_json::json!({
        "messageType": message_type.as_str(),
        "data": data,
        "timestamp": Utc::now(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_message_type_and_data() {
        let text = envelope(MessageType::StatusUpdate, serde_json::json!({"node_id": 594950}));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["messageType"], "STATUS_UPDATE");
        assert_eq!(parsed["data"]["node_id"], 594950);
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn session_envelope_carries_is_admin() {
        let text = envelope(MessageType::Session, serde_json::json!({"isAdmin": true}));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["messageType"], "SESSION");
        assert_eq!(parsed["data"]["isAdmin"], true);
    }
}
