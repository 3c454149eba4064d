use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TransmissionEvent;
use crate::roster::{Friend, Group, GroupMember};
use crate::timestamp::serde_millis_option;

pub const CORRELATION_ID_FIELD: &str = "correlationId";

/// A batch of events for the friends channel or a single group, either as a plain
/// list or as a gzip+base64 blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TransmissionEvent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogsRequest {
    pub target_peer_id: String,
    pub logs: Vec<TransmissionEvent>,
    #[serde(with = "serde_millis_option")]
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// A page of a peer's events, returned for a sync request or pushed unsolicited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogsPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default)]
    pub logs: Vec<TransmissionEvent>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register { token: String, user_id: String },
    BatchLogs(LogBatch),
    BatchGroupLogs(LogBatch),
    SyncLogs(SyncLogsRequest),
    #[serde(rename_all = "camelCase")]
    UpdateProfile {
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::BatchLogs(_) => "batch_logs",
            ClientMessage::BatchGroupLogs(_) => "batch_group_logs",
            ClientMessage::SyncLogs(_) => "sync_logs",
            ClientMessage::UpdateProfile { .. } => "update_profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        log: TransmissionEvent,
        #[serde(default)]
        from_user_id: Option<String>,
    },
    BatchLogs(LogBatch),
    BatchGroupLogs(LogBatch),
    SyncLogs(SyncLogsPage),
    #[serde(rename_all = "camelCase")]
    PeerOnline { user_id: String },
    #[serde(rename_all = "camelCase")]
    PeerOffline { user_id: String },
    FriendsList { friends: Vec<Friend> },
    GroupsList { groups: Vec<Group> },
    #[serde(rename_all = "camelCase")]
    GroupMembers {
        group_id: String,
        members: Vec<GroupMember>,
    },
    #[serde(other)]
    Unknown,
}

/// Serializes a client message, stamping the correlation id when one is given.
pub fn encode_message(
    message: &ClientMessage,
    correlation_id: Option<&str>,
) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(message)?;
    if let (Some(correlation_id), Some(object)) = (correlation_id, value.as_object_mut()) {
        object.insert(
            CORRELATION_ID_FIELD.to_string(),
            serde_json::Value::String(correlation_id.to_string()),
        );
    }
    serde_json::to_string(&value)
}

/// A decoded text frame: the raw value (for correlated responses) plus its id.
#[derive(Debug)]
pub struct DecodedFrame {
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub value: serde_json::Value,
}

pub fn decode_frame(text: &str) -> Result<DecodedFrame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let correlation_id = value
        .get(CORRELATION_ID_FIELD)
        .and_then(|id| id.as_str())
        .map(str::to_string);
    let message_type = value
        .get("type")
        .and_then(|kind| kind.as_str())
        .map(str::to_string);

    Ok(DecodedFrame {
        correlation_id,
        message_type,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, encode_message, ClientMessage, InboundMessage, LogBatch};
    use crate::model::fixtures::event_at;
    use serde_json::json;

    #[test]
    fn plain_batch_serializes_as_logs_array() {
        let message = ClientMessage::BatchLogs(LogBatch {
            logs: vec![event_at("a", "2024-06-07T12:00:00.000Z").to_transmission()],
            ..LogBatch::default()
        });

        let encoded: serde_json::Value =
            serde_json::from_str(&encode_message(&message, None).expect("encodes")).expect("json");

        assert_eq!(encoded["type"], "batch_logs");
        assert_eq!(encoded["logs"][0]["id"], "a");
        assert!(encoded.get("compressed").is_none());
        assert!(encoded.get("correlationId").is_none());
    }

    #[test]
    fn compressed_group_batch_carries_marker_and_group() {
        let message = ClientMessage::BatchGroupLogs(LogBatch {
            group_id: Some("g1".to_string()),
            compressed: true,
            compressed_data: Some("H4sI".to_string()),
            ..LogBatch::default()
        });

        let encoded: serde_json::Value = serde_json::from_str(
            &encode_message(&message, Some("corr-1")).expect("encodes"),
        )
        .expect("json");

        assert_eq!(encoded["type"], "batch_group_logs");
        assert_eq!(encoded["groupId"], "g1");
        assert_eq!(encoded["compressed"], true);
        assert_eq!(encoded["compressedData"], "H4sI");
        assert!(encoded.get("logs").is_none());
        assert_eq!(encoded["correlationId"], "corr-1");
    }

    #[test]
    fn decodes_inbound_messages() {
        let online: InboundMessage =
            serde_json::from_value(json!({ "type": "peer_online", "userId": "u2" })).expect("parses");
        assert_eq!(
            online,
            InboundMessage::PeerOnline {
                user_id: "u2".to_string()
            }
        );

        let sync: InboundMessage = serde_json::from_value(json!({
            "type": "sync_logs",
            "fromUserId": "u2",
            "logs": [],
            "hasMore": false,
            "total": 0,
            "offset": 0,
            "limit": 100
        }))
        .expect("parses");
        assert!(matches!(sync, InboundMessage::SyncLogs(page) if page.limit == 100));

        let unknown: InboundMessage =
            serde_json::from_value(json!({ "type": "something_new" })).expect("parses");
        assert_eq!(unknown, InboundMessage::Unknown);
    }

    #[test]
    fn frame_decoding_exposes_correlation() {
        let frame = decode_frame(r#"{"type":"response","correlationId":"abc","success":true}"#)
            .expect("decodes");

        assert_eq!(frame.correlation_id.as_deref(), Some("abc"));
        assert_eq!(frame.message_type.as_deref(), Some("response"));
    }
}
