use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::message::MessageRow;
use crate::snowflake;

/// Closed set of wire message types. Adding a variant forces every
/// dispatch-point match in the session handler to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Connect,
    ConversationJoin,
    ConversationLeave,
    ConversationMessage,
    Error,
}

/// Wire envelope: `{ id, type, data, timestamp, userId? }`. Immutable once
/// constructed; `id` lets clients dedup, `timestamp` is milliseconds since
/// the UNIX epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: serde_json::Value,
    pub timestamp: i64,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
}

/// Inbound `connect` payload: the client's credential.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub token: String,
}

/// Outbound `connect` acknowledgement payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectData {
    pub user_id: String,
    pub display_name: String,
}

/// Payload for `conversationJoin` / `conversationLeave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipData {
    pub conversation_id: String,
    pub user_id: String,
}

/// Payload for `conversationMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessageData {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_name: Option<String>,
}

impl ConversationMessageData {
    pub fn has_content(&self) -> bool {
        self.text.is_some() || self.url.is_some() || self.file_name.is_some()
    }
}

/// Payload for `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

/// A classified inbound frame. Classification is total: anything that is
/// not one of these becomes a `ProtocolError`, never a panic, so the
/// session handler can always answer with a well-formed `error` envelope.
#[derive(Debug, Clone)]
pub enum Inbound {
    Connect(ConnectRequest),
    Join(MembershipData),
    Leave(MembershipData),
    Message(ConversationMessageData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
}

impl ProtocolError {
    fn decode(message: impl Into<String>) -> Self {
        Self {
            code: "decode_error",
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_request",
            message: message.into(),
        }
    }
}

/// Classify arbitrary inbound text into a typed frame.
pub fn classify(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::decode(format!("malformed envelope: {e}")))?;

    match envelope.kind {
        MessageType::Connect => {
            let data: ConnectRequest = serde_json::from_value(envelope.data)
                .map_err(|e| ProtocolError::decode(format!("malformed connect data: {e}")))?;
            if data.token.is_empty() {
                return Err(ProtocolError::invalid("token is required"));
            }
            Ok(Inbound::Connect(data))
        }
        MessageType::ConversationJoin | MessageType::ConversationLeave => {
            let data: MembershipData = serde_json::from_value(envelope.data)
                .map_err(|e| ProtocolError::decode(format!("malformed membership data: {e}")))?;
            if data.conversation_id.is_empty() || data.user_id.is_empty() {
                return Err(ProtocolError::invalid(
                    "conversationId and userId are required",
                ));
            }
            if envelope.kind == MessageType::ConversationJoin {
                Ok(Inbound::Join(data))
            } else {
                Ok(Inbound::Leave(data))
            }
        }
        MessageType::ConversationMessage => {
            let data: ConversationMessageData = serde_json::from_value(envelope.data)
                .map_err(|e| ProtocolError::decode(format!("malformed message data: {e}")))?;
            if data.conversation_id.is_empty() || data.sender_id.is_empty() {
                return Err(ProtocolError::invalid(
                    "conversationId and senderId are required",
                ));
            }
            if !data.has_content() {
                return Err(ProtocolError::invalid(
                    "message must have text, url, or fileName",
                ));
            }
            Ok(Inbound::Message(data))
        }
        MessageType::Error => Err(ProtocolError::invalid(
            "error envelopes are not accepted from clients",
        )),
    }
}

impl Envelope {
    fn build(kind: MessageType, data: impl Serialize, user_id: Option<String>) -> Self {
        Self {
            id: snowflake::generate(),
            kind,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            timestamp: chrono::Utc::now().timestamp_millis(),
            user_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `connect` acknowledgement sent after a successful handshake.
pub fn new_connect(user_id: &str, display_name: &str) -> Envelope {
    Envelope::build(
        MessageType::Connect,
        ConnectData {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        },
        Some(user_id.to_string()),
    )
}

pub fn new_member_joined(conversation_id: &str, user_id: &str) -> Envelope {
    Envelope::build(
        MessageType::ConversationJoin,
        MembershipData {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
        },
        Some(user_id.to_string()),
    )
}

pub fn new_member_left(conversation_id: &str, user_id: &str) -> Envelope {
    Envelope::build(
        MessageType::ConversationLeave,
        MembershipData {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
        },
        Some(user_id.to_string()),
    )
}

/// Broadcast envelope for a persisted message. Carries the persisted id and
/// the canonical storage timestamp rather than fresh ones, so every client
/// sees exactly what was stored.
pub fn new_conversation_message(row: &MessageRow) -> Envelope {
    Envelope {
        id: row.id.clone(),
        kind: MessageType::ConversationMessage,
        data: serde_json::to_value(ConversationMessageData {
            conversation_id: row.conversation_id.clone(),
            sender_id: row.sender_id.clone(),
            text: row.text.clone(),
            url: row.url.clone(),
            file_name: row.file_name.clone(),
        })
        .unwrap_or(serde_json::Value::Null),
        timestamp: row.created_at,
        user_id: Some(row.sender_id.clone()),
    }
}

pub fn new_error(code: &str, message: &str, details: Option<serde_json::Value>) -> Envelope {
    Envelope::build(
        MessageType::Error,
        ErrorData {
            code: code.to_string(),
            message: message.to_string(),
            details,
        },
        None,
    )
}

/// Error envelope for a failed operation, contained to one connection.
pub fn error_envelope(err: &AppError) -> Envelope {
    new_error(err.code(), &err.message(), None)
}
