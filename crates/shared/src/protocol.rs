use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, Role, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub patient_id: UserId,
    pub doctor_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub patient: ParticipantSummary,
    pub doctor: ParticipantSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub id: UserId,
    pub full_name: String,
    pub role: Role,
}

/// A transcript entry as callers see it: the stored message joined with the
/// sender's display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: SenderSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub doctor_id: Option<UserId>,
    #[serde(default)]
    pub patient_id: Option<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
}

/// Frames a live connection may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Register {
        user_id: UserId,
    },
    Join {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        sender_id: UserId,
        #[serde(default)]
        content: Option<String>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Disconnect,
}

/// Frames pushed to live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: MessageView,
    },
    MessageError {
        error: ApiError,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    Error(ApiError),
}
