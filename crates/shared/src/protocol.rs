use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentId, MediaClass, MemberRole, MessageId, MessageKind, OrganizationId, Role,
        RoomId, RoomKind, UserId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub kind: RoomKind,
    pub created_by: UserId,
    pub is_private: bool,
    #[serde(default)]
    pub members: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub organization_id: OrganizationId,
    pub author_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on optimistic local entries until the remote confirms them.
    #[serde(skip)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub url: String,
    pub storage_path: String,
    pub media_class: MediaClass,
    pub mime_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoom {
    pub organization_id: OrganizationId,
    pub name: String,
    pub kind: RoomKind,
    pub created_by: UserId,
    pub is_private: bool,
}

/// Insert payload for a message; the id is chosen by the client so the
/// optimistic entry and the server echo share one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub organization_id: OrganizationId,
    pub author_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePatch {
    pub body: String,
    pub edited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttachment {
    pub message_id: MessageId,
    pub url: String,
    pub storage_path: String,
    pub media_class: MediaClass,
    pub mime_type: String,
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMembership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: MemberRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: String,
    pub public_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub room_id: RoomId,
    pub count: u32,
}

/// Logical push topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MessageChanges,
    RoomChanges,
    Typing,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageChanges => "message_changes",
            Self::RoomChanges => "room_changes",
            Self::Typing => "typing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum TopicFilter {
    Room(RoomId),
    Organization(OrganizationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    pub topic: Topic,
    pub filter: TopicFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Track,
    Untrack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub event: PresenceKind,
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-change payload carried by the message and room topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePayload {
    pub event_type: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<serde_json::Value>,
}

/// Frames the client writes to the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { key: TopicKey },
    Leave { key: TopicKey },
    Presence { key: TopicKey, presence: PresencePayload },
}

/// Frames the push channel delivers to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        topic: Topic,
        payload: serde_json::Value,
    },
    Error(ApiError),
}
