use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentId, ChannelId, MessageId, NotificationId, NotificationKind, ReactionId, Role,
        RoomId, UserId, Visibility, WorkspaceId,
    },
    error::ProtocolError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: AttachmentId,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Temporary id the sender attached to the POST, echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
}

impl MessagePayload {
    /// Server-side version used to linearize updates for one id.
    pub fn version(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.created_at)
    }
}

/// Body of `POST /channels/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub client_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub id: ReactionId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

/// Per-channel exceptions that lift default guest restrictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestGrants {
    #[serde(default)]
    pub can_write: bool,
    #[serde(default)]
    pub can_send_files: bool,
    #[serde(default)]
    pub can_react: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub user_id: UserId,
    pub workspace_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_role: Option<Role>,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default)]
    pub guest_grants: GuestGrants,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub id: ChannelId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub members: Vec<ChannelMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccess {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_override: Option<Role>,
    #[serde(default)]
    pub guest_grants: GuestGrants,
}

/// Canonical representation of `GET/PUT /workspaces/{id}/permissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPermissions {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub workspace_role: Role,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default)]
    pub channels: Vec<ChannelAccess>,
}

/// Body of `PUT /workspaces/{id}/permissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_override: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_grants: Option<GuestGrants>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Frames pushed by the server over the event transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new-message")]
    NewMessage { message: MessagePayload },
    #[serde(rename = "message-updated")]
    MessageUpdated { message: MessagePayload },
    #[serde(rename = "message-deleted")]
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    #[serde(rename = "reactionAdded")]
    ReactionAdded { reaction: ReactionPayload },
    #[serde(rename = "reactionRemoved")]
    ReactionRemoved {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    #[serde(rename = "room-joined")]
    RoomJoined { room: RoomId },
    #[serde(rename = "permissions-updated")]
    PermissionsUpdated { permissions: MemberPermissions },
    #[serde(rename = "channel-updated")]
    ChannelUpdated { channel: ChannelPayload },
    #[serde(rename = "notification")]
    NotificationCreated { notification: NotificationPayload },
    #[serde(rename = "notification-read")]
    NotificationRead { notification_id: NotificationId },
}

impl ServerEvent {
    /// Parses and validates one text frame. Anything that fails here never
    /// reaches the stores.
    pub fn from_wire(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new-message",
            Self::MessageUpdated { .. } => "message-updated",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::ReactionAdded { .. } => "reactionAdded",
            Self::ReactionRemoved { .. } => "reactionRemoved",
            Self::RoomJoined { .. } => "room-joined",
            Self::PermissionsUpdated { .. } => "permissions-updated",
            Self::ChannelUpdated { .. } => "channel-updated",
            Self::NotificationCreated { .. } => "notification",
            Self::NotificationRead { .. } => "notification-read",
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let event = self.name();
        let require = |present: bool, field: &'static str| {
            if present {
                Ok(())
            } else {
                Err(ProtocolError::MissingField { event, field })
            }
        };
        match self {
            Self::NewMessage { message } | Self::MessageUpdated { message } => {
                require(!message.id.as_str().is_empty(), "message.id")?;
                require(!message.channel_id.as_str().is_empty(), "message.channel_id")?;
                require(
                    message.text.is_some() || message.attachment.is_some(),
                    "message.text",
                )
            }
            Self::MessageDeleted {
                channel_id,
                message_id,
            } => {
                require(!channel_id.as_str().is_empty(), "channel_id")?;
                require(!message_id.as_str().is_empty(), "message_id")
            }
            Self::ReactionAdded { reaction } => {
                require(!reaction.message_id.as_str().is_empty(), "reaction.message_id")?;
                require(!reaction.user_id.as_str().is_empty(), "reaction.user_id")?;
                require(!reaction.emoji.is_empty(), "reaction.emoji")
            }
            Self::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => {
                require(!message_id.as_str().is_empty(), "message_id")?;
                require(!user_id.as_str().is_empty(), "user_id")?;
                require(!emoji.is_empty(), "emoji")
            }
            Self::PermissionsUpdated { permissions } => {
                require(!permissions.user_id.as_str().is_empty(), "permissions.user_id")
            }
            Self::ChannelUpdated { channel } => {
                require(!channel.id.as_str().is_empty(), "channel.id")
            }
            Self::NotificationCreated { notification } => {
                require(!notification.id.as_str().is_empty(), "notification.id")
            }
            Self::NotificationRead { notification_id } => {
                require(!notification_id.as_str().is_empty(), "notification_id")
            }
            Self::RoomJoined { .. } => Ok(()),
        }
    }
}

/// Frames the client sends over the event transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "join-room")]
    JoinRoom { room: RoomId },
    #[serde(rename = "leave-room")]
    LeaveRoom { room: RoomId },
}

impl ClientCommand {
    pub fn room(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room } | Self::LeaveRoom { room } => room,
        }
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_message_frame() {
        let raw = r#"{"event":"new-message","data":{"message":{
            "id":"m-42","channel_id":"c-1","author_id":"u-1","text":"hello",
            "created_at":"2024-01-01T00:00:00Z"}}}"#;
        let event = ServerEvent::from_wire(raw).expect("parse");
        match event {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.id, MessageId::from("m-42"));
                assert_eq!(message.text.as_deref(), Some("hello"));
                assert_eq!(message.version(), message.created_at);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_camel_case_reaction_events() {
        let raw = r#"{"event":"reactionRemoved","data":{
            "message_id":"m-1","user_id":"u-1","emoji":"thumbsup"}}"#;
        assert!(matches!(
            ServerEvent::from_wire(raw).expect("parse"),
            ServerEvent::ReactionRemoved { .. }
        ));
    }

    #[test]
    fn rejects_unknown_event_names() {
        let raw = r#"{"event":"typing","data":{"channel_id":"c-1"}}"#;
        assert!(matches!(
            ServerEvent::from_wire(raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_message_without_body() {
        let raw = r#"{"event":"new-message","data":{"message":{
            "id":"m-1","channel_id":"c-1","author_id":"u-1",
            "created_at":"2024-01-01T00:00:00Z"}}}"#;
        let err = ServerEvent::from_wire(raw).expect_err("must fail");
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                event: "new-message",
                field: "message.text"
            }
        ));
    }

    #[test]
    fn rejects_reaction_with_empty_emoji() {
        let raw = r#"{"event":"reactionAdded","data":{"reaction":{
            "id":"r-1","message_id":"m-1","user_id":"u-1","emoji":""}}}"#;
        assert!(ServerEvent::from_wire(raw).is_err());
    }

    #[test]
    fn room_commands_use_tagged_wire_format() {
        let command = ClientCommand::JoinRoom {
            room: RoomId::Channel(ChannelId::from("c-1")),
        };
        let wire = command.to_wire().expect("encode");
        assert_eq!(
            wire,
            r#"{"event":"join-room","data":{"room":{"kind":"channel","id":"c-1"}}}"#
        );
    }

    #[test]
    fn unknown_notification_kinds_degrade_to_unknown() {
        let raw = r#"{"id":"n-1","recipient_id":"u-1","kind":"poll","created_at":"2024-01-01T00:00:00Z"}"#;
        let notification: NotificationPayload = serde_json::from_str(raw).expect("parse");
        assert_eq!(notification.kind, NotificationKind::Unknown);
        assert!(!notification.read);
    }
}
