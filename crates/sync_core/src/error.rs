use shared::{
    domain::{ChannelId, MessageId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

use crate::{permissions::Capability, stores::reactions::ReactionKey};

/// Failure reported by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestError {
    #[error("network failure: {0}")]
    Transport(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0:?}")]
    Rejected(ApiError),
}

impl RestError {
    pub fn from_status(status: u16, body: Option<ApiError>) -> Self {
        let message = body
            .as_ref()
            .map(|err| err.message.clone())
            .unwrap_or_else(|| format!("http status {status}"));
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            429 | 500..=599 => Self::Transport(message),
            _ => Self::Rejected(body.unwrap_or_else(|| ApiError::new(ErrorCode::Unknown, message))),
        }
    }

    /// Transient failures may be retried by the user; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// 403-class failures mean the cached capability set is stale.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }

    /// Outcomes that are idempotent success for toggles and deletes.
    pub fn is_idempotent_success(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }
}

impl From<reqwest::Error> for RestError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::from_status(status.as_u16(), None),
            None => Self::Transport(value.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect websocket: {0}")]
    Connect(String),
    #[error("websocket failed: {0}")]
    Socket(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("action not permitted in channel {channel_id}: {capability:?}")]
    NotPermitted {
        channel_id: ChannelId,
        capability: Capability,
    },
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error("reaction {emoji} on {message_id} already has a toggle in flight")]
    ToggleInFlight { message_id: MessageId, emoji: String },
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("no failed send with id {0}")]
    UnknownPending(MessageId),
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("no channel selected")]
    NoActiveChannel,
    #[error("background send task ended without a result")]
    Cancelled,
}

impl SyncError {
    pub fn toggle_in_flight(key: &ReactionKey) -> Self {
        Self::ToggleInFlight {
            message_id: key.message_id.clone(),
            emoji: key.emoji.clone(),
        }
    }
}
