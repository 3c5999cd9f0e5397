use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{ChannelId, MessageId, NotificationId, WorkspaceId},
    error::ApiError,
    protocol::{
        ChannelPayload, MemberPermissions, MessagePayload, NotificationPayload, OutgoingMessage,
        PermissionUpdate, ReactionPayload,
    },
};
use tracing::debug;
use url::Url;

use crate::error::RestError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

#[derive(Serialize)]
struct EditMessageRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct AddReactionRequest<'a> {
    emoji: &'a str,
}

/// REST collaborator. Every call is authenticated as the session's actor.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &PageQuery,
    ) -> Result<Vec<MessagePayload>, RestError>;
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &OutgoingMessage,
    ) -> Result<MessagePayload, RestError>;
    async fn edit_message(
        &self,
        message_id: &MessageId,
        text: &str,
    ) -> Result<MessagePayload, RestError>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<(), RestError>;
    async fn add_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionPayload, RestError>;
    /// Reactions whose server id is not known locally are removed by
    /// `(message, emoji)`.
    async fn remove_reaction(&self, reaction: &ReactionPayload) -> Result<(), RestError>;
    async fn fetch_permissions(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<MemberPermissions, RestError>;
    async fn update_permissions(
        &self,
        workspace_id: &WorkspaceId,
        update: &PermissionUpdate,
    ) -> Result<MemberPermissions, RestError>;
    async fn list_channels(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ChannelPayload>, RestError>;
    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, RestError>;
    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), RestError>;
}

pub struct HttpSyncApi {
    http: Client,
    base: Url,
    bearer_token: String,
}

impl HttpSyncApi {
    pub fn new(base: Url, bearer_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base,
            bearer_token: bearer_token.into(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RestError::Transport(format!("server url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.bearer_token)
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RestError> {
    let response = check(response).await?;
    Ok(response.json::<T>().await?)
}

async fn check(response: Response) -> Result<Response, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ApiError>().await.ok();
    let err = RestError::from_status(status.as_u16(), body);
    debug!(status = status.as_u16(), error = %err, "api: request failed");
    Err(err)
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &PageQuery,
    ) -> Result<Vec<MessagePayload>, RestError> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "messages"])?;
        let response = self.authed(self.http.get(url).query(query)).send().await?;
        read_json(response).await
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &OutgoingMessage,
    ) -> Result<MessagePayload, RestError> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "messages"])?;
        let response = self.authed(self.http.post(url).json(body)).send().await?;
        read_json(response).await
    }

    async fn edit_message(
        &self,
        message_id: &MessageId,
        text: &str,
    ) -> Result<MessagePayload, RestError> {
        let url = self.endpoint(&["messages", message_id.as_str()])?;
        let response = self
            .authed(self.http.put(url).json(&EditMessageRequest { text }))
            .send()
            .await?;
        read_json(response).await
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), RestError> {
        let url = self.endpoint(&["messages", message_id.as_str()])?;
        check(self.authed(self.http.delete(url)).send().await?).await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionPayload, RestError> {
        let url = self.endpoint(&["messages", message_id.as_str(), "reactions"])?;
        let response = self
            .authed(self.http.post(url).json(&AddReactionRequest { emoji }))
            .send()
            .await?;
        read_json(response).await
    }

    async fn remove_reaction(&self, reaction: &ReactionPayload) -> Result<(), RestError> {
        let url = if reaction.id.is_temporary() {
            self.endpoint(&[
                "messages",
                reaction.message_id.as_str(),
                "reactions",
                reaction.emoji.as_str(),
            ])?
        } else {
            self.endpoint(&["reactions", reaction.id.as_str()])?
        };
        check(self.authed(self.http.delete(url)).send().await?).await?;
        Ok(())
    }

    async fn fetch_permissions(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<MemberPermissions, RestError> {
        let url = self.endpoint(&["workspaces", workspace_id.as_str(), "permissions"])?;
        read_json(self.authed(self.http.get(url)).send().await?).await
    }

    async fn update_permissions(
        &self,
        workspace_id: &WorkspaceId,
        update: &PermissionUpdate,
    ) -> Result<MemberPermissions, RestError> {
        let url = self.endpoint(&["workspaces", workspace_id.as_str(), "permissions"])?;
        read_json(self.authed(self.http.put(url).json(update)).send().await?).await
    }

    async fn list_channels(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ChannelPayload>, RestError> {
        let url = self.endpoint(&["workspaces", workspace_id.as_str(), "channels"])?;
        read_json(self.authed(self.http.get(url)).send().await?).await
    }

    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, RestError> {
        let url = self.endpoint(&["notifications"])?;
        read_json(self.authed(self.http.get(url)).send().await?).await
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), RestError> {
        let url = self.endpoint(&["notifications", id.as_str(), "read"])?;
        check(self.authed(self.http.post(url)).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
