use std::{sync::Arc, time::Instant};

use chrono::Utc;
use shared::{
    domain::{ChannelId, MessageId, NotificationId, Role, RoomId, UserId, WorkspaceId},
    protocol::{
        AttachmentRef, ChannelPayload, GuestGrants, NotificationPayload, ServerEvent,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod permissions;
pub mod reconcile;
pub mod rooms;
pub mod stores;
pub mod transport;

use api::{PageQuery, SyncApi};
use config::SyncSettings;
use error::{RestError, SyncError};
use permissions::CapabilitySet;
use reconcile::{Change, OutgoingSend, Reconciler, SendOutcome, ToggleIntent};
use stores::{Delivery, Message, ReactionSummary};
use transport::{EventTransport, TransportEvent};

/// Who the client acts as. Read-only for the lifetime of a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct Session {
    pub actor_id: UserId,
    pub workspace_id: WorkspaceId,
    pub workspace_role: Role,
    pub is_guest: bool,
    pub bearer_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessagesChanged { channel_id: ChannelId },
    ReactionsChanged { message_id: MessageId },
    ChannelsChanged,
    CapabilitiesChanged(CapabilitySet),
    UnreadChanged(usize),
    RoomJoined(RoomId),
    Connected { resumed: bool },
    Disconnected { reason: String },
    Error(String),
}

/// A send running in the background. Dropping the handle does not cancel
/// the request.
pub struct SendHandle {
    pub temp_id: MessageId,
    task: JoinHandle<Result<SendOutcome, SyncError>>,
}

impl SendHandle {
    pub async fn outcome(self) -> Result<SendOutcome, SyncError> {
        self.task.await.map_err(|_| SyncError::Cancelled)?
    }
}

pub struct SyncClient {
    session: Session,
    settings: SyncSettings,
    api: Arc<dyn SyncApi>,
    transport: Arc<dyn EventTransport>,
    engine: Mutex<Reconciler>,
    events: broadcast::Sender<ClientEvent>,
    unread: watch::Sender<usize>,
    capabilities: watch::Sender<CapabilitySet>,
}

impl SyncClient {
    pub fn new(
        session: Session,
        settings: SyncSettings,
        api: Arc<dyn SyncApi>,
        transport: Arc<dyn EventTransport>,
    ) -> Arc<Self> {
        let engine = Reconciler::new(
            session.actor_id.clone(),
            session.workspace_id.clone(),
            session.workspace_role,
            session.is_guest,
        )
        .with_defer_window(settings.defer_window);
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (unread, _) = watch::channel(0);
        let (capabilities, _) = watch::channel(CapabilitySet::none());
        Arc::new(Self {
            session,
            settings,
            api,
            transport,
            engine: Mutex::new(engine),
            events,
            unread,
            capabilities,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Joins the workspace room and spawns the event pump. Every time the
    /// transport reports a connection, permissions, channels, notifications
    /// and the active channel are fetched again.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut transport_events = self.transport.subscribe();
        self.transport
            .join_room(RoomId::Workspace(self.session.workspace_id.clone()))
            .await;

        let client = Arc::clone(self);
        let tick = (self.settings.defer_window / 2).max(std::time::Duration::from_millis(50));
        tokio::spawn(async move {
            let mut expiry = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    received = transport_events.recv() => match received {
                        Ok(event) => client.on_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client: transport events lagged, resyncing");
                            client.spawn_resync();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = expiry.tick() => {
                        client.engine.lock().await.expire_deferred(Instant::now());
                    }
                }
            }
            info!("client: event pump stopped");
        })
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { resumed } => {
                self.emit(ClientEvent::Connected { resumed });
                self.spawn_resync();
            }
            TransportEvent::Disconnected { reason } => {
                self.emit(ClientEvent::Disconnected { reason });
            }
            TransportEvent::Event(event) => self.apply_server_event(event).await,
        }
    }

    async fn apply_server_event(&self, event: ServerEvent) {
        let name = event.name();
        let mut engine = self.engine.lock().await;
        let changes = engine.apply_event(event, Instant::now());
        debug!(event = name, changes = changes.len(), "client: server event applied");
        self.publish(&engine, changes);
    }

    fn spawn_resync(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.resync().await {
                warn!(error = %err, "client: resync failed");
                client.emit(ClientEvent::Error(format!("resync failed: {err}")));
            }
        });
    }

    /// Re-pulls everything a disconnected client may have missed.
    pub async fn resync(self: &Arc<Self>) -> Result<(), SyncError> {
        self.refresh_permissions().await?;
        self.refresh_channels().await?;
        self.refresh_notifications().await?;
        self.refetch_active_channel().await
    }

    pub async fn refresh_permissions(&self) -> Result<(), SyncError> {
        match self.api.fetch_permissions(&self.session.workspace_id).await {
            Ok(permissions) => {
                let mut engine = self.engine.lock().await;
                let changes = engine.apply_permissions(permissions);
                self.publish(&engine, changes);
                Ok(())
            }
            Err(err) => {
                let mut engine = self.engine.lock().await;
                let changes = engine.note_rest_failure(&err);
                self.publish(&engine, changes);
                Err(err.into())
            }
        }
    }

    async fn refresh_channels(self: &Arc<Self>) -> Result<(), SyncError> {
        let result = self.api.list_channels(&self.session.workspace_id).await;
        let channels = self.settle(result).await?;
        let mut engine = self.engine.lock().await;
        let changes = engine.replace_channels(channels);
        self.publish(&engine, changes);
        Ok(())
    }

    async fn refresh_notifications(self: &Arc<Self>) -> Result<(), SyncError> {
        let result = self.api.list_notifications().await;
        let notifications = self.settle(result).await?;
        let mut engine = self.engine.lock().await;
        let changes = engine.replace_notifications(notifications);
        self.publish(&engine, changes);
        Ok(())
    }

    async fn refetch_active_channel(self: &Arc<Self>) -> Result<(), SyncError> {
        let Some(ticket) = self.engine.lock().await.refetch_ticket() else {
            return Ok(());
        };
        let query = PageQuery {
            limit: self.settings.fetch_limit,
            before: None,
        };
        let result = self.api.fetch_messages(&ticket.channel_id, &query).await;
        let page = self.settle(result).await?;
        let mut engine = self.engine.lock().await;
        if let Some(changes) = engine.complete_fetch(&ticket, page, Instant::now()) {
            self.publish(&engine, changes);
        }
        Ok(())
    }

    /// Records a failed REST call against the role snapshot. A 403 refetches
    /// permissions in the background.
    async fn settle<T>(self: &Arc<Self>, result: Result<T, RestError>) -> Result<T, SyncError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                {
                    let mut engine = self.engine.lock().await;
                    let changes = engine.note_rest_failure(&err);
                    self.publish(&engine, changes);
                }
                self.after_failure(&err);
                Err(err.into())
            }
        }
    }

    fn after_failure(self: &Arc<Self>, err: &RestError) {
        if !err.is_authorization() {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.refresh_permissions().await {
                warn!(error = %err, "client: permission refresh after 403 failed");
            }
        });
    }

    // ---- actions -------------------------------------------------------

    /// Switches the active channel: leaves the previous channel room, joins
    /// the new one and loads its latest page. A page that arrives after the
    /// user navigated elsewhere is discarded.
    pub async fn select_channel(self: &Arc<Self>, channel_id: ChannelId) -> Result<(), SyncError> {
        let (ticket, previous) = {
            let mut engine = self.engine.lock().await;
            let previous = engine.active_channel().cloned();
            let ticket = engine.select_channel(channel_id.clone());
            self.publish(&engine, Vec::new());
            (ticket, previous)
        };
        if let Some(previous) = previous.filter(|previous| previous != &channel_id) {
            self.transport.leave_room(RoomId::Channel(previous)).await;
        }
        self.transport
            .join_room(RoomId::Channel(channel_id.clone()))
            .await;

        let query = PageQuery {
            limit: self.settings.fetch_limit,
            before: None,
        };
        let result = self.api.fetch_messages(&channel_id, &query).await;
        let page = self.settle(result).await?;
        let mut engine = self.engine.lock().await;
        match engine.complete_fetch(&ticket, page, Instant::now()) {
            Some(changes) => self.publish(&engine, changes),
            None => debug!(%channel_id, "client: navigated away before page arrived"),
        }
        Ok(())
    }

    /// Loads the page before the oldest confirmed message of the active
    /// channel. Returns false once the server has nothing older.
    pub async fn load_older(self: &Arc<Self>) -> Result<bool, SyncError> {
        let (ticket, before) = {
            let engine = self.engine.lock().await;
            let ticket = engine.refetch_ticket().ok_or(SyncError::NoActiveChannel)?;
            let before = engine
                .messages()
                .channel(&ticket.channel_id)
                .iter()
                .find(|message| message.delivery == Delivery::Confirmed)
                .map(|message| message.id.clone());
            (ticket, before)
        };
        let query = PageQuery {
            limit: self.settings.fetch_limit,
            before,
        };
        let result = self.api.fetch_messages(&ticket.channel_id, &query).await;
        let page = self.settle(result).await?;
        let more = !page.is_empty();
        let mut engine = self.engine.lock().await;
        match engine.complete_fetch(&ticket, page, Instant::now()) {
            Some(changes) => self.publish(&engine, changes),
            None => debug!(channel_id = %ticket.channel_id, "client: navigated away before older page arrived"),
        }
        Ok(more)
    }

    pub async fn send(
        self: &Arc<Self>,
        channel_id: ChannelId,
        text: Option<String>,
        attachment: Option<AttachmentRef>,
    ) -> Result<SendHandle, SyncError> {
        let text = text.filter(|text| !text.trim().is_empty());
        let send = {
            let mut engine = self.engine.lock().await;
            let send = engine.begin_send(channel_id.clone(), text, attachment, Utc::now())?;
            self.publish(&engine, vec![Change::Messages(channel_id)]);
            send
        };
        Ok(self.dispatch_send(send))
    }

    pub async fn send_to_active(self: &Arc<Self>, text: String) -> Result<SendHandle, SyncError> {
        let channel_id = self
            .engine
            .lock()
            .await
            .active_channel()
            .cloned()
            .ok_or(SyncError::NoActiveChannel)?;
        self.send(channel_id, Some(text), None).await
    }

    pub async fn retry(self: &Arc<Self>, temp_id: &MessageId) -> Result<SendHandle, SyncError> {
        let send = {
            let mut engine = self.engine.lock().await;
            let send = engine.retry_send(temp_id)?;
            self.publish(&engine, vec![Change::Messages(send.channel_id.clone())]);
            send
        };
        Ok(self.dispatch_send(send))
    }

    pub async fn discard(&self, temp_id: &MessageId) -> Result<(), SyncError> {
        let mut engine = self.engine.lock().await;
        let channel_id = engine.discard_send(temp_id)?;
        self.publish(&engine, vec![Change::Messages(channel_id)]);
        Ok(())
    }

    fn dispatch_send(self: &Arc<Self>, send: OutgoingSend) -> SendHandle {
        let client = Arc::clone(self);
        let temp_id = send.temp_id.clone();
        let task = tokio::spawn(async move {
            match client.api.send_message(&send.channel_id, &send.body).await {
                Ok(payload) => {
                    let mut engine = client.engine.lock().await;
                    let (outcome, changes) =
                        engine.confirm_send(&send.temp_id, payload, Instant::now());
                    info!(temp_id = %send.temp_id, server_id = %outcome.server_id(), "client: send confirmed");
                    client.publish(&engine, changes);
                    Ok(outcome)
                }
                Err(err) => {
                    warn!(temp_id = %send.temp_id, error = %err, "client: send failed");
                    {
                        let mut engine = client.engine.lock().await;
                        let changes = engine.fail_send(&send.temp_id, &err);
                        client.publish(&engine, changes);
                    }
                    client.after_failure(&err);
                    Err(err.into())
                }
            }
        });
        SendHandle { temp_id, task }
    }

    pub async fn edit(self: &Arc<Self>, message_id: &MessageId, text: String) -> Result<(), SyncError> {
        {
            let mut engine = self.engine.lock().await;
            let channel_id = engine.begin_edit(message_id, text.clone())?;
            self.publish(&engine, vec![Change::Messages(channel_id)]);
        }
        match self.api.edit_message(message_id, &text).await {
            Ok(payload) => {
                let mut engine = self.engine.lock().await;
                let changes = engine.confirm_edit(payload);
                self.publish(&engine, changes);
                Ok(())
            }
            Err(err) => {
                {
                    let mut engine = self.engine.lock().await;
                    let changes = engine.fail_edit(message_id, &err);
                    self.publish(&engine, changes);
                }
                self.after_failure(&err);
                Err(err.into())
            }
        }
    }

    pub async fn remove(self: &Arc<Self>, message_id: &MessageId) -> Result<(), SyncError> {
        {
            let mut engine = self.engine.lock().await;
            let channel_id = engine.begin_remove(message_id)?;
            self.publish(&engine, vec![Change::Messages(channel_id)]);
        }
        let result = self.api.delete_message(message_id).await;
        let mut engine = self.engine.lock().await;
        match result {
            Ok(()) => {
                let changes = engine.confirm_remove(message_id);
                self.publish(&engine, changes);
                Ok(())
            }
            Err(err) => {
                let changes = engine.fail_remove(message_id, &err);
                self.publish(&engine, changes);
                drop(engine);
                if err.is_idempotent_success() {
                    return Ok(());
                }
                self.after_failure(&err);
                Err(err.into())
            }
        }
    }

    /// Toggles the actor's reaction. A second toggle for the same emoji is
    /// rejected until the first one settles.
    pub async fn react(self: &Arc<Self>, message_id: &MessageId, emoji: &str) -> Result<(), SyncError> {
        let intent = {
            let mut engine = self.engine.lock().await;
            let intent = engine.begin_toggle(message_id, emoji)?;
            self.publish(&engine, vec![Change::Reactions(message_id.clone())]);
            intent
        };

        let result = match &intent {
            ToggleIntent::Add { .. } => self
                .api
                .add_reaction(message_id, emoji)
                .await
                .map(Some),
            ToggleIntent::Remove { existing, .. } => {
                self.api.remove_reaction(existing).await.map(|()| None)
            }
        };

        let mut engine = self.engine.lock().await;
        match result {
            Ok(Some(reaction)) => {
                let changes = engine.confirm_reaction_added(&intent, reaction);
                self.publish(&engine, changes);
                Ok(())
            }
            Ok(None) => {
                let changes = engine.confirm_reaction_removed(&intent);
                self.publish(&engine, changes);
                Ok(())
            }
            Err(err) => {
                let changes = engine.fail_toggle(&intent, &err);
                self.publish(&engine, changes);
                drop(engine);
                if err.is_idempotent_success() {
                    return Ok(());
                }
                self.after_failure(&err);
                Err(err.into())
            }
        }
    }

    /// Marks a notification read locally at once; the local read survives
    /// a failed server call and later snapshots.
    pub async fn mark_read(self: &Arc<Self>, id: &NotificationId) -> Result<(), SyncError> {
        let flipped = {
            let mut engine = self.engine.lock().await;
            let changes = engine.mark_read(id);
            let flipped = !changes.is_empty();
            self.publish(&engine, changes);
            flipped
        };
        if !flipped {
            return Ok(());
        }
        let result = self.api.mark_notification_read(id).await;
        self.settle(result).await
    }

    pub async fn change_member_role(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        user_id: &UserId,
        role_override: Option<Role>,
        guest_grants: Option<GuestGrants>,
    ) -> Result<(), SyncError> {
        let update = {
            let engine = self.engine.lock().await;
            engine.authorize_role_change(channel_id)?;
            engine
                .channels()
                .member_update(channel_id, user_id, role_override, guest_grants)
        };
        let result = self
            .api
            .update_permissions(&self.session.workspace_id, &update)
            .await;
        let permissions = self.settle(result).await?;
        let mut engine = self.engine.lock().await;
        let changes = engine.apply_permissions(permissions);
        self.publish(&engine, changes);
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.engine.lock().await.messages().channel(channel_id).to_vec()
    }

    pub async fn reactions(&self, message_id: &MessageId) -> Vec<ReactionSummary> {
        let engine = self.engine.lock().await;
        engine
            .reactions()
            .summarize(message_id, &self.session.actor_id)
    }

    pub async fn unread_count(&self) -> usize {
        self.engine.lock().await.notifications().unread_count()
    }

    pub async fn notifications(&self) -> Vec<NotificationPayload> {
        self.engine
            .lock()
            .await
            .notifications()
            .items()
            .cloned()
            .collect()
    }

    /// Capabilities for the active channel, resolved from the current
    /// role snapshot.
    pub async fn capabilities(&self) -> CapabilitySet {
        self.engine.lock().await.active_capabilities()
    }

    pub async fn capabilities_in(&self, channel_id: &ChannelId) -> CapabilitySet {
        self.engine.lock().await.capabilities(channel_id)
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Option<ChannelPayload> {
        self.engine.lock().await.channels().get(channel_id).cloned()
    }

    pub async fn channels(&self) -> Vec<ChannelPayload> {
        self.engine
            .lock()
            .await
            .channels()
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.engine.lock().await.active_channel().cloned()
    }

    // ---- reactive ------------------------------------------------------

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Same feed as [`Self::subscribe_events`]; lagged gaps are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = ClientEvent> + Send + Unpin {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    pub fn watch_unread(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }

    pub fn watch_capabilities(&self) -> watch::Receiver<CapabilitySet> {
        self.capabilities.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Forwards engine changes to subscribers. Capabilities for the active
    /// channel are recomputed on every call.
    fn publish(&self, engine: &Reconciler, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Messages(channel_id) => self.emit(ClientEvent::MessagesChanged { channel_id }),
                Change::Reactions(message_id) => {
                    self.emit(ClientEvent::ReactionsChanged { message_id })
                }
                Change::Channels => self.emit(ClientEvent::ChannelsChanged),
                Change::Roles => {}
                Change::Unread(count) => {
                    self.unread.send_replace(count);
                    self.emit(ClientEvent::UnreadChanged(count));
                }
                Change::RoomAcknowledged(room) => self.emit(ClientEvent::RoomJoined(room)),
            }
        }

        let capabilities = engine.active_capabilities();
        let changed = self.capabilities.send_if_modified(|current| {
            if *current == capabilities {
                return false;
            }
            *current = capabilities;
            true
        });
        if changed {
            self.emit(ClientEvent::CapabilitiesChanged(capabilities));
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
