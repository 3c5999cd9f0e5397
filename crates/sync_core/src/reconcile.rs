use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, NotificationId, ReactionId, Role, RoomId, UserId, WorkspaceId},
    protocol::{
        AttachmentRef, ChannelPayload, MemberPermissions, MessagePayload, NotificationPayload,
        OutgoingMessage, ReactionPayload, ServerEvent,
    },
};
use tracing::{debug, info, warn};

use crate::{
    error::{RestError, SyncError},
    permissions::{Capability, CapabilitySet},
    stores::{
        ChannelStore, Delivery, Message, MessageStore, NotificationStore, ReactionKey,
        ReactionStore,
    },
};

pub const DEFAULT_DEFER_WINDOW: Duration = Duration::from_secs(5);
const TOMBSTONE_CAPACITY: usize = 1024;

/// A UI-relevant consequence of one reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Messages(ChannelId),
    Reactions(MessageId),
    Channels,
    Roles,
    Unread(usize),
    RoomAcknowledged(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
    pub temp_id: MessageId,
    pub channel_id: ChannelId,
    pub body: OutgoingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The temporary entry now carries the server id.
    Confirmed(MessageId),
    /// A push for the server id landed first; the temporary entry was dropped.
    AlreadyDelivered(MessageId),
    /// The server id was deleted before the confirmation arrived.
    Discarded(MessageId),
}

impl SendOutcome {
    pub fn server_id(&self) -> &MessageId {
        match self {
            Self::Confirmed(id) | Self::AlreadyDelivered(id) | Self::Discarded(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleIntent {
    Add {
        key: ReactionKey,
        placeholder: ReactionPayload,
    },
    Remove {
        key: ReactionKey,
        existing: ReactionPayload,
    },
}

impl ToggleIntent {
    pub fn key(&self) -> &ReactionKey {
        match self {
            Self::Add { key, .. } | Self::Remove { key, .. } => key,
        }
    }
}

/// Issued on navigation; a fetch result is applied only while its ticket
/// is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub channel_id: ChannelId,
    generation: u64,
}

#[derive(Debug)]
struct PendingEdit {
    previous_text: Option<String>,
    base_version: DateTime<Utc>,
}

#[derive(Debug)]
struct DeferredEvent {
    target: MessageId,
    event: ServerEvent,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Tombstones {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl Tombstones {
    fn insert(&mut self, id: MessageId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }
}

pub struct Reconciler {
    actor_id: UserId,
    messages: MessageStore,
    reactions: ReactionStore,
    channels: ChannelStore,
    notifications: NotificationStore,
    pending_sends: HashMap<MessageId, OutgoingSend>,
    pending_edits: HashMap<MessageId, PendingEdit>,
    pending_removals: HashMap<MessageId, Message>,
    reactions_in_flight: HashSet<ReactionKey>,
    deferred: VecDeque<DeferredEvent>,
    deleted: Tombstones,
    defer_window: Duration,
    active_channel: Option<ChannelId>,
    navigation: u64,
}

impl Reconciler {
    pub fn new(
        actor_id: UserId,
        workspace_id: WorkspaceId,
        workspace_role: Role,
        is_guest: bool,
    ) -> Self {
        Self {
            channels: ChannelStore::new(actor_id.clone(), workspace_id, workspace_role, is_guest),
            actor_id,
            messages: MessageStore::new(),
            reactions: ReactionStore::new(),
            notifications: NotificationStore::new(),
            pending_sends: HashMap::new(),
            pending_edits: HashMap::new(),
            pending_removals: HashMap::new(),
            reactions_in_flight: HashSet::new(),
            deferred: VecDeque::new(),
            deleted: Tombstones::default(),
            defer_window: DEFAULT_DEFER_WINDOW,
            active_channel: None,
            navigation: 0,
        }
    }

    pub fn with_defer_window(mut self, defer_window: Duration) -> Self {
        self.defer_window = defer_window;
        self
    }

    pub fn actor_id(&self) -> &UserId {
        &self.actor_id
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn reactions(&self) -> &ReactionStore {
        &self.reactions
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active_channel.as_ref()
    }

    pub fn capabilities(&self, channel_id: &ChannelId) -> CapabilitySet {
        self.channels.capabilities(channel_id)
    }

    pub fn active_capabilities(&self) -> CapabilitySet {
        self.active_channel
            .as_ref()
            .map(|channel_id| self.capabilities(channel_id))
            .unwrap_or_else(CapabilitySet::none)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // ---- authorization -------------------------------------------------

    fn require(&self, channel_id: &ChannelId, capability: Capability) -> Result<(), SyncError> {
        if self.capabilities(channel_id).allows(capability) {
            Ok(())
        } else {
            Err(SyncError::NotPermitted {
                channel_id: channel_id.clone(),
                capability,
            })
        }
    }

    /// Text needs `Write`, an attachment needs `SendFiles`; a file-only
    /// message from a guest granted only file sending is allowed.
    pub fn authorize_send(
        &self,
        channel_id: &ChannelId,
        has_text: bool,
        has_attachment: bool,
    ) -> Result<(), SyncError> {
        if !has_text && !has_attachment {
            return Err(SyncError::EmptyMessage);
        }
        if has_text {
            self.require(channel_id, Capability::Write)?;
        }
        if has_attachment {
            self.require(channel_id, Capability::SendFiles)?;
        }
        Ok(())
    }

    fn confirmed_message(&self, message_id: &MessageId) -> Result<&Message, SyncError> {
        self.messages
            .get(message_id)
            .filter(|message| message.delivery == Delivery::Confirmed)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))
    }

    pub fn authorize_edit(&self, message_id: &MessageId) -> Result<(), SyncError> {
        let message = self.confirmed_message(message_id)?;
        let caps = self.capabilities(&message.channel_id);
        if caps.can_edit_message(message.author_id == self.actor_id) {
            Ok(())
        } else {
            Err(SyncError::NotPermitted {
                channel_id: message.channel_id.clone(),
                capability: Capability::EditOwnMessages,
            })
        }
    }

    pub fn authorize_remove(&self, message_id: &MessageId) -> Result<(), SyncError> {
        let message = self.confirmed_message(message_id)?;
        let is_author = message.author_id == self.actor_id;
        let caps = self.capabilities(&message.channel_id);
        if caps.can_delete_message(is_author) {
            Ok(())
        } else {
            Err(SyncError::NotPermitted {
                channel_id: message.channel_id.clone(),
                capability: if is_author {
                    Capability::DeleteOwnMessages
                } else {
                    Capability::Moderate
                },
            })
        }
    }

    pub fn authorize_react(&self, message_id: &MessageId) -> Result<(), SyncError> {
        let message = self.confirmed_message(message_id)?;
        self.require(&message.channel_id, Capability::React)
    }

    pub fn authorize_role_change(&self, channel_id: &ChannelId) -> Result<(), SyncError> {
        self.require(channel_id, Capability::ChangeRoles)
    }

    /// Must be called for every failed REST call. A 403 invalidates the
    /// role snapshot until the next permissions fetch lands.
    pub fn note_rest_failure(&mut self, err: &RestError) -> Vec<Change> {
        if err.is_authorization() && !self.channels.roles().is_stale() {
            warn!(error = %err, "reconcile: authorization failure, capability set is stale");
            self.channels.mark_stale();
            return vec![Change::Roles];
        }
        Vec::new()
    }

    // ---- navigation and fetch ------------------------------------------

    /// Switches the active channel. Outstanding fetch tickets become stale;
    /// in-flight sends are unaffected.
    pub fn select_channel(&mut self, channel_id: ChannelId) -> FetchTicket {
        self.navigation += 1;
        self.active_channel = Some(channel_id.clone());
        FetchTicket {
            channel_id,
            generation: self.navigation,
        }
    }

    /// A ticket for re-pulling the active channel without navigating.
    pub fn refetch_ticket(&self) -> Option<FetchTicket> {
        self.active_channel.as_ref().map(|channel_id| FetchTicket {
            channel_id: channel_id.clone(),
            generation: self.navigation,
        })
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.navigation
            && self.active_channel.as_ref() == Some(&ticket.channel_id)
    }

    /// Merges one fetched page. Returns `None` when the ticket is stale.
    pub fn complete_fetch(
        &mut self,
        ticket: &FetchTicket,
        page: Vec<MessagePayload>,
        now: Instant,
    ) -> Option<Vec<Change>> {
        if !self.is_current(ticket) {
            debug!(channel_id = %ticket.channel_id, "reconcile: discarding stale fetch result");
            return None;
        }

        let channel_id = ticket.channel_id.clone();
        let mut changes = Vec::new();
        let bounds = page
            .iter()
            .filter(|payload| payload.channel_id == channel_id)
            .map(|payload| payload.created_at)
            .fold(None, |bounds: Option<(DateTime<Utc>, DateTime<Utc>)>, at| {
                Some(match bounds {
                    Some((from, to)) => (from.min(at), to.max(at)),
                    None => (at, at),
                })
            });
        let returned: HashSet<MessageId> = page.iter().map(|payload| payload.id.clone()).collect();

        if let Some((from, to)) = bounds {
            for id in self.messages.confirmed_between(&channel_id, from, to) {
                if !returned.contains(&id) && !self.pending_edits.contains_key(&id) {
                    debug!(message_id = %id, "reconcile: pruning message missing from fetched page");
                    self.messages.remove(&id);
                    self.reactions.drop_message(&id);
                    push_unique(&mut changes, Change::Messages(channel_id.clone()));
                }
            }
        }

        for payload in page {
            if payload.channel_id != channel_id {
                warn!(
                    message_id = %payload.id,
                    channel_id = %payload.channel_id,
                    "reconcile: fetched message belongs to another channel"
                );
                continue;
            }
            let id = payload.id.clone();
            if self.messages.contains(&id) {
                self.apply_update(payload, &mut changes);
            } else {
                self.ingest_message(payload, now, &mut changes);
            }
        }
        Some(changes)
    }

    // ---- send protocol -------------------------------------------------

    /// Inserts a Pending entry at the tail of the channel and returns what
    /// must be POSTed.
    pub fn begin_send(
        &mut self,
        channel_id: ChannelId,
        text: Option<String>,
        attachment: Option<AttachmentRef>,
        now: DateTime<Utc>,
    ) -> Result<OutgoingSend, SyncError> {
        self.authorize_send(&channel_id, text.is_some(), attachment.is_some())?;

        let created_at = match self.messages.channel(&channel_id).last() {
            Some(last) if last.created_at >= now => last.created_at + chrono::Duration::milliseconds(1),
            _ => now,
        };
        let temp_id = MessageId::temporary();
        self.messages.insert(Message {
            id: temp_id.clone(),
            channel_id: channel_id.clone(),
            author_id: self.actor_id.clone(),
            text: text.clone(),
            attachment: attachment.clone(),
            created_at,
            edited_at: None,
            delivery: Delivery::Pending,
        });

        let send = OutgoingSend {
            temp_id: temp_id.clone(),
            channel_id,
            body: OutgoingMessage {
                client_id: temp_id.clone(),
                text,
                attachment,
            },
        };
        self.pending_sends.insert(temp_id, send.clone());
        Ok(send)
    }

    pub fn confirm_send(
        &mut self,
        temp_id: &MessageId,
        payload: MessagePayload,
        now: Instant,
    ) -> (SendOutcome, Vec<Change>) {
        self.pending_sends.remove(temp_id);
        let server_id = payload.id.clone();
        let channel_id = payload.channel_id.clone();
        let mut changes = vec![Change::Messages(channel_id.clone())];

        if self.deleted.contains(&server_id) {
            self.messages.remove(temp_id);
            info!(%temp_id, %server_id, "reconcile: send confirmed for an already deleted message");
            return (SendOutcome::Discarded(server_id), changes);
        }

        if self.messages.contains(&server_id) {
            self.messages.remove(temp_id);
            debug!(%temp_id, %server_id, "reconcile: push won the race, dropping temporary entry");
            self.apply_update(payload, &mut changes);
            return (SendOutcome::AlreadyDelivered(server_id), changes);
        }

        let confirmed = Message::confirmed(payload);
        if !self.messages.replace(temp_id, confirmed.clone()) {
            self.messages.insert(confirmed);
        }
        self.drain_deferred(&server_id, now, &mut changes);
        (SendOutcome::Confirmed(server_id), changes)
    }

    /// The entry stays visible with an error marker; nothing retries it
    /// automatically.
    pub fn fail_send(&mut self, temp_id: &MessageId, err: &RestError) -> Vec<Change> {
        let mut changes = self.note_rest_failure(err);
        let reason = if err.is_authorization() {
            "not permitted".to_string()
        } else {
            err.to_string()
        };
        let retryable = err.is_transient();
        let mut channel_id = None;
        self.messages.update(temp_id, |message| {
            message.delivery = Delivery::Failed { reason, retryable };
            channel_id = Some(message.channel_id.clone());
        });
        if let Some(channel_id) = channel_id {
            changes.push(Change::Messages(channel_id));
        }
        changes
    }

    /// Failed → Pending on explicit user action. Authorization is checked
    /// again because roles may have changed since the first attempt.
    pub fn retry_send(&mut self, temp_id: &MessageId) -> Result<OutgoingSend, SyncError> {
        let failed = self
            .messages
            .get(temp_id)
            .is_some_and(Message::is_failed);
        let send = self
            .pending_sends
            .get(temp_id)
            .filter(|_| failed)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPending(temp_id.clone()))?;
        self.authorize_send(
            &send.channel_id,
            send.body.text.is_some(),
            send.body.attachment.is_some(),
        )?;
        self.messages.update(temp_id, |message| {
            message.delivery = Delivery::Pending;
        });
        Ok(send)
    }

    pub fn discard_send(&mut self, temp_id: &MessageId) -> Result<ChannelId, SyncError> {
        let failed = self
            .messages
            .get(temp_id)
            .is_some_and(Message::is_failed);
        if !failed {
            return Err(SyncError::UnknownPending(temp_id.clone()));
        }
        self.pending_sends.remove(temp_id);
        let message = self
            .messages
            .remove(temp_id)
            .ok_or_else(|| SyncError::UnknownPending(temp_id.clone()))?;
        Ok(message.channel_id)
    }

    // ---- edit / remove -------------------------------------------------

    pub fn begin_edit(&mut self, message_id: &MessageId, text: String) -> Result<ChannelId, SyncError> {
        self.authorize_edit(message_id)?;
        let mut channel_id = None;
        let mut previous = None;
        self.messages.update(message_id, |message| {
            previous = Some(PendingEdit {
                previous_text: message.text.replace(text),
                base_version: message.version(),
            });
            channel_id = Some(message.channel_id.clone());
        });
        if let Some(previous) = previous {
            self.pending_edits.entry(message_id.clone()).or_insert(previous);
        }
        channel_id.ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))
    }

    pub fn confirm_edit(&mut self, payload: MessagePayload) -> Vec<Change> {
        let mut changes = Vec::new();
        let id = payload.id.clone();
        self.pending_edits.remove(&id);
        let Some(existing) = self.messages.get(&id) else {
            return changes;
        };
        if payload.version() < existing.version() {
            debug!(message_id = %id, "reconcile: edit confirmation older than stored version");
            return changes;
        }
        let channel_id = existing.channel_id.clone();
        self.messages.update(&id, |message| overwrite(message, payload));
        changes.push(Change::Messages(channel_id));
        changes
    }

    pub fn fail_edit(&mut self, message_id: &MessageId, err: &RestError) -> Vec<Change> {
        let mut changes = self.note_rest_failure(err);
        let Some(edit) = self.pending_edits.remove(message_id) else {
            return changes;
        };
        let mut channel_id = None;
        self.messages.update(message_id, |message| {
            if message.version() == edit.base_version {
                message.text = edit.previous_text;
                channel_id = Some(message.channel_id.clone());
            }
        });
        if let Some(channel_id) = channel_id {
            changes.push(Change::Messages(channel_id));
        }
        changes
    }

    pub fn begin_remove(&mut self, message_id: &MessageId) -> Result<ChannelId, SyncError> {
        self.authorize_remove(message_id)?;
        let message = self
            .messages
            .remove(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
        let channel_id = message.channel_id.clone();
        self.pending_removals.insert(message_id.clone(), message);
        Ok(channel_id)
    }

    pub fn confirm_remove(&mut self, message_id: &MessageId) -> Vec<Change> {
        let Some(message) = self.pending_removals.remove(message_id) else {
            return Vec::new();
        };
        self.deleted.insert(message_id.clone());
        self.pending_edits.remove(message_id);
        self.reactions.drop_message(message_id);
        vec![
            Change::Messages(message.channel_id),
            Change::Reactions(message_id.clone()),
        ]
    }

    pub fn fail_remove(&mut self, message_id: &MessageId, err: &RestError) -> Vec<Change> {
        if err.is_idempotent_success() {
            return self.confirm_remove(message_id);
        }
        let mut changes = self.note_rest_failure(err);
        let Some(message) = self.pending_removals.remove(message_id) else {
            return changes;
        };
        if self.deleted.contains(message_id) {
            return changes;
        }
        let channel_id = message.channel_id.clone();
        self.messages.insert(message);
        changes.push(Change::Messages(channel_id));
        changes
    }

    // ---- reactions -----------------------------------------------------

    pub fn begin_toggle(
        &mut self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ToggleIntent, SyncError> {
        let key = ReactionKey::new(message_id.clone(), self.actor_id.clone(), emoji);
        if self.reactions_in_flight.contains(&key) {
            return Err(SyncError::toggle_in_flight(&key));
        }
        self.authorize_react(message_id)?;

        let intent = match self.reactions.find(&key).cloned() {
            Some(existing) => {
                self.reactions.remove(&key);
                ToggleIntent::Remove { key, existing }
            }
            None => {
                let placeholder = ReactionPayload {
                    id: ReactionId::temporary(),
                    message_id: message_id.clone(),
                    user_id: self.actor_id.clone(),
                    emoji: emoji.to_string(),
                };
                self.reactions.insert(placeholder.clone());
                ToggleIntent::Add { key, placeholder }
            }
        };
        self.reactions_in_flight.insert(intent.key().clone());
        Ok(intent)
    }

    pub fn confirm_reaction_added(
        &mut self,
        intent: &ToggleIntent,
        reaction: ReactionPayload,
    ) -> Vec<Change> {
        let key = intent.key();
        self.reactions_in_flight.remove(key);
        if ReactionKey::of(&reaction) != *key {
            warn!(reaction_id = %reaction.id, "reconcile: reaction confirmation does not match toggle");
        }
        if self.deleted.contains(&key.message_id) {
            return Vec::new();
        }
        if !self.reactions.set_id(key, reaction.id.clone()) {
            self.reactions.insert(reaction);
        }
        vec![Change::Reactions(key.message_id.clone())]
    }

    pub fn confirm_reaction_removed(&mut self, intent: &ToggleIntent) -> Vec<Change> {
        let key = intent.key();
        self.reactions_in_flight.remove(key);
        self.reactions.remove(key);
        vec![Change::Reactions(key.message_id.clone())]
    }

    /// Conflict/NotFound mean the server already agrees with the toggle.
    pub fn fail_toggle(&mut self, intent: &ToggleIntent, err: &RestError) -> Vec<Change> {
        let key = intent.key().clone();
        self.reactions_in_flight.remove(&key);
        if err.is_idempotent_success() {
            debug!(emoji = %key.emoji, "reconcile: toggle already applied on server");
            return vec![Change::Reactions(key.message_id)];
        }
        let mut changes = self.note_rest_failure(err);
        match intent {
            ToggleIntent::Add { .. } => {
                let placeholder_only = self
                    .reactions
                    .find(&key)
                    .is_some_and(|reaction| reaction.id.is_temporary());
                if placeholder_only {
                    self.reactions.remove(&key);
                }
            }
            ToggleIntent::Remove { existing, .. } => {
                if !self.deleted.contains(&key.message_id) {
                    self.reactions.insert(existing.clone());
                }
            }
        }
        changes.push(Change::Reactions(key.message_id));
        changes
    }

    // ---- transport events ----------------------------------------------

    pub fn apply_event(&mut self, event: ServerEvent, now: Instant) -> Vec<Change> {
        let mut changes = Vec::new();
        match event {
            ServerEvent::NewMessage { message } => {
                self.ingest_message(message, now, &mut changes);
            }
            ServerEvent::MessageUpdated { message } => {
                let id = message.id.clone();
                if self.deleted.contains(&id) || self.pending_removals.contains_key(&id) {
                    debug!(message_id = %id, "reconcile: update for deleted message ignored");
                } else if self.messages.contains(&id) {
                    self.apply_update(message, &mut changes);
                } else {
                    self.defer(id, ServerEvent::MessageUpdated { message }, now);
                }
            }
            ServerEvent::MessageDeleted {
                channel_id,
                message_id,
            } => {
                if !self.apply_delete(&message_id, &mut changes) {
                    self.defer(
                        message_id.clone(),
                        ServerEvent::MessageDeleted {
                            channel_id,
                            message_id,
                        },
                        now,
                    );
                }
            }
            ServerEvent::ReactionAdded { reaction } => {
                if self.deleted.contains(&reaction.message_id) {
                    debug!(message_id = %reaction.message_id, "reconcile: reaction for deleted message ignored");
                } else {
                    let message_id = reaction.message_id.clone();
                    if self.reactions.insert(reaction) {
                        changes.push(Change::Reactions(message_id));
                    }
                }
            }
            ServerEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => {
                let key = ReactionKey::new(message_id, user_id, emoji);
                if self.reactions.remove(&key).is_some() {
                    changes.push(Change::Reactions(key.message_id));
                }
            }
            ServerEvent::RoomJoined { room } => {
                changes.push(Change::RoomAcknowledged(room));
            }
            ServerEvent::PermissionsUpdated { permissions } => {
                changes.extend(self.apply_permissions(permissions));
            }
            ServerEvent::ChannelUpdated { channel } => {
                changes.extend(self.upsert_channel(channel));
            }
            ServerEvent::NotificationCreated { notification } => {
                changes.extend(self.apply_notification(notification));
            }
            ServerEvent::NotificationRead { notification_id } => {
                changes.extend(self.mark_read(&notification_id));
            }
        }
        changes
    }

    /// Drops buffered edits/deletes whose target never arrived.
    pub fn expire_deferred(&mut self, now: Instant) -> usize {
        let before = self.deferred.len();
        self.deferred.retain(|deferred| {
            let keep = deferred.expires_at > now;
            if !keep {
                warn!(
                    message_id = %deferred.target,
                    event = deferred.event.name(),
                    "reconcile: dropping buffered event whose target never arrived"
                );
            }
            keep
        });
        before - self.deferred.len()
    }

    fn defer(&mut self, target: MessageId, event: ServerEvent, now: Instant) {
        debug!(message_id = %target, event = event.name(), "reconcile: buffering event for unknown message");
        self.deferred.push_back(DeferredEvent {
            target,
            event,
            expires_at: now + self.defer_window,
        });
    }

    fn drain_deferred(&mut self, id: &MessageId, now: Instant, changes: &mut Vec<Change>) {
        if self.deferred.is_empty() {
            return;
        }
        let (ready, rest): (VecDeque<_>, VecDeque<_>) = self
            .deferred
            .drain(..)
            .partition(|deferred| &deferred.target == id);
        self.deferred = rest;
        for deferred in ready {
            if deferred.expires_at <= now {
                warn!(message_id = %id, event = deferred.event.name(), "reconcile: buffered event expired");
                continue;
            }
            match deferred.event {
                ServerEvent::MessageUpdated { message } => self.apply_update(message, changes),
                ServerEvent::MessageDeleted { message_id, .. } => {
                    self.apply_delete(&message_id, changes);
                }
                other => debug!(event = other.name(), "reconcile: unexpected buffered event"),
            }
        }
    }

    fn ingest_message(&mut self, payload: MessagePayload, now: Instant, changes: &mut Vec<Change>) {
        let id = payload.id.clone();
        if self.deleted.contains(&id) || self.pending_removals.contains_key(&id) {
            debug!(message_id = %id, "reconcile: ignoring message that was deleted");
            return;
        }
        if self.messages.contains(&id) {
            debug!(message_id = %id, "reconcile: duplicate message ignored");
            return;
        }

        let channel_id = payload.channel_id.clone();
        let absorbed = payload
            .client_id
            .clone()
            .filter(|client_id| {
                payload.author_id == self.actor_id
                    && self
                        .messages
                        .get(client_id)
                        .is_some_and(|local| local.delivery != Delivery::Confirmed)
            });
        let message = Message::confirmed(payload);
        match absorbed {
            Some(temp_id) => {
                debug!(%temp_id, message_id = %id, "reconcile: push carries our temporary id");
                let was_failed = self.messages.get(&temp_id).is_some_and(Message::is_failed);
                self.messages.replace(&temp_id, message);
                if was_failed {
                    self.pending_sends.remove(&temp_id);
                }
            }
            None => {
                self.messages.insert(message);
            }
        }
        push_unique(changes, Change::Messages(channel_id));
        self.drain_deferred(&id, now, changes);
    }

    /// Applies a canonical representation only if strictly newer.
    fn apply_update(&mut self, payload: MessagePayload, changes: &mut Vec<Change>) {
        let id = payload.id.clone();
        let Some(existing) = self.messages.get(&id) else {
            return;
        };
        if payload.version() <= existing.version() {
            debug!(message_id = %id, "reconcile: dropping update that is not newer");
            return;
        }
        let channel_id = existing.channel_id.clone();
        self.pending_edits.remove(&id);
        self.messages.update(&id, |message| overwrite(message, payload));
        push_unique(changes, Change::Messages(channel_id));
    }

    /// Returns false when the target is unknown and the event should wait.
    fn apply_delete(&mut self, message_id: &MessageId, changes: &mut Vec<Change>) -> bool {
        if self.deleted.contains(message_id) {
            return true;
        }
        if self.pending_removals.contains_key(message_id) {
            self.deleted.insert(message_id.clone());
            return true;
        }
        let Some(message) = self.messages.remove(message_id) else {
            return false;
        };
        self.deleted.insert(message_id.clone());
        self.pending_edits.remove(message_id);
        if self.reactions.drop_message(message_id) > 0 {
            changes.push(Change::Reactions(message_id.clone()));
        }
        push_unique(changes, Change::Messages(message.channel_id));
        true
    }

    // ---- channels, roles, notifications --------------------------------

    pub fn apply_permissions(&mut self, permissions: MemberPermissions) -> Vec<Change> {
        let mut changes = vec![Change::Channels];
        if self.channels.apply_permissions(permissions) {
            info!(actor_id = %self.actor_id, "reconcile: role snapshot replaced");
            changes.push(Change::Roles);
        }
        changes
    }

    pub fn upsert_channel(&mut self, channel: ChannelPayload) -> Vec<Change> {
        let mut changes = vec![Change::Channels];
        if self.channels.upsert(channel) {
            changes.push(Change::Roles);
        }
        changes
    }

    pub fn replace_channels(&mut self, channels: Vec<ChannelPayload>) -> Vec<Change> {
        let mut changes = vec![Change::Channels];
        if self.channels.replace_all(channels) {
            changes.push(Change::Roles);
        }
        changes
    }

    pub fn apply_notification(&mut self, notification: NotificationPayload) -> Vec<Change> {
        if notification.recipient_id != self.actor_id {
            debug!(notification_id = %notification.id, "reconcile: notification for another recipient");
            return Vec::new();
        }
        if self.notifications.apply_incoming(notification) {
            vec![Change::Unread(self.notifications.unread_count())]
        } else {
            Vec::new()
        }
    }

    pub fn mark_read(&mut self, id: &NotificationId) -> Vec<Change> {
        if self.notifications.mark_read(id) {
            vec![Change::Unread(self.notifications.unread_count())]
        } else {
            Vec::new()
        }
    }

    pub fn replace_notifications(&mut self, notifications: Vec<NotificationPayload>) -> Vec<Change> {
        self.notifications.replace_all(notifications);
        vec![Change::Unread(self.notifications.unread_count())]
    }
}

fn overwrite(message: &mut Message, payload: MessagePayload) {
    message.text = payload.text;
    message.attachment = payload.attachment;
    message.edited_at = payload.edited_at;
    message.delivery = Delivery::Confirmed;
}

fn push_unique(changes: &mut Vec<Change>, change: Change) {
    if !changes.contains(&change) {
        changes.push(change);
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
