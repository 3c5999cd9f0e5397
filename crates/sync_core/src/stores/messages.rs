use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{AttachmentRef, MessagePayload},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed { reason: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub text: Option<String>,
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub delivery: Delivery,
}

impl Message {
    pub fn confirmed(payload: MessagePayload) -> Self {
        Self {
            id: payload.id,
            channel_id: payload.channel_id,
            author_id: payload.author_id,
            text: payload.text,
            attachment: payload.attachment,
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn version(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.created_at)
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }

    fn order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Per-channel sequences ordered by `(created_at, id)` with at most one entry
/// per id across the whole store.
#[derive(Debug, Default)]
pub struct MessageStore {
    channels: HashMap<ChannelId, Vec<Message>>,
    locations: HashMap<MessageId, ChannelId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.locations.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        let channel_id = self.locations.get(id)?;
        self.channels
            .get(channel_id)?
            .iter()
            .find(|message| &message.id == id)
    }

    pub fn channel(&self, channel_id: &ChannelId) -> &[Message] {
        self.channels
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns false when the id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.locations
            .insert(message.id.clone(), message.channel_id.clone());
        let sequence = self.channels.entry(message.channel_id.clone()).or_default();
        let position = sequence
            .binary_search_by(|probe| probe.order(&message))
            .unwrap_or_else(|position| position);
        sequence.insert(position, message);
        true
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let channel_id = self.locations.remove(id)?;
        let sequence = self.channels.get_mut(&channel_id)?;
        let position = sequence.iter().position(|message| &message.id == id)?;
        Some(sequence.remove(position))
    }

    /// Mutates one entry in place. The id and channel must not change.
    pub fn update(&mut self, id: &MessageId, apply: impl FnOnce(&mut Message)) -> bool {
        let Some(channel_id) = self.locations.get(id) else {
            return false;
        };
        let Some(sequence) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let Some(message) = sequence.iter_mut().find(|message| &message.id == id) else {
            return false;
        };
        apply(message);
        debug_assert_eq!(&message.id, id);
        sequence.sort_by(Message::order);
        true
    }

    /// Swaps the entry stored under `old_id` for `message`, keeping order.
    pub fn replace(&mut self, old_id: &MessageId, message: Message) -> bool {
        if self.remove(old_id).is_none() {
            return false;
        }
        self.insert(message)
    }

    /// Confirmed ids of a channel with `from <= created_at <= to`.
    pub fn confirmed_between(
        &self,
        channel_id: &ChannelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<MessageId> {
        self.channel(channel_id)
            .iter()
            .filter(|message| message.delivery == Delivery::Confirmed)
            .filter(|message| message.created_at >= from && message.created_at <= to)
            .map(|message| message.id.clone())
            .collect()
    }

    pub fn len(&self, channel_id: &ChannelId) -> usize {
        self.channel(channel_id).len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
