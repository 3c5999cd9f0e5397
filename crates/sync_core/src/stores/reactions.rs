use std::collections::HashMap;

use shared::{
    domain::{MessageId, ReactionId, UserId},
    protocol::ReactionPayload,
};

/// Identity of a reaction: one per user per emoji per message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReactionKey {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

impl ReactionKey {
    pub fn new(message_id: MessageId, user_id: UserId, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
        }
    }

    pub fn of(reaction: &ReactionPayload) -> Self {
        Self::new(
            reaction.message_id.clone(),
            reaction.user_id.clone(),
            reaction.emoji.clone(),
        )
    }

    fn matches(&self, reaction: &ReactionPayload) -> bool {
        reaction.message_id == self.message_id
            && reaction.user_id == self.user_id
            && reaction.emoji == self.emoji
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_actor: bool,
}

#[derive(Debug, Default)]
pub struct ReactionStore {
    by_message: HashMap<MessageId, Vec<ReactionPayload>>,
}

impl ReactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &ReactionKey) -> Option<&ReactionPayload> {
        self.by_message
            .get(&key.message_id)?
            .iter()
            .find(|reaction| key.matches(reaction))
    }

    pub fn for_message(&self, message_id: &MessageId) -> &[ReactionPayload] {
        self.by_message
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Inserts by identity. An existing entry is kept, but a client
    /// placeholder id is upgraded to the server id. Returns true only when a
    /// new reaction was added.
    pub fn insert(&mut self, reaction: ReactionPayload) -> bool {
        let key = ReactionKey::of(&reaction);
        let reactions = self.by_message.entry(key.message_id.clone()).or_default();
        match reactions.iter_mut().find(|existing| key.matches(existing)) {
            Some(existing) => {
                if existing.id.is_temporary() && !reaction.id.is_temporary() {
                    existing.id = reaction.id;
                }
                false
            }
            None => {
                reactions.push(reaction);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &ReactionKey) -> Option<ReactionPayload> {
        let reactions = self.by_message.get_mut(&key.message_id)?;
        let position = reactions.iter().position(|reaction| key.matches(reaction))?;
        let removed = reactions.remove(position);
        if reactions.is_empty() {
            self.by_message.remove(&key.message_id);
        }
        Some(removed)
    }

    pub fn set_id(&mut self, key: &ReactionKey, id: ReactionId) -> bool {
        let Some(reactions) = self.by_message.get_mut(&key.message_id) else {
            return false;
        };
        match reactions.iter_mut().find(|reaction| key.matches(reaction)) {
            Some(reaction) => {
                reaction.id = id;
                true
            }
            None => false,
        }
    }

    pub fn drop_message(&mut self, message_id: &MessageId) -> usize {
        self.by_message
            .remove(message_id)
            .map(|reactions| reactions.len())
            .unwrap_or(0)
    }

    pub fn count(&self, key: &ReactionKey) -> usize {
        self.for_message(&key.message_id)
            .iter()
            .filter(|reaction| key.matches(reaction))
            .count()
    }

    /// Per-emoji totals in first-reacted order.
    pub fn summarize(&self, message_id: &MessageId, actor: &UserId) -> Vec<ReactionSummary> {
        let mut summaries: Vec<ReactionSummary> = Vec::new();
        for reaction in self.for_message(message_id) {
            let mine = &reaction.user_id == actor;
            match summaries
                .iter_mut()
                .find(|summary| summary.emoji == reaction.emoji)
            {
                Some(summary) => {
                    summary.count += 1;
                    summary.reacted_by_actor |= mine;
                }
                None => summaries.push(ReactionSummary {
                    emoji: reaction.emoji.clone(),
                    count: 1,
                    reacted_by_actor: mine,
                }),
            }
        }
        summaries
    }
}
