use std::collections::{HashSet, VecDeque};

use shared::{domain::NotificationId, protocol::NotificationPayload};

/// Newest-first notification list with an incrementally maintained unread
/// counter. The counter always equals `recount()`.
#[derive(Debug, Default)]
pub struct NotificationStore {
    items: VecDeque<NotificationPayload>,
    ids: HashSet<NotificationId>,
    unread: usize,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn recount(&self) -> usize {
        self.items.iter().filter(|item| !item.read).count()
    }

    pub fn items(&self) -> impl Iterator<Item = &NotificationPayload> {
        self.items.iter()
    }

    pub fn get(&self, id: &NotificationId) -> Option<&NotificationPayload> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Duplicate ids are ignored. Returns true when the unread count changed.
    pub fn apply_incoming(&mut self, notification: NotificationPayload) -> bool {
        if !self.ids.insert(notification.id.clone()) {
            return false;
        }
        let unread = !notification.read;
        self.items.push_front(notification);
        if unread {
            self.unread += 1;
        }
        self.check();
        unread
    }

    /// Decrements at most once per item. Returns true when this call flipped
    /// the item to read.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| &item.id == id) else {
            return false;
        };
        if item.read {
            return false;
        }
        item.read = true;
        self.unread -= 1;
        self.check();
        true
    }

    /// Replaces the list with a server snapshot. Items already read locally
    /// stay read.
    pub fn replace_all(&mut self, mut notifications: Vec<NotificationPayload>) {
        let read_locally: HashSet<NotificationId> = self
            .items
            .iter()
            .filter(|item| item.read)
            .map(|item| item.id.clone())
            .collect();

        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.items.clear();
        self.ids.clear();
        for mut notification in notifications {
            if !self.ids.insert(notification.id.clone()) {
                continue;
            }
            if read_locally.contains(&notification.id) {
                notification.read = true;
            }
            self.items.push_back(notification);
        }
        self.unread = self.recount();
    }

    fn check(&self) {
        debug_assert_eq!(self.unread, self.recount(), "unread counter diverged");
    }
}

#[cfg(test)]
#[path = "../tests/notifications_tests.rs"]
mod tests;
