use super::*;
use chrono::DateTime;
use shared::{domain::UserId, domain::NotificationKind};

fn notification(id: &str, read: bool, seconds: i64) -> NotificationPayload {
    NotificationPayload {
        id: NotificationId::from(id),
        recipient_id: UserId::from("me"),
        kind: NotificationKind::Mention,
        payload_ref: Some(format!("message:{id}")),
        read,
        created_at: DateTime::from_timestamp(seconds, 0).expect("timestamp"),
    }
}

#[test]
fn incoming_unread_increments_and_prepends() {
    let mut store = NotificationStore::new();
    assert!(store.apply_incoming(notification("n-1", false, 1)));
    assert!(store.apply_incoming(notification("n-2", false, 2)));
    assert_eq!(store.unread_count(), 2);
    let ids: Vec<_> = store.items().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["n-2", "n-1"]);
}

#[test]
fn duplicate_incoming_is_ignored() {
    let mut store = NotificationStore::new();
    store.apply_incoming(notification("n-1", false, 1));
    assert!(!store.apply_incoming(notification("n-1", false, 1)));
    assert_eq!(store.unread_count(), 1);
    assert_eq!(store.items().count(), 1);
}

#[test]
fn incoming_read_item_does_not_count() {
    let mut store = NotificationStore::new();
    assert!(!store.apply_incoming(notification("n-1", true, 1)));
    assert_eq!(store.unread_count(), 0);
}

#[test]
fn mark_read_twice_equals_once() {
    let mut once = NotificationStore::new();
    let mut twice = NotificationStore::new();
    for store in [&mut once, &mut twice] {
        store.apply_incoming(notification("n-1", false, 1));
        store.apply_incoming(notification("n-2", false, 2));
    }

    once.mark_read(&NotificationId::from("n-1"));
    assert!(twice.mark_read(&NotificationId::from("n-1")));
    assert!(!twice.mark_read(&NotificationId::from("n-1")));

    assert_eq!(once.unread_count(), twice.unread_count());
    assert_eq!(twice.unread_count(), 1);
}

#[test]
fn mark_read_of_unknown_id_changes_nothing() {
    let mut store = NotificationStore::new();
    store.apply_incoming(notification("n-1", false, 1));
    assert!(!store.mark_read(&NotificationId::from("n-404")));
    assert_eq!(store.unread_count(), 1);
}

#[test]
fn replace_all_keeps_local_reads_monotonic() {
    let mut store = NotificationStore::new();
    store.apply_incoming(notification("n-1", false, 1));
    store.mark_read(&NotificationId::from("n-1"));

    store.replace_all(vec![
        notification("n-1", false, 1),
        notification("n-3", false, 3),
        notification("n-2", true, 2),
    ]);

    assert_eq!(store.unread_count(), 1);
    assert_eq!(store.unread_count(), store.recount());
    let ids: Vec<_> = store.items().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["n-3", "n-2", "n-1"]);
    assert!(store.get(&NotificationId::from("n-1")).is_some_and(|item| item.read));
}

#[test]
fn incremental_counter_matches_recount_over_mixed_sequence() {
    let mut store = NotificationStore::new();
    let steps: [(&str, bool); 8] = [
        ("n-1", true),
        ("n-2", true),
        ("n-1", false),
        ("n-3", true),
        ("n-1", false),
        ("n-2", true),
        ("n-3", false),
        ("n-4", true),
    ];
    for (index, (id, incoming)) in steps.into_iter().enumerate() {
        if incoming {
            store.apply_incoming(notification(id, false, index as i64));
        } else {
            store.mark_read(&NotificationId::from(id));
        }
        assert_eq!(store.unread_count(), store.recount(), "step {index}");
    }
    assert_eq!(store.unread_count(), 2);
}
