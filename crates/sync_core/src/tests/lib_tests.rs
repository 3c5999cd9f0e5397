use super::*;

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use chrono::DateTime;
use shared::{
    domain::{NotificationKind, ReactionId, Visibility},
    protocol::{
        ChannelAccess, ChannelMember, ClientCommand, MemberPermissions, MessagePayload,
        OutgoingMessage, PermissionUpdate, ReactionPayload,
    },
};
use tokio::{sync::Notify, time::timeout};

use crate::stores::Delivery;

const WAIT: Duration = Duration::from_secs(5);

fn channel() -> ChannelId {
    ChannelId::from("c-1")
}

fn server_message(id: &str, author: &str, text: &str) -> MessagePayload {
    server_message_at(id, author, text, 1_700_000_000)
}

fn server_message_at(id: &str, author: &str, text: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        channel_id: channel(),
        author_id: UserId::from(author),
        text: Some(text.to_string()),
        attachment: None,
        created_at: DateTime::from_timestamp(seconds, 0).expect("timestamp"),
        edited_at: None,
        client_id: None,
    }
}

fn member_permissions() -> MemberPermissions {
    MemberPermissions {
        workspace_id: WorkspaceId::from("w-1"),
        user_id: UserId::from("me"),
        workspace_role: Role::Member,
        is_guest: false,
        channels: Vec::new(),
    }
}

#[derive(Default)]
struct FakeApi {
    calls: Mutex<Vec<String>>,
    send_failures: Mutex<VecDeque<RestError>>,
    hold_sends: bool,
    release_send: Notify,
    pages: Mutex<HashMap<ChannelId, Vec<MessagePayload>>>,
    older_pages: Mutex<HashMap<MessageId, Vec<MessagePayload>>>,
    updates: Mutex<Vec<PermissionUpdate>>,
    permissions: Mutex<Option<MemberPermissions>>,
}

impl FakeApi {
    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    async fn called(&self, call: &str) -> bool {
        self.calls.lock().await.iter().any(|seen| seen == call)
    }

    async fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|seen| seen.as_str() == call)
            .count()
    }
}

#[async_trait]
impl SyncApi for FakeApi {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        query: &PageQuery,
    ) -> Result<Vec<MessagePayload>, RestError> {
        if let Some(before) = &query.before {
            self.record(format!("fetch_messages:{channel_id}:before:{before}")).await;
            return Ok(self
                .older_pages
                .lock()
                .await
                .get(before)
                .cloned()
                .unwrap_or_default());
        }
        self.record(format!("fetch_messages:{channel_id}")).await;
        Ok(self
            .pages
            .lock()
            .await
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &OutgoingMessage,
    ) -> Result<MessagePayload, RestError> {
        self.record("send_message".into()).await;
        if self.hold_sends {
            self.release_send.notified().await;
        }
        if let Some(err) = self.send_failures.lock().await.pop_front() {
            return Err(err);
        }
        Ok(MessagePayload {
            channel_id: channel_id.clone(),
            text: body.text.clone(),
            ..server_message("m-42", "me", "")
        })
    }

    async fn edit_message(
        &self,
        message_id: &MessageId,
        text: &str,
    ) -> Result<MessagePayload, RestError> {
        self.record(format!("edit_message:{message_id}")).await;
        Ok(MessagePayload {
            edited_at: Some(DateTime::from_timestamp(1_700_000_100, 0).expect("timestamp")),
            ..server_message(message_id.as_str(), "me", text)
        })
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), RestError> {
        self.record(format!("delete_message:{message_id}")).await;
        Ok(())
    }

    async fn add_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionPayload, RestError> {
        self.record(format!("add_reaction:{emoji}")).await;
        Ok(ReactionPayload {
            id: ReactionId::from("r-1"),
            message_id: message_id.clone(),
            user_id: UserId::from("me"),
            emoji: emoji.to_string(),
        })
    }

    async fn remove_reaction(&self, reaction: &ReactionPayload) -> Result<(), RestError> {
        self.record(format!("remove_reaction:{}", reaction.id)).await;
        Ok(())
    }

    async fn fetch_permissions(
        &self,
        _workspace_id: &WorkspaceId,
    ) -> Result<MemberPermissions, RestError> {
        self.record("fetch_permissions".into()).await;
        Ok(self
            .permissions
            .lock()
            .await
            .clone()
            .unwrap_or_else(member_permissions))
    }

    async fn update_permissions(
        &self,
        _workspace_id: &WorkspaceId,
        update: &PermissionUpdate,
    ) -> Result<MemberPermissions, RestError> {
        self.record(format!("update_permissions:{}", update.user_id)).await;
        self.updates.lock().await.push(update.clone());
        Ok(MemberPermissions {
            user_id: update.user_id.clone(),
            ..member_permissions()
        })
    }

    async fn list_channels(
        &self,
        _workspace_id: &WorkspaceId,
    ) -> Result<Vec<ChannelPayload>, RestError> {
        self.record("list_channels".into()).await;
        Ok(Vec::new())
    }

    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, RestError> {
        self.record("list_notifications".into()).await;
        Ok(Vec::new())
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> Result<(), RestError> {
        self.record(format!("mark_read:{id}")).await;
        Ok(())
    }
}

struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    commands: Mutex<Vec<ClientCommand>>,
}

impl FakeTransport {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            commands: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: ServerEvent) {
        let _ = self.events.send(TransportEvent::Event(event));
    }
}

#[async_trait]
impl EventTransport for FakeTransport {
    async fn join_room(&self, room: RoomId) {
        self.commands.lock().await.push(ClientCommand::JoinRoom { room });
    }

    async fn leave_room(&self, room: RoomId) {
        self.commands.lock().await.push(ClientCommand::LeaveRoom { room });
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

struct Harness {
    client: Arc<SyncClient>,
    api: Arc<FakeApi>,
    transport: Arc<FakeTransport>,
    events: broadcast::Receiver<ClientEvent>,
    pump: JoinHandle<()>,
}

impl Harness {
    async fn new(role: Role, is_guest: bool, api: FakeApi) -> Self {
        let api = Arc::new(api);
        let transport = Arc::new(FakeTransport::new());
        let client = SyncClient::new(
            Session {
                actor_id: UserId::from("me"),
                workspace_id: WorkspaceId::from("w-1"),
                workspace_role: role,
                is_guest,
                bearer_token: "token".into(),
            },
            SyncSettings::default(),
            api.clone(),
            transport.clone(),
        );
        let events = client.subscribe_events();
        let pump = client.start().await;
        Self {
            client,
            api,
            transport,
            events,
            pump,
        }
    }

    async fn member() -> Self {
        Self::new(Role::Member, false, FakeApi::default()).await
    }

    async fn wait_for(&mut self, predicate: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) => {}
                    Err(err) => panic!("event feed failed: {err}"),
                }
            }
        })
        .await
        .expect("event in time")
    }

    /// Waits until every transport event pushed so far has been applied.
    async fn flush(&mut self) {
        let marker = RoomId::Workspace(WorkspaceId::from("flush"));
        self.transport.push(ServerEvent::RoomJoined {
            room: marker.clone(),
        });
        self.wait_for(|event| event == &ClientEvent::RoomJoined(marker.clone()))
            .await;
    }

    async fn ids(&self) -> Vec<String> {
        self.client
            .messages(&channel())
            .await
            .into_iter()
            .map(|message| message.id.to_string())
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[tokio::test]
async fn rest_confirmation_then_push_keeps_one_entry() {
    let mut harness = Harness::member().await;

    let handle = harness
        .client
        .send(channel(), Some("hello".into()), None)
        .await
        .expect("send");
    assert!(handle.temp_id.is_temporary());
    assert_eq!(
        handle.outcome().await.expect("outcome"),
        SendOutcome::Confirmed(MessageId::from("m-42"))
    );

    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-42", "me", "hello"),
    });
    harness.flush().await;

    assert_eq!(harness.ids().await, vec!["m-42"]);
}

#[tokio::test]
async fn push_before_rest_confirmation_keeps_one_entry() {
    let api = FakeApi {
        hold_sends: true,
        ..FakeApi::default()
    };
    let mut harness = Harness::new(Role::Member, false, api).await;

    let handle = harness
        .client
        .send(channel(), Some("hello".into()), None)
        .await
        .expect("send");
    let pending = harness.client.messages(&channel()).await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_pending());

    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-42", "me", "hello"),
    });
    harness.flush().await;
    harness.api.release_send.notify_one();

    assert_eq!(
        handle.outcome().await.expect("outcome"),
        SendOutcome::AlreadyDelivered(MessageId::from("m-42"))
    );
    assert_eq!(harness.ids().await, vec!["m-42"]);
}

#[tokio::test]
async fn offline_send_is_retried_into_single_confirmed_message() {
    let api = FakeApi::default();
    api.send_failures
        .lock()
        .await
        .push_back(RestError::Transport("network unreachable".into()));
    let mut harness = Harness::new(Role::Member, false, api).await;

    let handle = harness
        .client
        .send(channel(), Some("hello".into()), None)
        .await
        .expect("send");
    let temp_id = handle.temp_id.clone();
    assert!(matches!(
        handle.outcome().await,
        Err(SyncError::Rest(RestError::Transport(_)))
    ));
    let failed = harness.client.messages(&channel()).await;
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0].delivery,
        Delivery::Failed {
            retryable: true,
            ..
        }
    ));

    let retry = harness.client.retry(&temp_id).await.expect("retry");
    assert_eq!(
        retry.outcome().await.expect("outcome"),
        SendOutcome::Confirmed(MessageId::from("m-42"))
    );
    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-42", "me", "hello"),
    });
    harness.flush().await;

    let messages = harness.client.messages(&channel()).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "m-42");
    assert_eq!(messages[0].delivery, Delivery::Confirmed);
    assert_eq!(harness.api.count("send_message").await, 2);
}

#[tokio::test]
async fn guest_send_is_rejected_without_rest_call() {
    let harness = Harness::new(Role::Guest, true, FakeApi::default()).await;

    let err = harness
        .client
        .send(channel(), Some("hi".into()), None)
        .await
        .err()
        .expect("guest send must fail");

    assert!(matches!(err, SyncError::NotPermitted { .. }));
    assert!(harness.client.messages(&channel()).await.is_empty());
    assert!(!harness.api.called("send_message").await);
}

#[tokio::test]
async fn forbidden_send_refetches_permissions() {
    let api = FakeApi::default();
    api.send_failures
        .lock()
        .await
        .push_back(RestError::Forbidden("demoted".into()));
    let grants = GuestGrants {
        can_react: true,
        ..GuestGrants::default()
    };
    *api.permissions.lock().await = Some(MemberPermissions {
        channels: vec![ChannelAccess {
            channel_id: channel(),
            role_override: Some(Role::Guest),
            guest_grants: grants,
        }],
        ..member_permissions()
    });
    let mut harness = Harness::new(Role::Member, false, api).await;
    harness.client.select_channel(channel()).await.expect("select");
    assert!(harness.client.capabilities().await.can_write);

    let handle = harness
        .client
        .send(channel(), Some("hello".into()), None)
        .await
        .expect("send");
    assert!(handle.outcome().await.is_err());

    let expected = CapabilitySet::guest(grants);
    harness
        .wait_for(|event| event == &ClientEvent::CapabilitiesChanged(expected))
        .await;
    assert!(harness.api.called("fetch_permissions").await);
    assert!(!harness.client.capabilities().await.can_write);
    assert!(harness.client.capabilities().await.can_react);
}

#[tokio::test]
async fn member_promoted_to_admin_gains_capabilities_immediately() {
    let mut harness = Harness::member().await;
    harness.client.select_channel(channel()).await.expect("select");
    let mut capabilities = harness.client.watch_capabilities();
    assert!(!capabilities.borrow_and_update().can_change_roles);

    harness.transport.push(ServerEvent::PermissionsUpdated {
        permissions: MemberPermissions {
            workspace_role: Role::Admin,
            ..member_permissions()
        },
    });
    harness.flush().await;

    assert!(capabilities.has_changed().expect("watch open"));
    assert_eq!(*capabilities.borrow(), CapabilitySet::full());
    harness
        .client
        .change_member_role(&channel(), &UserId::from("bob"), Some(Role::Admin), None)
        .await
        .expect("admin may change roles");
    assert!(harness.api.called("update_permissions:bob").await);
}

#[tokio::test]
async fn member_cannot_change_roles() {
    let harness = Harness::member().await;
    let err = harness
        .client
        .change_member_role(&channel(), &UserId::from("bob"), Some(Role::Admin), None)
        .await
        .expect_err("members cannot change roles");
    assert!(matches!(err, SyncError::NotPermitted { .. }));
    assert!(!harness.api.called("update_permissions:bob").await);
}

#[tokio::test]
async fn reconnect_refetches_active_channel_and_state() {
    let mut harness = Harness::member().await;
    harness.client.select_channel(channel()).await.expect("select");
    assert!(harness.ids().await.is_empty());

    harness
        .api
        .pages
        .lock()
        .await
        .insert(channel(), vec![server_message("m-7", "bob", "while you were away")]);
    let _ = harness
        .transport
        .events
        .send(TransportEvent::Connected { resumed: true });

    harness
        .wait_for(|event| event == &ClientEvent::MessagesChanged { channel_id: channel() })
        .await;
    assert_eq!(harness.ids().await, vec!["m-7"]);
    assert!(harness.api.called("fetch_permissions").await);
    assert!(harness.api.called("list_channels").await);
    assert!(harness.api.called("list_notifications").await);
}

#[tokio::test]
async fn navigation_moves_channel_room_subscription() {
    let harness = Harness::member().await;
    harness.client.select_channel(channel()).await.expect("select");
    harness
        .client
        .select_channel(ChannelId::from("c-2"))
        .await
        .expect("select");

    assert_eq!(
        *harness.transport.commands.lock().await,
        vec![
            ClientCommand::JoinRoom {
                room: RoomId::Workspace(WorkspaceId::from("w-1"))
            },
            ClientCommand::JoinRoom {
                room: RoomId::Channel(channel())
            },
            ClientCommand::LeaveRoom {
                room: RoomId::Channel(channel())
            },
            ClientCommand::JoinRoom {
                room: RoomId::Channel(ChannelId::from("c-2"))
            },
        ]
    );
    assert_eq!(harness.client.active_channel().await, Some(ChannelId::from("c-2")));
}

#[tokio::test]
async fn unread_counter_tracks_pushes_and_local_reads() {
    let mut harness = Harness::member().await;
    let mut unread = harness.client.watch_unread();

    harness.transport.push(ServerEvent::NotificationCreated {
        notification: NotificationPayload {
            id: NotificationId::from("n-1"),
            recipient_id: UserId::from("me"),
            kind: NotificationKind::Mention,
            payload_ref: Some("m-1".into()),
            read: false,
            created_at: DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
        },
    });
    harness.wait_for(|event| event == &ClientEvent::UnreadChanged(1)).await;
    assert_eq!(*unread.borrow_and_update(), 1);

    let id = NotificationId::from("n-1");
    harness.client.mark_read(&id).await.expect("mark read");
    harness.client.mark_read(&id).await.expect("mark read again");

    assert_eq!(*unread.borrow(), 0);
    assert_eq!(harness.client.unread_count().await, 0);
    assert_eq!(harness.api.count("mark_read:n-1").await, 1);
}

#[tokio::test]
async fn reaction_toggle_round_trip_stays_unique() {
    let mut harness = Harness::member().await;
    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-1", "bob", "hello"),
    });
    harness.flush().await;
    let message_id = MessageId::from("m-1");

    harness.client.react(&message_id, "tada").await.expect("add");
    harness.transport.push(ServerEvent::ReactionAdded {
        reaction: ReactionPayload {
            id: ReactionId::from("r-1"),
            message_id: message_id.clone(),
            user_id: UserId::from("me"),
            emoji: "tada".into(),
        },
    });
    harness.flush().await;

    let summary = harness.client.reactions(&message_id).await;
    assert_eq!(
        summary,
        vec![ReactionSummary {
            emoji: "tada".into(),
            count: 1,
            reacted_by_actor: true,
        }]
    );

    harness.client.react(&message_id, "tada").await.expect("remove");
    assert!(harness.client.reactions(&message_id).await.is_empty());
    assert!(harness.api.called("remove_reaction:r-1").await);
}

#[tokio::test]
async fn edit_and_remove_go_through_rest() {
    let mut harness = Harness::member().await;
    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-1", "me", "draft"),
    });
    harness.flush().await;
    let message_id = MessageId::from("m-1");

    harness
        .client
        .edit(&message_id, "final".into())
        .await
        .expect("edit");
    let messages = harness.client.messages(&channel()).await;
    assert_eq!(messages[0].text.as_deref(), Some("final"));
    assert!(messages[0].edited_at.is_some());

    harness.client.remove(&message_id).await.expect("remove");
    assert!(harness.ids().await.is_empty());

    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-1", "me", "draft"),
    });
    harness.flush().await;
    assert!(harness.ids().await.is_empty());
}

#[tokio::test]
async fn event_stream_yields_client_events() {
    use tokio_stream::StreamExt as _;

    let harness = Harness::member().await;
    let mut stream = harness.client.event_stream();
    harness.transport.push(ServerEvent::NewMessage {
        message: server_message("m-1", "bob", "hello"),
    });

    let event = timeout(WAIT, stream.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(event, ClientEvent::MessagesChanged { channel_id: channel() });
}

#[tokio::test]
async fn send_to_active_requires_a_selected_channel() {
    let harness = Harness::member().await;
    assert!(matches!(
        harness.client.send_to_active("hi".into()).await.err(),
        Some(SyncError::NoActiveChannel)
    ));
}

#[tokio::test]
async fn role_change_keeps_member_guest_grants() {
    let mut harness = Harness::new(Role::Admin, false, FakeApi::default()).await;
    let grants = GuestGrants {
        can_react: true,
        ..GuestGrants::default()
    };
    harness.transport.push(ServerEvent::ChannelUpdated {
        channel: ChannelPayload {
            id: channel(),
            workspace_id: WorkspaceId::from("w-1"),
            name: "general".into(),
            description: String::new(),
            visibility: Visibility::Public,
            members: vec![ChannelMember {
                user_id: UserId::from("visitor"),
                workspace_role: Role::Guest,
                channel_role: None,
                is_guest: true,
                guest_grants: grants,
            }],
        },
    });
    harness.flush().await;

    harness
        .client
        .change_member_role(&channel(), &UserId::from("visitor"), Some(Role::Member), None)
        .await
        .expect("admin may change roles");

    let updates = harness.api.updates.lock().await;
    assert_eq!(
        *updates,
        vec![PermissionUpdate {
            user_id: UserId::from("visitor"),
            channel_id: channel(),
            role_override: Some(Role::Member),
            guest_grants: Some(grants),
        }]
    );
}

#[tokio::test]
async fn load_older_pages_before_oldest_confirmed_message() {
    let api = FakeApi::default();
    api.pages.lock().await.insert(
        channel(),
        vec![
            server_message_at("m-10", "bob", "ten", 1_700_000_010),
            server_message_at("m-11", "bob", "eleven", 1_700_000_011),
        ],
    );
    api.older_pages.lock().await.insert(
        MessageId::from("m-10"),
        vec![
            server_message_at("m-8", "bob", "eight", 1_700_000_008),
            server_message_at("m-9", "bob", "nine", 1_700_000_009),
        ],
    );
    let harness = Harness::new(Role::Member, false, api).await;
    harness.client.select_channel(channel()).await.expect("select");

    assert!(harness.client.load_older().await.expect("older page"));
    assert_eq!(harness.ids().await, vec!["m-8", "m-9", "m-10", "m-11"]);
    assert!(harness.api.called("fetch_messages:c-1:before:m-10").await);

    assert!(!harness.client.load_older().await.expect("history exhausted"));
    assert!(harness.api.called("fetch_messages:c-1:before:m-8").await);
    assert_eq!(harness.ids().await.len(), 4);
}

#[tokio::test]
async fn load_older_requires_a_selected_channel() {
    let harness = Harness::member().await;
    assert!(matches!(
        harness.client.load_older().await,
        Err(SyncError::NoActiveChannel)
    ));
}
