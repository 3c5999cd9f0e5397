use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    protocol::{ClientCommand, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::TransportError, rooms::RoomTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Room joins for the session have been transmitted. `resumed` is true
    /// for every connection after the first.
    Connected { resumed: bool },
    Disconnected { reason: String },
    Event(ServerEvent),
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn join_room(&self, room: RoomId);
    async fn leave_room(&self, room: RoomId);
    async fn is_connected(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Default)]
struct LinkState {
    rooms: RoomTracker,
    outbound: Option<mpsc::UnboundedSender<ClientCommand>>,
}

impl LinkState {
    fn transmit(&self, command: ClientCommand) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if outbound.send(command).is_err() {
            debug!("transport: session ended before command was written");
        }
    }
}

pub struct WebSocketTransport {
    url: Url,
    bearer_token: String,
    policy: ReconnectPolicy,
    link: Mutex<LinkState>,
    events: broadcast::Sender<TransportEvent>,
}

impl WebSocketTransport {
    pub fn new(
        url: Url,
        bearer_token: impl Into<String>,
        policy: ReconnectPolicy,
        buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(buffer.max(1));
        Arc::new(Self {
            url,
            bearer_token: bearer_token.into(),
            policy,
            link: Mutex::new(LinkState::default()),
            events,
        })
    }

    /// Spawns the connection loop. Abort the handle to shut the transport
    /// down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.run().await })
    }

    pub async fn held_rooms(&self) -> Vec<RoomId> {
        self.link.lock().await.rooms.held_rooms().cloned().collect()
    }

    async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        let mut resumed = false;
        loop {
            let reason = match self.session(resumed).await {
                Ok(()) => {
                    attempt = 0;
                    resumed = true;
                    "closed by server".to_string()
                }
                Err(err @ TransportError::Socket(_)) => {
                    attempt = 0;
                    resumed = true;
                    err.to_string()
                }
                Err(err) => err.to_string(),
            };
            self.teardown(&reason).await;

            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(?delay, attempt, %reason, "transport: reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection lifetime. Returns `Ok` when the server closes cleanly
    /// and `Socket` when an established connection fails.
    async fn session(&self, resumed: bool) -> Result<(), TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let (outbound, mut commands) = mpsc::unbounded_channel();
        let rejoin = {
            let mut link = self.link.lock().await;
            link.outbound = Some(outbound);
            link.rooms.on_connected()
        };
        info!(url = %self.url, rooms = rejoin.len(), resumed, "transport: connected");
        for command in rejoin {
            write(&mut writer, &command).await?;
        }
        let _ = self.events.send(TransportEvent::Connected { resumed });

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    write(&mut writer, &command).await?;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(TransportError::Socket(err.to_string())),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let event = match ServerEvent::from_wire(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "transport: dropping malformed event");
                return;
            }
        };
        if let ServerEvent::RoomJoined { room } = &event {
            self.link.lock().await.rooms.acknowledge(room);
        }
        debug!(event = event.name(), "transport: event received");
        let _ = self.events.send(TransportEvent::Event(event));
    }

    async fn teardown(&self, reason: &str) {
        let was_connected = {
            let mut link = self.link.lock().await;
            link.outbound = None;
            let was_connected = link.rooms.is_connected();
            link.rooms.on_disconnected();
            was_connected
        };
        if was_connected {
            warn!(%reason, "transport: disconnected");
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

async fn write<S>(writer: &mut S, command: &ClientCommand) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = command.to_wire()?;
    debug!(room = %command.room(), "transport: sending command");
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError::Socket(err.to_string()))
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn join_room(&self, room: RoomId) {
        let mut link = self.link.lock().await;
        if let Some(command) = link.rooms.join_room(room) {
            link.transmit(command);
        }
    }

    async fn leave_room(&self, room: RoomId) {
        let mut link = self.link.lock().await;
        if let Some(command) = link.rooms.leave_room(&room) {
            link.transmit(command);
        }
    }

    async fn is_connected(&self) -> bool {
        self.link.lock().await.rooms.is_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
