//! Client network layer: one relay connection per game session
//!
//! The client uploads the latest locally simulated state at a fixed rate and
//! turns every inbound relay message into a `NetworkEvent` on its bus. A
//! connection that cannot be built or opened leaves the client `Closed`, and
//! the game keeps running offline.

use crate::events::{EventBus, NetworkEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use relay_shared::{
    decode, encode, period_for_rate, ClientMessage, Identity,
    ServerMessage, StateSnapshot, NETWORK_SEND_RATE_HZ,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type RelaySink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    player_id: Option<String>,
    latest_local_state: Option<StateSnapshot>,
}

/// State touched by both the caller and the driver task
struct Shared {
    inner: Mutex<Inner>,
    events: Arc<EventBus>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.inner().state
    }

    /// Moves to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut inner = self.inner();
        if from.contains(&inner.state) {
            inner.state = to;
            true
        } else {
            false
        }
    }

    /// Encodes the latest local state, but only while the socket is open.
    ///
    /// Checked on every tick right before sending, so a state recorded while
    /// closed is never queued for later.
    fn outbound_state(&self) -> Option<String> {
        let payload = {
            let inner = self.inner();
            if inner.state != ConnectionState::Open {
                return None;
            }
            inner.latest_local_state.clone()?
        };

        match encode(&ClientMessage::State { payload }) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to encode local state: {}", e);
                None
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let message: ServerMessage = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unrecognised relay message: {}", e);
                return;
            }
        };

        let event = demultiplex(&mut self.inner().player_id, message);
        self.events.emit(&event);
    }
}

/// Maps one relay message onto the event a consumer sees
///
/// `welcome` latches the client's own id; `stateUpdate` drops that id so the
/// consumer never receives its own state back. State entries that do not
/// decode are skipped individually.
fn demultiplex(own_player_id: &mut Option<String>, message: ServerMessage) -> NetworkEvent {
    match message {
        ServerMessage::Welcome {
            player_id,
            room_id,
            color_index,
        } => {
            *own_player_id = Some(player_id.clone());
            NetworkEvent::RoomJoined {
                player_id,
                room_id,
                color_index,
            }
        }
        ServerMessage::PlayerJoined {
            player_id,
            color_index,
            player_name,
            ..
        } => NetworkEvent::PlayerJoined {
            player_id,
            color_index,
            player_name,
        },
        ServerMessage::PlayerLeft { player_id } => NetworkEvent::PlayerLeft { player_id },
        ServerMessage::PlayerIdentity {
            player_id,
            player_name,
            avatar_url,
        } => NetworkEvent::PlayerIdentityChanged {
            player_id,
            player_name,
            avatar_url,
        },
        ServerMessage::StateUpdate { mut states } => {
            if let Some(own) = own_player_id.as_deref() {
                states.remove(own);
            }
            let states = states
                .into_iter()
                .filter_map(|(player_id, value)| {
                    match serde_json::from_value::<StateSnapshot>(value) {
                        Ok(state) => Some((player_id, state)),
                        Err(e) => {
                            debug!("Skipping bad state for player {}: {}", player_id, e);
                            None
                        }
                    }
                })
                .collect();
            NetworkEvent::StateBatch(states)
        }
    }
}

/// A running connection: the driver task and its stop signal
struct Session {
    shutdown: oneshot::Sender<()>,
    driver: JoinHandle<()>,
}

pub struct NetworkClient {
    server_url: String,
    send_period: Duration,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl NetworkClient {
    pub fn new(server_url: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            server_url: server_url.into(),
            send_period: period_for_rate(NETWORK_SEND_RATE_HZ),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    player_id: None,
                    latest_local_state: None,
                }),
                events,
            }),
            session: None,
        }
    }

    pub fn with_send_rate(mut self, rate_hz: u32) -> Self {
        self.send_period = period_for_rate(rate_hz);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Id assigned by the relay in the last `welcome`, if any
    pub fn player_id(&self) -> Option<String> {
        self.shared.inner().player_id.clone()
    }

    /// Records the latest locally simulated state for the next send tick.
    pub fn update_local_state(&self, state: StateSnapshot) {
        self.shared.inner().latest_local_state = Some(state);
    }

    /// Relay URL with the room appended as the `room` query parameter
    pub fn room_url(&self, room_id: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.server_url)?;
        url.query_pairs_mut().append_pair("room", room_id);
        Ok(url)
    }

    /// Starts connecting to a room
    ///
    /// Never fails from the caller's point of view. If the upgrade request
    /// cannot be built, or there is no async runtime to drive it, the client
    /// goes straight to `Closed` and emits `Disconnected`. On open, the
    /// identity (if any) is sent once, then the local state is uploaded at
    /// the send rate.
    pub fn connect(&mut self, room_id: &str, identity: Option<Identity>) {
        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Open) {
            warn!("connect() ignored while {:?}; disconnect first", state);
            return;
        }

        // A previous session that ended on its own has already finished.
        if let Some(session) = self.session.take() {
            session.driver.abort();
        }

        let url = match self.room_url(room_id) {
            Ok(url) => url,
            Err(e) => {
                self.go_offline(&format!("invalid relay URL {}: {}", self.server_url, e));
                return;
            }
        };
        let request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                self.go_offline(&format!("invalid relay URL {}: {}", url, e));
                return;
            }
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.go_offline(&e.to_string());
                return;
            }
        };

        {
            let mut inner = self.shared.inner();
            inner.state = ConnectionState::Connecting;
            inner.player_id = None;
        }
        info!("Connecting to {}", url);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let driver = runtime.spawn(drive(
            Arc::clone(&self.shared),
            request,
            identity,
            self.send_period,
            shutdown_rx,
        ));
        self.session = Some(Session { shutdown, driver });
    }

    fn go_offline(&self, reason: &str) {
        warn!("Relay connection unavailable, running offline: {}", reason);
        self.shared.inner().state = ConnectionState::Closed;
        self.shared.events.emit(&NetworkEvent::Disconnected);
    }

    /// Stops the send loop and closes the connection
    ///
    /// Once this returns the driver task has exited, so nothing more is
    /// written to the socket. Safe to call repeatedly or without ever having
    /// connected.
    pub async fn disconnect(&mut self) {
        let was_live = self.shared.transition(
            &[ConnectionState::Connecting, ConnectionState::Open],
            ConnectionState::Closed,
        );

        if let Some(session) = self.session.take() {
            let _ = session.shutdown.send(());
            if let Err(e) = session.driver.await {
                if e.is_panic() {
                    error!("Network driver panicked: {}", e);
                }
            }
        }

        if was_live {
            info!("Disconnected from relay");
            self.shared.events.emit(&NetworkEvent::Disconnected);
        }
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.driver.abort();
        }
    }
}

async fn send_text(sink: &mut RelaySink, text: String) -> bool {
    match sink.send(Message::text(text)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send to relay: {}", e);
            false
        }
    }
}

/// Owns the socket for one session: connect, identify, then multiplex the
/// send timer, inbound frames and the stop signal until one of them ends it.
async fn drive(
    shared: Arc<Shared>,
    request: Request,
    identity: Option<Identity>,
    send_period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let connected = tokio::select! {
        biased;
        _ = &mut shutdown => return,
        result = connect_async(request) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("Failed to connect to relay: {}", e);
            if shared.transition(&[ConnectionState::Connecting], ConnectionState::Closed) {
                shared.events.emit(&NetworkEvent::Disconnected);
            }
            return;
        }
    };

    if !shared.transition(&[ConnectionState::Connecting], ConnectionState::Open) {
        return;
    }
    info!("Connected to relay");
    shared.events.emit(&NetworkEvent::Connected);

    let (mut sink, mut stream) = ws_stream.split();

    if let Some(identity) = identity {
        if shared.state() == ConnectionState::Open {
            match encode(&ClientMessage::identify(&identity)) {
                Ok(text) => {
                    send_text(&mut sink, text).await;
                }
                Err(e) => error!("Failed to encode identity: {}", e),
            }
        }
    }

    let mut send_timer = interval(send_period);
    send_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    send_timer.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                let _ = sink.close().await;
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.handle_text(text),
                    Err(_) => debug!("Ignoring non-UTF-8 frame from relay"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay connection error: {}", e);
                    break;
                }
            },
            _ = send_timer.tick() => {
                if let Some(text) = shared.outbound_state() {
                    if !send_text(&mut sink, text).await {
                        break;
                    }
                }
            }
        }
    }

    if shared.transition(&[ConnectionState::Open], ConnectionState::Closed) {
        info!("Relay closed the connection");
        shared.events.emit(&NetworkEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use relay_shared::Facing;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_test::assert_ok;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    fn record(client: &NetworkClient, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in kinds {
            let tx = tx.clone();
            client.events().on(*kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    fn test_client() -> NetworkClient {
        NetworkClient::new("ws://127.0.0.1:3001", Arc::new(EventBus::new()))
    }

    fn sample_state() -> StateSnapshot {
        StateSnapshot::new(120.0, 380.0, 300.0, 0.0, Facing::Right)
    }

    #[test]
    fn test_new_client_is_idle() {
        let client = test_client();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.is_connected());
        assert_eq!(client.player_id(), None);
    }

    #[test]
    fn test_room_url_encodes_room() {
        let client = test_client();
        assert_eq!(client.room_url("r1").unwrap().as_str(), "ws://127.0.0.1:3001/?room=r1");
        assert_eq!(
            client.room_url("my room & co").unwrap().as_str(),
            "ws://127.0.0.1:3001/?room=my+room+%26+co"
        );
        assert_eq!(
            relay_shared::room_from_query(client.room_url("my room & co").unwrap().query()),
            "my room & co"
        );

        let with_query = NetworkClient::new("ws://host/?v=2", Arc::new(EventBus::new()));
        assert_eq!(with_query.room_url("r1").unwrap().as_str(), "ws://host/?v=2&room=r1");

        let invalid = NetworkClient::new("not a valid url", Arc::new(EventBus::new()));
        assert!(invalid.room_url("r1").is_err());
    }

    #[test]
    fn test_connect_with_unbuildable_request_goes_offline() {
        let mut client = NetworkClient::new("not a valid url", Arc::new(EventBus::new()));
        let mut events = record(&client, &[EventKind::Disconnected]);

        client.connect("test-room", None);

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(events.try_recv().ok(), Some(NetworkEvent::Disconnected));
    }

    #[test]
    fn test_connect_without_runtime_goes_offline() {
        let mut client = test_client();
        client.connect("test-room", Some(Identity::new("Solo", None)));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut client = test_client();
        let mut events = record(&client, &[EventKind::Disconnected]);

        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_relay_ends_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = NetworkClient::new(format!("ws://{}", addr), Arc::new(EventBus::new()));
        let mut events = record(&client, &[EventKind::Connected, EventKind::Disconnected]);
        client.connect("r1", None);

        let event = timeout(WAIT, events.recv()).await.unwrap();
        assert_eq!(event, Some(NetworkEvent::Disconnected));
        assert_eq!(client.state(), ConnectionState::Closed);

        client.disconnect().await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_welcome_latches_player_id() {
        let client = test_client();
        let mut events = record(&client, &[EventKind::RoomJoined]);

        client
            .shared
            .handle_text(r#"{"type":"welcome","playerId":"42","roomId":"test-room","colorIndex":3}"#);

        assert_eq!(client.player_id().as_deref(), Some("42"));
        assert_eq!(
            events.try_recv().ok(),
            Some(NetworkEvent::RoomJoined {
                player_id: "42".to_string(),
                room_id: "test-room".to_string(),
                color_index: 3,
            })
        );
    }

    #[test]
    fn test_membership_messages_become_events() {
        let client = test_client();
        let mut events = record(
            &client,
            &[
                EventKind::PlayerJoined,
                EventKind::PlayerLeft,
                EventKind::PlayerIdentityChanged,
            ],
        );

        client
            .shared
            .handle_text(r#"{"type":"playerJoined","playerId":"99","colorIndex":2,"playerName":"Hero"}"#);
        client
            .shared
            .handle_text(r#"{"type":"playerIdentity","playerId":"99","playerName":"Hero2","avatarUrl":null}"#);
        client
            .shared
            .handle_text(r#"{"type":"playerLeft","playerId":"99"}"#);

        assert_eq!(
            events.try_recv().ok(),
            Some(NetworkEvent::PlayerJoined {
                player_id: "99".to_string(),
                color_index: 2,
                player_name: Some("Hero".to_string()),
            })
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(NetworkEvent::PlayerIdentityChanged {
                player_id: "99".to_string(),
                player_name: "Hero2".to_string(),
                avatar_url: None,
            })
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(NetworkEvent::PlayerLeft {
                player_id: "99".to_string()
            })
        );
    }

    #[test]
    fn test_state_batch_excludes_own_player() {
        let client = test_client();
        let mut events = record(&client, &[EventKind::StateBatch]);

        client
            .shared
            .handle_text(r#"{"type":"welcome","playerId":"1","roomId":"test-room","colorIndex":0}"#);
        client.shared.handle_text(
            r#"{"type":"stateUpdate","states":{
                "1":{"x":100,"y":200,"vx":0,"vy":0,"facing":"left"},
                "2":{"x":300,"y":400,"vx":0,"vy":0,"facing":"right"}}}"#,
        );

        match events.try_recv() {
            Ok(NetworkEvent::StateBatch(states)) => {
                assert_eq!(states.len(), 1);
                assert!(!states.contains_key("1"));
                assert_eq!(states["2"], StateSnapshot::new(300.0, 400.0, 0.0, 0.0, Facing::Right));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_state_batch_skips_undecodable_entries() {
        let client = test_client();
        let mut events = record(&client, &[EventKind::StateBatch]);

        client.shared.handle_text(
            r#"{"type":"stateUpdate","states":{"2":{"x":1,"y":2},"3":"garbage","4":{"y":5}}}"#,
        );

        match events.try_recv() {
            Ok(NetworkEvent::StateBatch(states)) => {
                assert_eq!(states.keys().collect::<Vec<_>>(), vec!["2"]);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognised_messages_are_ignored() {
        let client = test_client();
        let mut events = record(
            &client,
            &[EventKind::StateBatch, EventKind::PlayerJoined, EventKind::RoomJoined],
        );

        client.shared.handle_text(r#"{"type":"chat","text":"hello"}"#);
        client.shared.handle_text("{not json");

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_outbound_state_requires_open_connection() {
        let client = test_client();
        client.update_local_state(sample_state());
        assert_eq!(client.shared.outbound_state(), None);

        client.shared.inner().state = ConnectionState::Open;
        let text = client.shared.outbound_state().unwrap();
        let message: ClientMessage = decode(&text).unwrap();
        assert_eq!(message, ClientMessage::State { payload: sample_state() });

        client.shared.inner().state = ConnectionState::Closed;
        assert_eq!(client.shared.outbound_state(), None);
    }

    #[test]
    fn test_outbound_state_requires_local_state() {
        let client = test_client();
        client.shared.inner().state = ConnectionState::Open;
        assert_eq!(client.shared.outbound_state(), None);
    }

    /// Runs a bare WebSocket endpoint and reports each text frame it receives
    async fn spawn_capture_relay() -> (String, mpsc::UnboundedReceiver<Option<String>>) {
        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let url = format!("ws://{}", assert_ok!(listener.local_addr()));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let _ = tx.send(Some(text.to_string()));
                }
            }
            let _ = tx.send(None);
        });

        (url, rx)
    }

    #[tokio::test]
    async fn test_identify_sent_first_then_states() {
        let (url, mut frames) = spawn_capture_relay().await;
        let mut client = NetworkClient::new(url, Arc::new(EventBus::new())).with_send_rate(50);
        let mut events = record(&client, &[EventKind::Connected]);

        client.connect("r1", Some(Identity::new("TestUser", None)));
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(NetworkEvent::Connected));
        assert!(client.is_connected());

        let first = timeout(WAIT, frames.recv()).await.unwrap().flatten().unwrap();
        let identify: ClientMessage = decode(&first).unwrap();
        assert_eq!(identify, ClientMessage::identify(&Identity::new("TestUser", None)));

        client.update_local_state(sample_state());
        let second = timeout(WAIT, frames.recv()).await.unwrap().flatten().unwrap();
        let state: ClientMessage = decode(&second).unwrap();
        assert_eq!(state, ClientMessage::State { payload: sample_state() });

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        // Everything after disconnect() is the end of the stream.
        loop {
            match timeout(WAIT, frames.recv()).await.unwrap() {
                Some(Some(text)) => {
                    let message: ClientMessage = decode(&text).unwrap();
                    assert!(matches!(message, ClientMessage::State { .. }));
                }
                Some(None) | None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_while_open_is_ignored() {
        let (url, _frames) = spawn_capture_relay().await;
        let mut client = NetworkClient::new(url, Arc::new(EventBus::new()));
        let mut events = record(&client, &[EventKind::Connected]);

        client.connect("r1", None);
        timeout(WAIT, events.recv()).await.unwrap();

        client.connect("r2", None);
        assert_eq!(client.state(), ConnectionState::Open);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
