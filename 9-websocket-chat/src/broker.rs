use std::{
    collections::BTreeMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{
    Sink, SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast},
    task::JoinSet,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::frame::{ClientFrame, Frame};

/// Frames buffered per subscriber before a slow client starts lagging.
const BROADCAST_CAPACITY: usize = 128;
/// How long shutdown waits for sessions to send their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type ClientId = u64;
type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ClientStream = SplitStream<WebSocketStream<TcpStream>>;

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut sessions);
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        drop(listener);
        wait_for_sessions(&mut sessions).await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &Arc<BrokerState>) {
    info!("broker shutting down");
    state.broadcast(Broadcast::Shutdown);
}

/// Lets every session deliver its close frame before the broker returns.
async fn wait_for_sessions(sessions: &mut JoinSet<()>) {
    let drained = timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions still running after shutdown grace; aborting"
        );
        sessions.shutdown().await;
    }
    info!("broker stopped");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state, sessions),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<BrokerState>,
    sessions: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    sessions.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// What the fan-out channel carries to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Broadcast {
    Frame(Frame),
    Shutdown,
}

struct BrokerState {
    /// Keyed by join order, which is also the presence roster order.
    clients: Mutex<BTreeMap<ClientId, String>>,
    broadcaster: broadcast::Sender<Broadcast>,
    next_id: AtomicU64,
}

impl BrokerState {
    fn new() -> Self {
        let (broadcaster, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            clients: Mutex::new(BTreeMap::new()),
            broadcaster,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `name` and announces the new roster followed by the join notice.
    async fn join(&self, id: ClientId, name: &str) {
        let mut clients = self.clients.lock().await;
        clients.insert(id, name.to_string());
        // Broadcasting under the lock keeps presence frames in registry order.
        self.broadcast(Broadcast::Frame(Frame::presence(clients.values())));
        self.broadcast(Broadcast::Frame(Frame::chat(format!(
            "User {name} has joined the chat"
        ))));
    }

    async fn leave(&self, id: ClientId) -> Option<String> {
        let mut clients = self.clients.lock().await;
        let name = clients.remove(&id)?;
        self.broadcast(Broadcast::Frame(Frame::presence(clients.values())));
        self.broadcast(Broadcast::Frame(Frame::chat(format!(
            "User {name} has left the chat"
        ))));
        Some(name)
    }

    async fn roster(&self) -> Vec<String> {
        self.clients.lock().await.values().cloned().collect()
    }

    fn broadcast(&self, message: Broadcast) {
        // Only fails when nobody is subscribed, which is routine between sessions.
        if self.broadcaster.send(message).is_err() {
            debug!("no subscribers for broadcast");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.broadcaster.subscribe()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<BrokerState>,
) -> Result<()> {
    let socket = accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (mut sink, mut stream) = socket.split();

    let Some(name) = perform_handshake(&mut stream).await? else {
        debug!(%peer, "connection closed before join");
        return Ok(());
    };

    if name.trim().is_empty() {
        close_with(&mut sink, CloseCode::Policy, "name cannot be empty").await;
        anyhow::bail!("name cannot be empty");
    }

    // Subscribe first so the joiner sees its own presence update and join notice.
    let mut inbox = state.subscribe();
    let client_id = state.next_id();
    state.join(client_id, &name).await;
    info!(%peer, name, "client joined");

    let result = run_client_session(&state, &mut stream, &mut sink, &mut inbox, &name).await;
    cleanup_client_disconnect(&state, client_id, peer).await;

    result
}

/// Reads frames until the first text payload, which names the client.
async fn perform_handshake(stream: &mut ClientStream) -> Result<Option<String>> {
    while let Some(message) = stream.next().await {
        let message = message.context("failed to read join frame")?;
        if message.is_close() {
            return Ok(None);
        }
        if let Some(payload) = payload(message) {
            return match ClientFrame::decode(&payload, false) {
                ClientFrame::Join { name } => Ok(Some(name)),
                ClientFrame::Chat { .. } => anyhow::bail!("expected join frame first"),
            };
        }
    }
    Ok(None)
}

async fn run_client_session(
    state: &BrokerState,
    stream: &mut ClientStream,
    sink: &mut ClientSink,
    inbox: &mut broadcast::Receiver<Broadcast>,
    name: &str,
) -> Result<()> {
    loop {
        select! {
            client_message = stream.next() => {
                if !handle_client_message(client_message, state, name) {
                    break;
                }
            }
            broadcast_message = inbox.recv() => {
                if !handle_broadcast_message(broadcast_message, sink).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn handle_client_message(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    state: &BrokerState,
    name: &str,
) -> bool {
    match message {
        Some(Ok(message)) => {
            if let Some(payload) = payload(message) {
                if let ClientFrame::Chat { text } = ClientFrame::decode(&payload, true) {
                    if !text.is_empty() {
                        state.broadcast(Broadcast::Frame(Frame::chat(format!("{name}: {text}"))));
                    }
                }
            }
            // Close frames are answered by the stream itself; keep polling until it ends.
            true
        }
        Some(Err(err)) => {
            debug!(?err, name, "client stream failed");
            false
        }
        None => false,
    }
}

async fn handle_broadcast_message<S>(
    message: Result<Broadcast, broadcast::error::RecvError>,
    sink: &mut S,
) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    match message {
        Ok(Broadcast::Frame(frame)) => {
            if let Err(err) = sink.send(Message::Text(frame.encode().into())).await {
                debug!(?err, "failed to deliver frame to client");
                return false;
            }
            true
        }
        Ok(Broadcast::Shutdown) => {
            close_with(sink, CloseCode::Away, "broker shutting down").await;
            false
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            let warning = Frame::chat(format!(
                "you are behind by {skipped} messages; consider reconnecting"
            ));
            if let Err(err) = sink.send(Message::Text(warning.encode().into())).await {
                debug!(?err, "failed to notify client about lag");
                return false;
            }
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

async fn close_with<S>(sink: &mut S, code: CloseCode, reason: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(err) = sink.send(Message::Close(Some(frame))).await {
        debug!(?err, "failed to send close frame");
    }
}

async fn cleanup_client_disconnect(state: &BrokerState, client_id: ClientId, peer: SocketAddr) {
    if let Some(name) = state.leave(client_id).await {
        let online = state.roster().await.len();
        info!(%peer, %name, online, "client disconnected");
    }
}

/// Text carried by a data frame; binary frames count when they are valid UTF-8.
fn payload(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.as_str().to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_announces_roster_then_notice() {
        let state = BrokerState::new();
        let mut rx = state.subscribe();

        let alice = state.next_id();
        state.join(alice, "alice").await;
        let bob = state.next_id();
        state.join(bob, "bob").await;

        let mut frames = Vec::new();
        while let Ok(Broadcast::Frame(frame)) = rx.try_recv() {
            frames.push(frame.encode());
        }
        assert_eq!(
            frames,
            vec![
                "Online Users: alice",
                "User alice has joined the chat",
                "Online Users: alice, bob",
                "User bob has joined the chat",
            ]
        );
        assert_eq!(state.roster().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn leave_updates_roster_once() {
        let state = BrokerState::new();
        let alice = state.next_id();
        state.join(alice, "alice").await;
        let bob = state.next_id();
        state.join(bob, "bob").await;

        let mut rx = state.subscribe();
        assert_eq!(state.leave(alice).await.as_deref(), Some("alice"));
        assert_eq!(state.leave(alice).await, None);

        assert_eq!(
            rx.recv().await.expect("presence"),
            Broadcast::Frame(Frame::presence(["bob"]))
        );
        assert_eq!(
            rx.recv().await.expect("notice"),
            Broadcast::Frame(Frame::chat("User alice has left the chat"))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_names_are_allowed() {
        let state = BrokerState::new();
        let first = state.next_id();
        state.join(first, "alice").await;
        let second = state.next_id();
        state.join(second, "alice").await;

        assert_eq!(state.roster().await, vec!["alice", "alice"]);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_warned_and_kept() {
        let state = BrokerState::new();
        let mut rx = state.subscribe();
        for n in 0..BROADCAST_CAPACITY + 2 {
            state.broadcast(Broadcast::Frame(Frame::chat(n.to_string())));
        }

        let lagged = rx.recv().await;
        assert!(matches!(lagged, Err(broadcast::error::RecvError::Lagged(2))));

        let mut sent: Vec<Message> = Vec::new();
        assert!(handle_broadcast_message(lagged, &mut sent).await);
        assert_eq!(
            sent,
            vec![Message::Text(
                "you are behind by 2 messages; consider reconnecting"
                    .to_string()
                    .into()
            )]
        );

        // Delivery resumes with the oldest frame still buffered.
        assert!(handle_broadcast_message(rx.recv().await, &mut sent).await);
        assert_eq!(sent[1], Message::Text("2".to_string().into()));
    }

    #[tokio::test]
    async fn shutdown_sends_going_away_and_ends_session() {
        let mut sent: Vec<Message> = Vec::new();
        assert!(!handle_broadcast_message(Ok(Broadcast::Shutdown), &mut sent).await);

        let [Message::Close(Some(frame))] = sent.as_slice() else {
            panic!("expected a single close frame, got {sent:?}");
        };
        assert_eq!(frame.code, CloseCode::Away);
    }

    #[test]
    fn utf8_binary_frames_carry_text() {
        assert_eq!(payload(Message::Text("hi".to_string().into())), Some("hi".to_string()));
        assert_eq!(
            payload(Message::Binary(b"hi".to_vec().into())),
            Some("hi".to_string())
        );
        assert_eq!(payload(Message::Binary(vec![0xff, 0xfe].into())), None);
        assert_eq!(payload(Message::Ping(Vec::new().into())), None);
    }
}
