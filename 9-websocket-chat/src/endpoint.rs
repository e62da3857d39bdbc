//! Client side of the chat protocol: one WebSocket session per endpoint.
//!
//! An endpoint starts out `Connecting`, becomes `Open` once the WebSocket
//! handshake succeeds and ends `Closed` for good. Everything the server sends
//! is surfaced as [`ChatEvent`]s on a single in-order channel; the caller
//! owns both the endpoint and the receiving half.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::frame::{ClientFrame, Frame};

/// Close code of a clean shutdown.
pub const NORMAL_CLOSE: u16 = 1000;
/// Reported when the peer's close frame carries no status code.
pub const NO_STATUS_CLOSE: u16 = 1005;
/// Reported when the transport ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Display name used when the caller supplies a blank one.
pub const DEFAULT_NAME: &str = "Anonymous";

/// How long a locally started close waits for the peer's answer before the
/// transport is dropped.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receiving half of an endpoint's event channel.
pub type EventStream = mpsc::UnboundedReceiver<ChatEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Normal,
    Abnormal,
}

impl CloseKind {
    pub fn from_code(code: u16) -> Self {
        if code == NORMAL_CLOSE {
            CloseKind::Normal
        } else {
            CloseKind::Abnormal
        }
    }
}

/// Connection-level failures. Fatal to the session, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint already connected once; sessions are never re-opened.
    #[error("session already started")]
    SessionStarted,
    #[error("failed to connect to {address}")]
    Transport {
        address: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
}

/// Everything an endpoint reports to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Opened,
    Presence(String),
    Message(String),
    Error(TransportError),
    /// Always the last event of a session.
    Closed { code: u16, kind: CloseKind },
}

impl From<Frame> for ChatEvent {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Presence { users } => ChatEvent::Presence(users),
            Frame::Chat { text } => ChatEvent::Message(text),
        }
    }
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle flag shared between the endpoint and its reader task.
#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> Self {
        Self(AtomicU8::new(CONNECTING))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            CONNECTING => ConnectionState::Connecting,
            OPEN => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    /// `Connecting -> Open`; fails from any other state.
    fn open(&self) -> bool {
        self.0
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns false if the state was already `Closed`.
    fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }
}

pub struct ChatEndpoint {
    display_name: String,
    state: Arc<SharedState>,
    events: mpsc::UnboundedSender<ChatEvent>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    close_requested: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
}

impl ChatEndpoint {
    /// Creates a session in the `Connecting` state together with the stream
    /// its events will be delivered on.
    ///
    /// A blank display name becomes [`DEFAULT_NAME`], so the join frame is
    /// never empty.
    pub fn new(display_name: impl Into<String>) -> (Self, EventStream) {
        let mut display_name = display_name.into();
        if display_name.trim().is_empty() {
            display_name = DEFAULT_NAME.to_string();
        }

        let (events, event_stream) = mpsc::unbounded_channel();
        let endpoint = Self {
            display_name,
            state: Arc::new(SharedState::new()),
            events,
            outbound: None,
            close_requested: Arc::new(Notify::new()),
            reader: None,
        };
        (endpoint, event_stream)
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Opens the WebSocket at `address` and queues the join frame.
    ///
    /// On failure the session is closed: an [`ChatEvent::Error`] and an
    /// abnormal [`ChatEvent::Closed`] are emitted before the error returns.
    pub async fn connect(&mut self, address: &str) -> Result<(), ConnectError> {
        if self.state.load() != ConnectionState::Connecting {
            return Err(ConnectError::SessionStarted);
        }

        let socket = match connect_async(address).await {
            Ok((socket, _response)) => socket,
            Err(err) => {
                warn!(address, error = %err, "websocket connection failed");
                self.state.close();
                emit(
                    &self.events,
                    ChatEvent::Error(TransportError::Connect(err.to_string())),
                );
                emit_closed(&self.events, ABNORMAL_CLOSE);
                return Err(ConnectError::Transport {
                    address: address.to_string(),
                    source: Box::new(err),
                });
            }
        };

        self.state.open();
        info!(address, name = %self.display_name, "websocket open");
        emit(&self.events, ChatEvent::Opened);

        let (sink, stream) = socket.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let join = ClientFrame::Join {
            name: self.display_name.clone(),
        };
        // Queued before the writer starts, so nothing can overtake it.
        let _ = outbound.send(Message::Text(join.encode().into()));

        let writer = tokio::spawn(write_frames(sink, outbound_rx));
        let reader = tokio::spawn(read_frames(
            stream,
            Arc::clone(&self.state),
            self.events.clone(),
            Arc::clone(&self.close_requested),
            writer,
        ));
        self.outbound = Some(outbound);
        self.reader = Some(reader);

        Ok(())
    }

    /// Transmits `text` as one chat frame.
    ///
    /// Empty text is never sent, and nothing happens unless the session is
    /// `Open`; there is no queue for a closed connection.
    pub fn send(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.enqueue(Message::Text(
            ClientFrame::Chat {
                text: text.to_string(),
            }
            .encode()
            .into(),
        ));
    }

    /// Starts a normal (1000) close without draining anything still queued.
    ///
    /// The session reaches `Closed` when the peer answers, or after a short
    /// grace period if it never does.
    pub fn close(&self) {
        if self.state.load() != ConnectionState::Open {
            return;
        }
        self.enqueue(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        })));
        self.close_requested.notify_one();
    }

    fn enqueue(&self, message: Message) {
        if self.state.load() != ConnectionState::Open {
            debug!(state = ?self.state.load(), "session not open; dropping frame");
            return;
        }
        if let Some(outbound) = &self.outbound {
            if outbound.send(message).is_err() {
                debug!("writer finished; dropping frame");
            }
        }
    }
}

impl Drop for ChatEndpoint {
    fn drop(&mut self) {
        // The writer stops with the outbound channel; the reader holds the
        // other half of the socket and has to be stopped explicitly.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state.close();
    }
}

async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = message.is_close();
        if let Err(error) = sink.send(message).await {
            debug!(%error, "failed to write frame");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    state: Arc<SharedState>,
    events: mpsc::UnboundedSender<ChatEvent>,
    close_requested: Arc<Notify>,
    writer: JoinHandle<()>,
) {
    let mut close_code = None;
    let mut close_deadline = None;

    // After a close frame the loop keeps polling so the handshake reply gets
    // flushed; the stream then ends on its own.
    loop {
        let next = match close_deadline {
            Some(deadline) => match timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("peer did not answer close; dropping transport");
                    if close_code.is_none() {
                        close_code = Some(NORMAL_CLOSE);
                    }
                    break;
                }
            },
            None => select! {
                next = stream.next() => next,
                _ = close_requested.notified() => {
                    close_deadline = Some(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                    continue;
                }
            },
        };
        let Some(next) = next else {
            break;
        };

        match next {
            Ok(Message::Close(frame)) => {
                if close_code.is_none() {
                    close_code =
                        Some(frame.map_or(NO_STATUS_CLOSE, |frame| u16::from(frame.code)));
                }
            }
            Ok(message) => handle_message(message, &events),
            Err(error) => {
                if close_code.is_none() {
                    warn!(%error, "websocket error");
                    emit(
                        &events,
                        ChatEvent::Error(TransportError::Connection(error.to_string())),
                    );
                }
                break;
            }
        }
    }

    writer.abort();
    if state.close() {
        emit_closed(&events, close_code.unwrap_or(ABNORMAL_CLOSE));
    }
}

fn handle_message(message: Message, events: &mpsc::UnboundedSender<ChatEvent>) {
    match message {
        Message::Text(text) => deliver(text.as_str(), events),
        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => deliver(text, events),
            Err(error) => {
                warn!(%error, len = bytes.len(), "dropping non-utf8 binary frame");
                emit(
                    events,
                    ChatEvent::Error(TransportError::Malformed(error.to_string())),
                );
            }
        },
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_) => {}
    }
}

fn deliver(payload: &str, events: &mpsc::UnboundedSender<ChatEvent>) {
    debug!(payload, "frame received");
    emit(events, Frame::classify(payload).into());
}

fn emit_closed(events: &mpsc::UnboundedSender<ChatEvent>, code: u16) {
    let kind = CloseKind::from_code(code);
    match kind {
        CloseKind::Normal => info!("websocket closed normally"),
        CloseKind::Abnormal => warn!(code, "websocket closed abnormally"),
    }
    emit(events, ChatEvent::Closed { code, kind });
}

fn emit(events: &mpsc::UnboundedSender<ChatEvent>, event: ChatEvent) {
    // The owner may have dropped the stream; the session still runs to completion.
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_1000_is_a_normal_close() {
        assert_eq!(CloseKind::from_code(1000), CloseKind::Normal);
        for code in [1001, 1005, 1006, 1011, 4000] {
            assert_eq!(CloseKind::from_code(code), CloseKind::Abnormal);
        }
    }

    #[test]
    fn state_never_leaves_closed() {
        let state = SharedState::new();
        assert_eq!(state.load(), ConnectionState::Connecting);
        assert!(state.open());
        assert_eq!(state.load(), ConnectionState::Open);
        assert!(!state.open());

        assert!(state.close());
        assert!(!state.close());
        assert!(!state.open());
        assert_eq!(state.load(), ConnectionState::Closed);
    }

    #[test]
    fn connecting_can_close_directly() {
        let state = SharedState::new();
        assert!(state.close());
        assert!(!state.open());
        assert_eq!(state.load(), ConnectionState::Closed);
    }

    #[test]
    fn frames_map_onto_events() {
        assert_eq!(
            ChatEvent::from(Frame::classify("Online Users: 3")),
            ChatEvent::Presence("3".into())
        );
        assert_eq!(
            ChatEvent::from(Frame::classify("hi there")),
            ChatEvent::Message("hi there".into())
        );
    }

    #[tokio::test]
    async fn send_before_connect_is_silent() {
        let (endpoint, mut events) = ChatEndpoint::new("Alice");
        endpoint.send("hello");
        endpoint.close();

        assert_eq!(endpoint.state(), ConnectionState::Connecting);
        assert_eq!(endpoint.display_name(), "Alice");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn blank_display_name_falls_back_to_default() {
        for blank in ["", "   ", "\t"] {
            let (endpoint, _events) = ChatEndpoint::new(blank);
            assert_eq!(endpoint.display_name(), DEFAULT_NAME);
        }
        let (endpoint, _events) = ChatEndpoint::new(" Bob ");
        assert_eq!(endpoint.display_name(), " Bob ");
    }
}
