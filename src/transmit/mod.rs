//! `Transmitter` — one persistent WebSocket connection to a recognition
//! endpoint.
//!
//! ## Contract
//!
//! - `connect()` returns immediately; readiness is signalled later through
//!   [`ConnectionEvents::on_open`]. Calling it while connecting or open is a
//!   no-op.
//! - `send_audio` / `send_text` enqueue exactly one frame when the
//!   connection is open and return `false` otherwise — no blocking, no
//!   retrying, no buffering. Dropped payloads are the caller's problem.
//! - A failed or peer-closed connection transitions to `Closed` and stays
//!   there; reconnecting is the caller's policy (a later `connect()` builds
//!   a fresh connection, the old one is replaced rather than mutated).
//!
//! Network I/O runs on tokio tasks; callbacks arrive on those tasks'
//! threads and must be thread-safe.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Control message marking logical utterance end to the remote endpoint.
pub const STOP_RECOGNIZE: &str = "stopRecognize";

/// Default sub-protocol token sent in the handshake.
pub const SUB_PROTOCOL: &str = "recognize";

/// Configuration for `Transmitter`.
#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// WebSocket endpoint, e.g. `ws://192.168.10.24/`.
    pub endpoint: String,
    /// Value of the `Sec-WebSocket-Protocol` handshake header.
    pub sub_protocol: String,
    /// Sample rate of the audio this connection will carry (Hz).
    pub sample_rate: u32,
}

impl TransmitterConfig {
    pub fn new(endpoint: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            sub_protocol: SUB_PROTOCOL.to_string(),
            sample_rate,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle and inbound-traffic notifications, delivered from network-I/O
/// tasks. Inbound messages have no defined protocol handling in this core;
/// implementors typically just log them.
pub trait ConnectionEvents: Send + Sync + 'static {
    fn on_open(&self);
    fn on_text(&self, text: &str);
    fn on_binary(&self, payload: &[u8]);
    fn on_closing(&self, code: Option<u16>);
    fn on_failure(&self, error: &str);
}

/// Default events sink: diagnostic logging only.
pub struct LogEvents;

impl ConnectionEvents for LogEvents {
    fn on_open(&self) {
        info!("websocket opened");
    }
    fn on_text(&self, text: &str) {
        debug!("receiving: {text}");
    }
    fn on_binary(&self, payload: &[u8]) {
        debug!("receiving {} bytes", payload.len());
    }
    fn on_closing(&self, code: Option<u16>) {
        info!(?code, "websocket closing");
    }
    fn on_failure(&self, error: &str) {
        warn!("websocket error: {error}");
    }
}

struct Inner {
    state: ConnectionState,
    /// Writer-task handle for the live connection; `None` once closed.
    link: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped per connection attempt so stale tasks cannot clobber the
    /// state of their replacement.
    epoch: u64,
}

/// Streaming transmitter. `Send + Sync`; share via `Arc`.
pub struct Transmitter {
    config: TransmitterConfig,
    runtime: tokio::runtime::Handle,
    events: Arc<dyn ConnectionEvents>,
    inner: Arc<Mutex<Inner>>,
}

impl Transmitter {
    pub fn new(config: TransmitterConfig, runtime: tokio::runtime::Handle) -> Self {
        Self::with_events(config, runtime, Arc::new(LogEvents))
    }

    pub fn with_events(
        config: TransmitterConfig,
        runtime: tokio::runtime::Handle,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        Self {
            config,
            runtime,
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Unconnected,
                link: None,
                epoch: 0,
            })),
        }
    }

    /// Begin establishing the connection. Returns immediately; `on_open`
    /// fires once the handshake completes. No-op while connecting or open.
    pub fn connect(&self) {
        let epoch = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.epoch += 1;
            inner.epoch
        };

        info!(
            endpoint = self.config.endpoint.as_str(),
            sample_rate = self.config.sample_rate,
            "connecting"
        );
        let config = self.config.clone();
        let inner = Arc::clone(&self.inner);
        let events = Arc::clone(&self.events);
        self.runtime
            .spawn(async move { run_connection(config, inner, events, epoch).await });
    }

    /// Enqueue one binary frame of raw PCM. Returns `false` (and drops the
    /// payload) when the connection is not open.
    pub fn send_audio(&self, pcm: &[u8]) -> bool {
        let sent = self.send_message(Message::Binary(pcm.to_vec()));
        if !sent {
            warn!("could not queue audio data");
        }
        sent
    }

    /// Enqueue one text control frame. Same contract as `send_audio`.
    pub fn send_text(&self, message: &str) -> bool {
        self.send_message(Message::Text(message.to_string()))
    }

    /// Mark logical utterance end to the remote endpoint without closing
    /// the connection.
    pub fn stop_recognize(&self) -> bool {
        self.send_text(STOP_RECOGNIZE)
    }

    /// Initiate a graceful close with status 1000. No-op when not open.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Open => {
                if let Some(link) = inner.link.take() {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = link.send(Message::Close(Some(frame)));
                }
                inner.state = ConnectionState::Closing;
            }
            ConnectionState::Connecting => {
                // Supersede the pending handshake; its task will notice the
                // epoch moved on and discard the connection.
                inner.epoch += 1;
                inner.state = ConnectionState::Closed;
            }
            _ => {}
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn send_message(&self, message: Message) -> bool {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Open {
            return false;
        }
        match &inner.link {
            Some(link) => link.send(message).is_ok(),
            None => false,
        }
    }
}

fn build_request(
    config: &TransmitterConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    let token = HeaderValue::from_str(&config.sub_protocol).map_err(|e| e.to_string())?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, token);
    Ok(request)
}

async fn run_connection(
    config: TransmitterConfig,
    inner: Arc<Mutex<Inner>>,
    events: Arc<dyn ConnectionEvents>,
    epoch: u64,
) {
    let fail = |error: String| {
        events.on_failure(&error);
        let mut inner = inner.lock();
        if inner.epoch == epoch {
            inner.state = ConnectionState::Closed;
            inner.link = None;
        }
    };

    let request = match build_request(&config) {
        Ok(r) => r,
        Err(e) => {
            fail(format!("invalid endpoint: {e}"));
            return;
        }
    };

    let (ws, response) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            fail(e.to_string());
            return;
        }
    };
    debug!(status = ?response.status(), "websocket handshake complete");

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let superseded = {
        let mut guard = inner.lock();
        if guard.epoch == epoch {
            guard.state = ConnectionState::Open;
            guard.link = Some(tx.clone());
            false
        } else {
            true
        }
    };
    if superseded {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    events.on_open();

    // Writer task: drains the send queue into the socket. A close frame is
    // the last thing it will ever write.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    // Read loop: inbound traffic is diagnostic only in this design.
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => events.on_text(&text),
            Ok(Message::Binary(payload)) => events.on_binary(&payload),
            Ok(Message::Close(frame)) => {
                events.on_closing(frame.as_ref().map(|f| u16::from(f.code)));
                // Echo the close; harmless if our own close frame already
                // went out (the writer refuses a second one).
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })));
                break;
            }
            Ok(_) => {} // ping/pong handled by the protocol layer
            Err(e) => {
                events.on_failure(&e.to_string());
                break;
            }
        }
    }

    {
        let mut guard = inner.lock();
        if guard.epoch == epoch {
            guard.state = ConnectionState::Closed;
            guard.link = None;
        }
    }
    drop(tx);
    let _ = writer.await;
    debug!("connection task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_recognize_sub_protocol() {
        let config = TransmitterConfig::new("ws://localhost:9000/", 16_000);
        assert_eq!(config.sub_protocol, "recognize");
        assert_eq!(config.sample_rate, 16_000);
    }

    #[test]
    fn request_carries_sub_protocol_header() {
        let config = TransmitterConfig::new("ws://localhost:9000/", 16_000);
        let request = build_request(&config).expect("build request");
        assert_eq!(
            request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some("recognize")
        );
    }

    #[tokio::test]
    async fn send_before_open_returns_false() {
        let transmitter = Transmitter::new(
            TransmitterConfig::new("ws://localhost:9000/", 16_000),
            tokio::runtime::Handle::current(),
        );
        assert_eq!(transmitter.state(), ConnectionState::Unconnected);
        assert!(!transmitter.send_audio(&[0, 1, 2]));
        assert!(!transmitter.stop_recognize());
    }

    #[tokio::test]
    async fn close_when_never_connected_is_a_no_op() {
        let transmitter = Transmitter::new(
            TransmitterConfig::new("ws://localhost:9000/", 16_000),
            tokio::runtime::Handle::current(),
        );
        transmitter.close();
        transmitter.close();
        assert_eq!(transmitter.state(), ConnectionState::Unconnected);
    }
}
