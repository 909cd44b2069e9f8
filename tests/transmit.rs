//! Transmitter contract tests against a loopback WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use voxwire::{ConnectionEvents, ConnectionState, Transmitter, TransmitterConfig};

#[derive(Default)]
struct RecEvents {
    log: Mutex<Vec<String>>,
}

impl RecEvents {
    fn snapshot(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl ConnectionEvents for RecEvents {
    fn on_open(&self) {
        self.log.lock().push("open".into());
    }
    fn on_text(&self, text: &str) {
        self.log.lock().push(format!("text:{text}"));
    }
    fn on_binary(&self, payload: &[u8]) {
        self.log.lock().push(format!("binary:{}", payload.len()));
    }
    fn on_closing(&self, code: Option<u16>) {
        self.log.lock().push(format!("closing:{code:?}"));
    }
    fn on_failure(&self, error: &str) {
        self.log.lock().push(format!("failure:{error}"));
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct ServerResult {
    sub_protocol: Option<String>,
    messages: Vec<Message>,
    close_frames: usize,
    close_code: Option<u16>,
}

/// Accept one connection, record the handshake sub-protocol and every frame
/// until the peer closes.
async fn serve_one(listener: TcpListener) -> ServerResult {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut sub_protocol = None;
    let mut ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        sub_protocol = req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        // Echo the requested sub-protocol; tungstenite rejects the
        // handshake if the server does not confirm it (RFC 6455 §4.1).
        if let Some(proto) = req.headers().get("sec-websocket-protocol") {
            resp.headers_mut()
                .insert("sec-websocket-protocol", proto.clone());
        }
        Ok::<_, ErrorResponse>(resp)
    })
    .await
    .expect("websocket accept");

    let mut messages = Vec::new();
    let mut close_frames = 0;
    let mut close_code = None;
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Close(frame) => {
                close_frames += 1;
                close_code = frame.map(|f| u16::from(f.code));
            }
            other => messages.push(other),
        }
    }
    ServerResult {
        sub_protocol,
        messages,
        close_frames,
        close_code,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_frames_and_graceful_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(serve_one(listener));

    let events = Arc::new(RecEvents::default());
    let transmitter = Transmitter::with_events(
        TransmitterConfig::new(format!("ws://{addr}/"), 16_000),
        tokio::runtime::Handle::current(),
        Arc::clone(&events) as _,
    );

    transmitter.connect();
    wait_until(|| transmitter.is_open(), "connection open").await;
    assert!(events.snapshot().contains(&"open".to_string()));

    assert!(transmitter.send_audio(&[1, 2, 3]));
    assert!(transmitter.stop_recognize());

    transmitter.close();
    wait_until(
        || transmitter.state() == ConnectionState::Closed,
        "connection closed",
    )
    .await;

    // Closing again on an already-closed transmitter is a no-op and must
    // not produce a second close frame.
    transmitter.close();
    assert!(!transmitter.send_audio(&[9]));

    let result = server.await.expect("server task");
    assert_eq!(result.sub_protocol.as_deref(), Some("recognize"));
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.messages[0], Message::Binary(vec![1, 2, 3]));
    assert_eq!(
        result.messages[1],
        Message::Text("stopRecognize".to_string())
    );
    assert_eq!(result.close_frames, 1);
    assert_eq!(result.close_code, Some(1000));
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_idempotent_while_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(serve_one(listener));

    let transmitter = Transmitter::new(
        TransmitterConfig::new(format!("ws://{addr}/"), 16_000),
        tokio::runtime::Handle::current(),
    );
    transmitter.connect();
    wait_until(|| transmitter.is_open(), "connection open").await;

    // A second connect while open must not tear down or duplicate the
    // connection.
    transmitter.connect();
    assert!(transmitter.send_audio(&[7]));
    transmitter.close();
    let result = server.await.expect("server task");
    assert_eq!(result.messages, vec![Message::Binary(vec![7])]);
    assert_eq!(result.close_frames, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_refused_reports_failure_and_closes() {
    // Grab a free port, then drop the listener so nobody answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let events = Arc::new(RecEvents::default());
    let transmitter = Transmitter::with_events(
        TransmitterConfig::new(format!("ws://{addr}/"), 16_000),
        tokio::runtime::Handle::current(),
        Arc::clone(&events) as _,
    );
    transmitter.connect();
    wait_until(
        || transmitter.state() == ConnectionState::Closed,
        "connection closed",
    )
    .await;

    assert!(!transmitter.send_audio(&[1]));
    assert!(events
        .snapshot()
        .iter()
        .any(|e| e.starts_with("failure:")));
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_close_transitions_to_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
            // Echo the requested sub-protocol; tungstenite rejects the
            // handshake if the server does not confirm it (RFC 6455 §4.1).
            if let Some(proto) = req.headers().get("sec-websocket-protocol") {
                resp.headers_mut()
                    .insert("sec-websocket-protocol", proto.clone());
            }
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .expect("websocket accept");
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .expect("send close");
        // Drain until the close completes.
        while ws.next().await.is_some() {}
    });

    let events = Arc::new(RecEvents::default());
    let transmitter = Transmitter::with_events(
        TransmitterConfig::new(format!("ws://{addr}/"), 16_000),
        tokio::runtime::Handle::current(),
        Arc::clone(&events) as _,
    );
    transmitter.connect();
    wait_until(
        || transmitter.state() == ConnectionState::Closed,
        "connection closed",
    )
    .await;
    server.await.expect("server task");

    assert!(!transmitter.stop_recognize());
    assert!(events
        .snapshot()
        .contains(&"closing:Some(1000)".to_string()));
}
