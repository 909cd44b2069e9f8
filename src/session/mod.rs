//! `Session` — the only component holding both the recorder and the
//! transmitter.
//!
//! Wiring: utterance-start → `connect()` (idempotent, so a connection
//! dropped mid-session is re-established at the next utterance); per-buffer
//! audio → one binary frame; utterance-end → the `stopRecognize` control
//! message. The transmitter is constructed once per session from the
//! negotiated sample rate, and the connection is opened eagerly at session
//! start since it is expected to be long-lived.
//!
//! Engine callbacks arrive on the capture thread and transmitter state
//! changes on network tasks; the relay therefore only calls the
//! transmitter's thread-safe, non-blocking operations and tolerates sends
//! racing a close (they just report a drop).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tracing::{debug, info, warn};

use crate::audio::SourceFactory;
use crate::error::Result;
use crate::recorder::{RecorderConfig, VoiceCallback, VoiceRecorder};
use crate::transmit::{Transmitter, TransmitterConfig, SUB_PROTOCOL};

/// Configuration for a capture/transmit session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Recognition endpoint, e.g. `ws://192.168.10.24/`.
    pub endpoint: String,
    /// Handshake sub-protocol token. Default: `recognize`.
    pub sub_protocol: String,
    pub recorder: RecorderConfig,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sub_protocol: SUB_PROTOCOL.to_string(),
            recorder: RecorderConfig::default(),
        }
    }
}

/// Forwards recorder events to transmitter operations.
///
/// The transmitter is bound right after rate negotiation (it is built from
/// the negotiated rate); until then events are dropped with a debug log.
#[derive(Default)]
struct Relay {
    transmitter: OnceLock<Arc<Transmitter>>,
}

impl Relay {
    fn bind(&self, transmitter: Arc<Transmitter>) {
        let _ = self.transmitter.set(transmitter);
    }
}

impl VoiceCallback for Relay {
    fn on_voice_start(&self) {
        debug!("utterance started");
        if let Some(transmitter) = self.transmitter.get() {
            transmitter.connect();
        }
    }

    fn on_voice(&self, pcm: &[u8]) {
        if let Some(transmitter) = self.transmitter.get() {
            if !transmitter.send_audio(pcm) {
                debug!("dropped {} bytes: connection not open", pcm.len());
            }
        }
    }

    fn on_voice_end(&self) {
        debug!("utterance ended");
        if let Some(transmitter) = self.transmitter.get() {
            if !transmitter.stop_recognize() {
                warn!("could not send stopRecognize: connection not open");
            }
        }
    }
}

/// One active capture/transmit pipeline. Recorder and transmitter live and
/// die together.
pub struct Session {
    recorder: VoiceRecorder,
    transmitter: Arc<Transmitter>,
    stopped: AtomicBool,
}

impl Session {
    /// Negotiate the device, build the transmitter from the negotiated
    /// rate, open the connection, and start capturing.
    ///
    /// # Errors
    /// Propagates recorder start failures (`NoViableSampleRate`,
    /// `AlreadyRunning`, device errors). Connection establishment is
    /// asynchronous and does not fail `start`.
    pub fn start(
        config: SessionConfig,
        factory: SourceFactory,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        let relay = Arc::new(Relay::default());
        let recorder = VoiceRecorder::new(config.recorder, Arc::clone(&relay) as _);
        recorder.start(factory)?;

        let transmitter_config = TransmitterConfig {
            endpoint: config.endpoint,
            sub_protocol: config.sub_protocol,
            sample_rate: recorder.sample_rate(),
        };
        let transmitter = Arc::new(Transmitter::new(transmitter_config, runtime));
        relay.bind(Arc::clone(&transmitter));
        transmitter.connect();

        info!(sample_rate = recorder.sample_rate(), "session started");
        Ok(Self {
            recorder,
            transmitter,
            stopped: AtomicBool::new(false),
        })
    }

    /// Tear down the pipeline: recorder first — flushing the final
    /// `on_voice_end`/`stopRecognize` pair — then the connection.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.recorder.stop();
        self.transmitter.close();
        info!("session stopped");
    }

    /// Negotiated sample rate, or 0 once stopped.
    pub fn sample_rate(&self) -> u32 {
        self.recorder.sample_rate()
    }

    /// The session's transmitter (state inspection; sends go through the
    /// relay).
    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
