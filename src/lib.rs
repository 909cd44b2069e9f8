//! # voxwire
//!
//! Streaming voice capture: amplitude-threshold VAD segmentation with
//! WebSocket forwarding to a recognition endpoint.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureSource → capture thread (mutex'd segmentation loop)
//!                  │  AmplitudeVad: voiced / unvoiced
//!                  ├─ on_voice_start ─► Session ─► Transmitter::connect
//!                  ├─ on_voice ───────►         ─► binary PCM16LE frame
//!                  └─ on_voice_end ───►         ─► "stopRecognize"
//! ```
//!
//! The capture loop owns one reusable buffer and performs one bounded
//! blocking read per iteration; the transmitter's network I/O runs on tokio
//! tasks and every send is fire-and-forget.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod error;
pub mod recorder;
pub mod session;
pub mod transmit;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{CaptureSource, SourceFactory, WavSource};
pub use error::{Result, VoxwireError};
pub use recorder::{
    Clock, RecorderConfig, SystemClock, VoiceCallback, VoiceRecorder, SAMPLE_RATE_CANDIDATES,
};
pub use session::{Session, SessionConfig};
pub use transmit::{
    ConnectionEvents, ConnectionState, LogEvents, Transmitter, TransmitterConfig, STOP_RECOGNIZE,
    SUB_PROTOCOL,
};
pub use vad::{AmplitudeVad, VadDecision, VoiceActivityDetector};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalSource;
