//! Audio input sources.
//!
//! The capture loop talks to the device through the `CaptureSource` trait:
//! probe whether a `(rate, mono, 16-bit PCM)` configuration is viable, open
//! the device at one rate, then perform bounded blocking reads. Two
//! implementations ship with the crate:
//!
//! - [`CpalSource`] — live microphone input via cpal. The cpal input
//!   callback runs on an OS audio thread at elevated priority and must not
//!   allocate, block, or perform I/O; it writes into a lock-free SPSC ring
//!   buffer that `read` drains.
//! - [`WavSource`] — replays a WAV file at capture pace, for demos and
//!   offline runs.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS), so a source is created *by* the capture thread through a
//! [`SourceFactory`] and never crosses a thread boundary afterwards.

#[cfg(feature = "audio-cpal")]
pub mod cpal_source;
pub mod wav;

#[cfg(feature = "audio-cpal")]
pub use cpal_source::CpalSource;
pub use wav::WavSource;

use crate::error::Result;

/// Collaborator boundary for a microphone-class input device.
///
/// Implementations are used from a single thread (the capture thread); they
/// do not need to be `Send`.
pub trait CaptureSource {
    /// Probe whether the device can allocate a buffer for
    /// `(sample_rate, mono, 16-bit PCM)`.
    ///
    /// Returns the minimum viable buffer length in samples, or `None` when
    /// the driver rejects the configuration as invalid. A `None` here means
    /// "skip this candidate", not an error.
    fn min_buffer_len(&self, sample_rate: u32) -> Option<usize>;

    /// Open the device at `sample_rate` and begin capturing.
    ///
    /// # Errors
    /// Device-open failures bubble up so the caller can try the next
    /// sample-rate candidate.
    fn open(&mut self, sample_rate: u32) -> Result<()>;

    /// Blocking read of up to `buf.len()` samples.
    ///
    /// The wait is bounded: when no data arrives within the source's poll
    /// window, `Ok(0)` is returned so the caller can re-check cancellation.
    /// A hard device failure (stream revoked, permission withdrawn) returns
    /// an error.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;

    /// Stop capturing and release the device. Idempotent.
    fn release(&mut self);
}

/// Constructor for a capture source, invoked on the capture thread.
pub type SourceFactory = Box<dyn FnOnce() -> Box<dyn CaptureSource> + Send>;
