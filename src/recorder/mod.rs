//! `VoiceRecorder` — continuous capture with amplitude-threshold utterance
//! segmentation.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceRecorder::new(config, callback)
//!     └─► start(factory)   → rate negotiated, capture thread spawned
//!         └─► stop()       → final on_voice_end flushed, thread joined,
//!                            device released
//! ```
//!
//! The capture thread performs one bounded blocking read per iteration and
//! classifies the buffer with [`AmplitudeVad`]. Per-utterance event order is
//! guaranteed: `on_voice_start` precedes every `on_voice` of that utterance,
//! which precede its `on_voice_end`; utterances never overlap, and every
//! start is matched by exactly one end — including when `stop()` lands
//! mid-utterance.
//!
//! ## Threading
//!
//! cpal streams are `!Send`, so the device is opened *on* the capture thread
//! through the [`SourceFactory`]; a bounded channel reports the negotiated
//! rate (or the failure) back to `start()`, which blocks until the open is
//! confirmed. Utterance state lives in one reentrant mutex shared with
//! `stop()`: callbacks are invoked synchronously from the capture thread
//! while that lock is held, and they may call `stop()` (the lock re-enters,
//! the join is skipped, and the loop exits at its next cancellation check).

use std::cell::RefCell;
use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use crate::audio::{CaptureSource, SourceFactory};
use crate::error::{Result, VoxwireError};
use crate::vad::{AmplitudeVad, VoiceActivityDetector};

/// Sample rates tried highest-priority-first; the first one the device
/// accepts wins.
pub const SAMPLE_RATE_CANDIDATES: [u32; 4] = [16_000, 44_100, 22_050, 11_025];

/// Capture buffers are rounded up to this many samples (8 KiB of PCM16).
const ALLOCATION_GRANULARITY: usize = 4096;

/// Sleep after an empty read before re-checking cancellation.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Utterance lifecycle notifications, delivered synchronously from the
/// capture thread.
pub trait VoiceCallback: Send + Sync + 'static {
    /// A new utterance began (no payload).
    fn on_voice_start(&self);

    /// One capture buffer of utterance audio: little-endian PCM16 mono.
    /// Also called for trailing silence inside the timeout window.
    fn on_voice(&self, pcm: &[u8]);

    /// The current utterance ended (silence timeout, max-length cutoff, or
    /// teardown).
    fn on_voice_end(&self);
}

/// Wall-clock seam so segmentation timing is testable.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Default clock backed by `Instant::now`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Configuration for `VoiceRecorder`.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Ordered sample-rate candidates. Default: 16000, 44100, 22050, 11025.
    pub sample_rate_candidates: Vec<u32>,
    /// Amplitude above which a sample counts as speech. Default: 3000.
    pub amplitude_threshold: i32,
    /// Unvoiced gap after which an utterance is considered ended.
    /// Default: 2 s.
    pub silence_timeout: Duration,
    /// Hard cutoff for a single utterance. Default: 30 s.
    pub max_utterance: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate_candidates: SAMPLE_RATE_CANDIDATES.to_vec(),
            amplitude_threshold: 3000,
            silence_timeout: Duration::from_millis(2000),
            max_utterance: Duration::from_secs(30),
        }
    }
}

/// Segmentation state. `last_voice_heard == None` is the "not currently
/// speaking" sentinel. Transitions happen only under the session lock.
struct UtteranceState {
    last_voice_heard: Option<Instant>,
    utterance_started: Option<Instant>,
    cancelled: bool,
}

/// The session lock. Reentrant so `stop()` works when a callback invokes it
/// on the capture thread, which already holds the lock; the `RefCell` borrow
/// is always scoped and never spans a callback dispatch.
type SessionLock = ReentrantMutex<RefCell<UtteranceState>>;

/// The capture & segmentation engine.
///
/// `VoiceRecorder` is `Send + Sync` — all fields use interior mutability, so
/// `stop()` may be called from any thread.
pub struct VoiceRecorder {
    config: RecorderConfig,
    callback: Arc<dyn VoiceCallback>,
    clock: Arc<dyn Clock>,
    state: Arc<SessionLock>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Negotiated rate; 0 while no session is active.
    sample_rate: Arc<AtomicU32>,
    /// Allocated capture buffer length in samples; 0 while inactive.
    buffer_len: Arc<AtomicUsize>,
}

impl VoiceRecorder {
    pub fn new(config: RecorderConfig, callback: Arc<dyn VoiceCallback>) -> Self {
        Self::with_clock(config, callback, Arc::new(SystemClock))
    }

    /// Recorder with an injected time source (used by tests to drive the
    /// silence-timeout and max-utterance transitions deterministically).
    pub fn with_clock(
        config: RecorderConfig,
        callback: Arc<dyn VoiceCallback>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            callback,
            clock,
            state: Arc::new(ReentrantMutex::new(RefCell::new(UtteranceState {
                last_voice_heard: None,
                utterance_started: None,
                cancelled: false,
            }))),
            thread: Mutex::new(None),
            sample_rate: Arc::new(AtomicU32::new(0)),
            buffer_len: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Negotiate a device configuration and start the capture thread.
    ///
    /// Blocks until the device is confirmed open (or every candidate rate
    /// failed), then returns; capture continues on the background thread.
    ///
    /// # Errors
    /// - `VoxwireError::AlreadyRunning` if a session is active.
    /// - `VoxwireError::NoViableSampleRate` if no candidate was accepted.
    pub fn start(&self, factory: SourceFactory) -> Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Err(VoxwireError::AlreadyRunning);
        }

        {
            let session = self.state.lock();
            let mut state = session.borrow_mut();
            state.cancelled = false;
            state.last_voice_heard = None;
            state.utterance_started = None;
        }

        // Capture thread reports (rate, buffer_len) or the open error.
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<(u32, usize)>>(1);

        let config = self.config.clone();
        let callback = Arc::clone(&self.callback);
        let clock = Arc::clone(&self.clock);
        let state = Arc::clone(&self.state);
        let sample_rate = Arc::clone(&self.sample_rate);
        let buffer_len = Arc::clone(&self.buffer_len);

        let handle = std::thread::Builder::new()
            .name("voxwire-capture".into())
            .spawn(move || {
                // Device must be opened on this thread — the stream handle
                // is not Send.
                let mut source = factory();
                let (rate, len) = match negotiate(source.as_mut(), &config.sample_rate_candidates)
                {
                    Ok(picked) => {
                        let _ = open_tx.send(Ok(picked));
                        picked
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                info!(rate, buffer_len = len, "capture session started");
                run_loop(LoopContext {
                    config,
                    callback,
                    clock,
                    state,
                    source: source.as_mut(),
                    buffer_len: len,
                });

                // Loop exit releases the device and drops the buffer before
                // stop()'s join returns.
                source.release();
                sample_rate.store(0, Ordering::SeqCst);
                buffer_len.store(0, Ordering::SeqCst);
                info!("capture session ended");
            })?;

        match open_rx.recv() {
            Ok(Ok((rate, len))) => {
                self.sample_rate.store(rate, Ordering::SeqCst);
                self.buffer_len.store(len, Ordering::SeqCst);
                *slot = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoxwireError::Other(anyhow::anyhow!(
                    "capture thread died before confirming device open"
                )))
            }
        }
    }

    /// Stop the session. Idempotent; callable from any thread, including
    /// before `start`, after a prior `stop`, or from inside a
    /// [`VoiceCallback`] method (the session lock is reentrant).
    ///
    /// If an utterance is in flight the final `on_voice_end` is emitted
    /// here, so every `on_voice_start` is matched even on abrupt teardown.
    /// No further callback fires after this returns.
    pub fn stop(&self) {
        {
            let session = self.state.lock();
            let was_speaking = {
                let mut state = session.borrow_mut();
                let speaking = state.last_voice_heard.is_some();
                state.last_voice_heard = None;
                state.utterance_started = None;
                state.cancelled = true;
                speaking
            };
            if was_speaking {
                self.callback.on_voice_end();
            }
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // Joining from the capture thread itself would deadlock; the
            // loop is already past its cancellation check in that case.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        self.sample_rate.store(0, Ordering::SeqCst);
        self.buffer_len.store(0, Ordering::SeqCst);
    }

    /// Negotiated sample rate in Hz, or 0 when no session is active.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    /// Capture buffer length in samples, or 0 when no session is active.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len.load(Ordering::SeqCst)
    }
}

/// Try each candidate rate in priority order: probe the minimum buffer,
/// skip rejected configurations, open the first accepted rate.
fn negotiate(source: &mut dyn CaptureSource, candidates: &[u32]) -> Result<(u32, usize)> {
    for &rate in candidates {
        let Some(min_len) = source.min_buffer_len(rate) else {
            debug!(rate, "candidate rejected by device");
            continue;
        };
        match source.open(rate) {
            Ok(()) => {
                let len = round_up(min_len * 4, ALLOCATION_GRANULARITY);
                return Ok((rate, len));
            }
            Err(e) => {
                warn!(rate, "device open failed: {e}");
                source.release();
            }
        }
    }
    Err(VoxwireError::NoViableSampleRate)
}

fn round_up(len: usize, granularity: usize) -> usize {
    len.div_ceil(granularity) * granularity
}

struct LoopContext<'a> {
    config: RecorderConfig,
    callback: Arc<dyn VoiceCallback>,
    clock: Arc<dyn Clock>,
    state: Arc<SessionLock>,
    source: &'a mut dyn CaptureSource,
    buffer_len: usize,
}

/// The processing loop: one bounded blocking read per iteration, classify,
/// then run the segmentation transition — all under the session lock.
///
/// A callback may call `stop()`, which re-enters the lock, flushes the
/// final `on_voice_end` and sets the cancelled flag; the flag is therefore
/// re-checked after every dispatch so no further event follows it.
fn run_loop(ctx: LoopContext<'_>) {
    let mut buffer = vec![0i16; ctx.buffer_len];
    let mut bytes: Vec<u8> = Vec::with_capacity(ctx.buffer_len * 2);
    let mut vad: Box<dyn VoiceActivityDetector> =
        Box::new(AmplitudeVad::new(ctx.config.amplitude_threshold));
    vad.reset();

    loop {
        let session = ctx.state.lock();
        if session.borrow().cancelled {
            break;
        }

        let n = match ctx.source.read(&mut buffer) {
            Ok(n) => n,
            Err(e) => {
                // Mid-session device failure: implicit orderly stop.
                warn!("capture read failed, ending session: {e}");
                let was_speaking = {
                    let mut state = session.borrow_mut();
                    let speaking = state.last_voice_heard.is_some();
                    state.last_voice_heard = None;
                    state.utterance_started = None;
                    speaking
                };
                if was_speaking {
                    ctx.callback.on_voice_end();
                }
                break;
            }
        };
        let now = ctx.clock.now();

        if n == 0 {
            drop(session);
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        bytes.clear();
        for sample in &buffer[..n] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        if vad.classify(&bytes).is_voiced() {
            let starting = {
                let mut state = session.borrow_mut();
                let starting = state.last_voice_heard.is_none();
                if starting {
                    state.utterance_started = Some(now);
                }
                state.last_voice_heard = Some(now);
                starting
            };
            if starting {
                ctx.callback.on_voice_start();
                if session.borrow().cancelled {
                    break;
                }
            }
            ctx.callback.on_voice(&bytes);
            if session.borrow().cancelled {
                break;
            }
            let cutoff = {
                let mut state = session.borrow_mut();
                match state.utterance_started {
                    Some(started) if now.duration_since(started) > ctx.config.max_utterance => {
                        state.last_voice_heard = None;
                        state.utterance_started = None;
                        true
                    }
                    _ => false,
                }
            };
            if cutoff {
                debug!("utterance hit max length");
                ctx.callback.on_voice_end();
            }
        } else {
            // The borrow must not span a dispatch; copy the timestamp out.
            let last = session.borrow().last_voice_heard;
            if let Some(last) = last {
                // Trailing silence is still part of the utterance and is
                // forwarded until the timeout trips.
                ctx.callback.on_voice(&bytes);
                if session.borrow().cancelled {
                    break;
                }
                if now.duration_since(last) > ctx.config.silence_timeout {
                    debug!("silence timeout");
                    {
                        let mut state = session.borrow_mut();
                        state.last_voice_heard = None;
                        state.utterance_started = None;
                    }
                    ctx.callback.on_voice_end();
                }
            }
        }
        // Unvoiced while not speaking: no event, no forwarding.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_granularity() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(6400, 4096), 8192);
    }

    #[test]
    fn default_config_matches_segmentation_constants() {
        let config = RecorderConfig::default();
        assert_eq!(config.sample_rate_candidates, SAMPLE_RATE_CANDIDATES);
        assert_eq!(config.amplitude_threshold, 3000);
        assert_eq!(config.silence_timeout, Duration::from_millis(2000));
        assert_eq!(config.max_utterance, Duration::from_secs(30));
    }

    struct RejectAll;

    impl CaptureSource for RejectAll {
        fn min_buffer_len(&self, _sample_rate: u32) -> Option<usize> {
            None
        }
        fn open(&mut self, _sample_rate: u32) -> crate::error::Result<()> {
            panic!("open must not be called for rejected candidates");
        }
        fn read(&mut self, _buf: &mut [i16]) -> crate::error::Result<usize> {
            Ok(0)
        }
        fn release(&mut self) {}
    }

    struct SecondRateOnly {
        opened: Option<u32>,
    }

    impl CaptureSource for SecondRateOnly {
        fn min_buffer_len(&self, sample_rate: u32) -> Option<usize> {
            (sample_rate == 44_100).then_some(4410)
        }
        fn open(&mut self, sample_rate: u32) -> crate::error::Result<()> {
            self.opened = Some(sample_rate);
            Ok(())
        }
        fn read(&mut self, _buf: &mut [i16]) -> crate::error::Result<usize> {
            Ok(0)
        }
        fn release(&mut self) {}
    }

    #[test]
    fn negotiate_fails_when_no_candidate_is_viable() {
        let mut source = RejectAll;
        let result = negotiate(&mut source, &SAMPLE_RATE_CANDIDATES);
        assert!(matches!(result, Err(VoxwireError::NoViableSampleRate)));
    }

    #[test]
    fn negotiate_skips_rejected_candidates() {
        let mut source = SecondRateOnly { opened: None };
        let (rate, len) = negotiate(&mut source, &SAMPLE_RATE_CANDIDATES).expect("negotiate");
        assert_eq!(rate, 44_100);
        assert_eq!(source.opened, Some(44_100));
        // 4410 * 4 = 17640, rounded up to the next 4096 boundary.
        assert_eq!(len, 20_480);
    }
}
