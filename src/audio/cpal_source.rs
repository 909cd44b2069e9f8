//! Live microphone capture via the cpal backend.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapRb,
};
use tracing::{error, info, warn};

use crate::audio::CaptureSource;
use crate::error::{Result, VoxwireError};

/// Ring capacity: 2^20 i16 samples ≈ 65 s at 16 kHz, ≈ 23 s at 44.1 kHz.
const RING_CAPACITY: usize = 1 << 20;

/// How long one `read` call polls the ring before giving up with `Ok(0)`.
const READ_POLL_WINDOW: Duration = Duration::from_millis(200);

/// Sleep between ring polls (avoids busy-wait burning a core).
const POLL_SLEEP: Duration = Duration::from_millis(5);

/// Microphone input source.
///
/// **Not `Send`** — the underlying `cpal::Stream` is bound to its creation
/// thread on Windows/macOS. Construct through a [`crate::audio::SourceFactory`]
/// so the stream lives entirely on the capture thread.
pub struct CpalSource {
    preferred_device_name: Option<String>,
    /// Kept alive so the stream is not dropped prematurely.
    stream: Option<Stream>,
    consumer: Option<HeapCons<i16>>,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Set by the cpal error callback on a hard stream failure.
    failed: Arc<AtomicBool>,
}

impl CpalSource {
    /// Source backed by the system default input device.
    pub fn new() -> Self {
        Self::with_preference(None)
    }

    /// Source backed by a named input device, falling back to the default
    /// input and then the first available device.
    pub fn with_preference(preferred_device_name: Option<String>) -> Self {
        Self {
            preferred_device_name,
            stream: None,
            consumer: None,
            running: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn resolve_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let mut selected = None;

        if let Some(preferred) = self.preferred_device_name.as_deref() {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices
                        .find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred input device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        if let Some(device) = selected {
            return Ok(device);
        }
        if let Some(default) = host.default_input_device() {
            return Ok(default);
        }
        let mut devices = host
            .input_devices()
            .map_err(|e| VoxwireError::AudioDevice(e.to_string()))?;
        let fallback = devices
            .next()
            .ok_or_else(|| VoxwireError::AudioDevice("no input device available".into()))?;
        warn!("no default input device, falling back to first available input");
        Ok(fallback)
    }

    /// Find a supported stream configuration carrying `sample_rate`.
    fn supported_config_for(
        device: &cpal::Device,
        sample_rate: u32,
    ) -> Option<cpal::SupportedStreamConfig> {
        let ranges = device.supported_input_configs().ok()?;
        for range in ranges {
            if let Some(config) = range.try_with_sample_rate(SampleRate(sample_rate)) {
                return Some(config);
            }
        }
        None
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for CpalSource {
    fn min_buffer_len(&self, sample_rate: u32) -> Option<usize> {
        let device = self.resolve_device().ok()?;
        Self::supported_config_for(&device, sample_rate)?;
        // cpal has no driver-minimum query; 100 ms of samples stands in for
        // the minimum viable read size.
        Some((sample_rate / 10) as usize)
    }

    fn open(&mut self, sample_rate: u32) -> Result<()> {
        let device = self.resolve_device()?;
        let supported = Self::supported_config_for(&device, sample_rate).ok_or_else(|| {
            VoxwireError::AudioDevice(format!("{sample_rate} Hz not supported by input device"))
        })?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate, "opening input device"
        );

        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut producer, consumer) = HeapRb::<i16>::new(RING_CAPACITY).split();

        self.running.store(true, Ordering::Release);
        self.failed.store(false, Ordering::Release);

        let running = Arc::clone(&self.running);
        let err_failed = Arc::clone(&self.failed);
        let err_cb = move |err: cpal::StreamError| {
            error!("audio stream error: {err}");
            err_failed.store(true, Ordering::Release);
        };

        let ch = channels as usize;
        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            push_all(&mut producer, data);
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0);
                        for f in 0..frames {
                            let mut sum = 0i32;
                            let base = f * ch;
                            for c in 0..ch {
                                sum += i32::from(data[base + c]);
                            }
                            mix_buf[f] = (sum / ch as i32) as i16;
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_cb,
                    None,
                )
            }

            SampleFormat::F32 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0);
                        for f in 0..frames {
                            let mut sum = 0f32;
                            let base = f * ch;
                            for c in 0..ch {
                                sum += data[base + c];
                            }
                            mix_buf[f] = to_i16(sum / ch as f32);
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_cb,
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0);
                        for f in 0..frames {
                            let mut sum = 0i32;
                            let base = f * ch;
                            for c in 0..ch {
                                sum += (i32::from(data[base + c]) - 128) << 8;
                            }
                            mix_buf[f] = (sum / ch as i32) as i16;
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_cb,
                    None,
                )
            }

            fmt => {
                return Err(VoxwireError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxwireError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VoxwireError::AudioStream(e.to_string()))?;

        self.stream = Some(stream);
        self.consumer = Some(consumer);
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| VoxwireError::AudioStream("source is not open".into()))?;

        let deadline = Instant::now() + READ_POLL_WINDOW;
        let mut filled = 0;
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(VoxwireError::AudioStream("input stream failed".into()));
            }
            filled += consumer.pop_slice(&mut buf[filled..]);
            if filled == buf.len() {
                return Ok(filled);
            }
            if Instant::now() >= deadline {
                return Ok(filled);
            }
            std::thread::sleep(POLL_SLEEP);
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        self.stream = None;
        self.consumer = None;
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn push_all(producer: &mut ringbuf::HeapProd<i16>, data: &[i16]) {
    let written = producer.push_slice(data);
    if written < data.len() {
        warn!("ring buffer full: dropped {} samples", data.len() - written);
    }
}
