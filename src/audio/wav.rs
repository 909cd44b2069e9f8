//! WAV-file replay source.
//!
//! Feeds a recorded file through the capture loop as if it were a live
//! microphone, pacing reads to real time so the segmentation timeouts
//! behave as they would on hardware.

use std::path::Path;
use std::time::Duration;

use hound::SampleFormat;
use tracing::info;

use crate::audio::CaptureSource;
use crate::error::{Result, VoxwireError};

/// Sleep when the file is exhausted, before returning an empty read.
const DRAINED_SLEEP: Duration = Duration::from_millis(20);

pub struct WavSource {
    samples: Vec<i16>,
    pos: usize,
    sample_rate: u32,
    /// When set, `read` sleeps for the duration of the samples it returns.
    paced: bool,
}

impl WavSource {
    /// Load a WAV file, downmixing to mono. 16-bit integer and 32-bit float
    /// files are accepted.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut reader =
            hound::WavReader::open(path).map_err(|e| VoxwireError::AudioDevice(e.to_string()))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoxwireError::AudioDevice(e.to_string()))?,
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoxwireError::AudioDevice(e.to_string()))?,
            (format, bits) => {
                return Err(VoxwireError::AudioDevice(format!(
                    "unsupported WAV format: {bits}-bit {format:?}"
                )))
            }
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                    (sum / channels as i32) as i16
                })
                .collect()
        };

        info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            samples = samples.len(),
            "loaded WAV source"
        );

        Ok(Self {
            samples,
            pos: 0,
            sample_rate: spec.sample_rate,
            paced: true,
        })
    }

    /// The file's native sample rate — the only rate this source accepts.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Disable real-time pacing (reads return as fast as possible).
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl CaptureSource for WavSource {
    fn min_buffer_len(&self, sample_rate: u32) -> Option<usize> {
        (sample_rate == self.sample_rate).then_some((sample_rate / 10) as usize)
    }

    fn open(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate != self.sample_rate {
            return Err(VoxwireError::AudioDevice(format!(
                "WAV source is {} Hz, not {sample_rate} Hz",
                self.sample_rate
            )));
        }
        self.pos = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let remaining = self.samples.len() - self.pos;
        if remaining == 0 {
            std::thread::sleep(DRAINED_SLEEP);
            return Ok(0);
        }
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        if self.paced {
            std::thread::sleep(Duration::from_secs_f64(
                n as f64 / f64::from(self.sample_rate),
            ));
        }
        Ok(n)
    }

    fn release(&mut self) {
        self.pos = self.samples.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for &s in samples {
            writer.write_sample(s).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn mono_file_round_trips() {
        let path = std::env::temp_dir().join("voxwire-wav-mono-test.wav");
        write_wav(&path, 1, &[100, -200, 300, -400]);

        let mut source = WavSource::from_path(&path).expect("load wav").unpaced();
        assert_eq!(source.sample_rate(), 16_000);
        assert_eq!(source.min_buffer_len(16_000), Some(1600));
        assert_eq!(source.min_buffer_len(44_100), None);

        source.open(16_000).expect("open");
        let mut buf = [0i16; 8];
        let n = source.read(&mut buf).expect("read");
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[100, -200, 300, -400]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stereo_file_downmixes_to_mono() {
        let path = std::env::temp_dir().join("voxwire-wav-stereo-test.wav");
        write_wav(&path, 2, &[1000, 2000, -1000, -3000]);

        let mut source = WavSource::from_path(&path).expect("load wav").unpaced();
        source.open(16_000).expect("open");
        let mut buf = [0i16; 4];
        let n = source.read(&mut buf).expect("read");
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[1500, -2000]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_rejects_foreign_rate() {
        let path = std::env::temp_dir().join("voxwire-wav-rate-test.wav");
        write_wav(&path, 1, &[0; 4]);

        let mut source = WavSource::from_path(&path).expect("load wav");
        assert!(source.open(44_100).is_err());

        let _ = std::fs::remove_file(&path);
    }
}
