//! Voice activity detection over raw PCM16LE byte buffers.
//!
//! The `VoiceActivityDetector` trait is the extensibility point: swap in
//! `AmplitudeVad` (default) or any future detector without touching the
//! capture loop.

/// Whether a given capture buffer contains speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// At least one sample exceeded the detector's threshold.
    Voiced,
    /// Nothing above threshold.
    Unvoiced,
}

impl VadDecision {
    pub fn is_voiced(self) -> bool {
        self == VadDecision::Voiced
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful. The buffer is little-endian 16-bit linear
/// PCM, mono, as produced by the capture loop.
pub trait VoiceActivityDetector: Send + 'static {
    /// Classify one capture buffer.
    fn classify(&mut self, pcm: &[u8]) -> VadDecision;

    /// Reset any internal state between sessions.
    fn reset(&mut self);
}

/// Fixed amplitude-threshold detector.
///
/// Scans consecutive byte pairs and reconstructs a signed 16-bit magnitude
/// per sample: `abs(hi) << 8 + abs(lo)`. A buffer is voiced as soon as one
/// sample's magnitude exceeds the threshold. The threshold is a plain
/// integer constant, not derived from signal statistics.
#[derive(Debug, Clone)]
pub struct AmplitudeVad {
    /// Magnitude above which a sample counts as speech.
    /// Typical value: 3000 for a close-talking microphone.
    threshold: i32,
}

impl AmplitudeVad {
    pub fn new(threshold: i32) -> Self {
        Self { threshold }
    }

    /// Approximate magnitude of one little-endian sample pair.
    fn magnitude(lo: u8, hi: u8) -> i32 {
        ((i32::from(hi as i8)).abs() << 8) + (i32::from(lo as i8)).abs()
    }
}

impl VoiceActivityDetector for AmplitudeVad {
    fn classify(&mut self, pcm: &[u8]) -> VadDecision {
        for pair in pcm.chunks_exact(2) {
            if Self::magnitude(pair[0], pair[1]) > self.threshold {
                return VadDecision::Voiced;
            }
        }
        VadDecision::Unvoiced
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn all_zero_buffer_is_never_voiced() {
        let mut vad = AmplitudeVad::new(3000);
        assert_eq!(vad.classify(&[0u8; 1024]), VadDecision::Unvoiced);
    }

    #[test]
    fn single_loud_sample_is_voiced() {
        let mut vad = AmplitudeVad::new(3000);
        let mut samples = vec![0i16; 160];
        samples[80] = 3100;
        assert_eq!(vad.classify(&bytes_of(&samples)), VadDecision::Voiced);
    }

    #[test]
    fn negative_samples_count_by_magnitude() {
        let mut vad = AmplitudeVad::new(3000);
        let samples = vec![-3500i16; 4];
        assert_eq!(vad.classify(&bytes_of(&samples)), VadDecision::Voiced);
    }

    #[test]
    fn threshold_is_exclusive() {
        let mut vad = AmplitudeVad::new(3000);
        // magnitude = abs(hi) << 8 + abs(lo): (11 << 8) + 127 = 2943
        assert_eq!(vad.classify(&[127u8, 11u8]), VadDecision::Unvoiced);
        // 12 << 8 = 3072
        assert_eq!(vad.classify(&[0u8, 12u8]), VadDecision::Voiced);
    }

    #[test]
    fn trailing_odd_byte_is_ignored() {
        let mut vad = AmplitudeVad::new(3000);
        // Last byte has no partner and must not be interpreted as a sample.
        assert_eq!(vad.classify(&[0, 0, 0x7f]), VadDecision::Unvoiced);
    }

    #[test]
    fn empty_buffer_is_unvoiced() {
        let mut vad = AmplitudeVad::new(3000);
        assert_eq!(vad.classify(&[]), VadDecision::Unvoiced);
    }
}
