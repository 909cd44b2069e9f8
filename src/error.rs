use thiserror::Error;

/// All errors produced by voxwire.
#[derive(Debug, Error)]
pub enum VoxwireError {
    #[error("no sample-rate candidate was accepted by the capture device")]
    NoViableSampleRate,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxwireError>;
