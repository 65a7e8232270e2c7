use thiserror::Error;
use transcoder::TranscoderError;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("channel {0} is already recording")]
    AlreadyRecording(u32),

    #[error("channel {0} is not recording")]
    NotRecording(u32),

    #[error("disk is {usage_percent}% full")]
    DiskFull { usage_percent: u8 },

    #[error("recorder could not start: {0}")]
    Spawn(#[from] TranscoderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to get filesystem stats: {0}")]
    StatvfsFailed(String),

    #[error("invalid filesystem")]
    InvalidFilesystem,

    #[error("disk usage is not available on this platform")]
    Unsupported,
}
