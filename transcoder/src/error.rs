use thiserror::Error;

/// Errors from building or running a transcoder process.
///
/// Messages never include the credentialed RTSP URL.
#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("transcoder executable not found: {0}")]
    NotFound(String),

    #[error("failed to spawn transcoder: {0}")]
    SpawnFailed(String),

    #[error("transcoder stdout was not captured")]
    MissingPipe,

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("transcoder check failed: {0}")]
    Check(String),
}
