use thiserror::Error;
use transcoder::TranscoderError;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transcoder could not start: {0}")]
    Spawn(#[from] TranscoderError),

    #[error("relay is shutting down")]
    ShuttingDown,
}
