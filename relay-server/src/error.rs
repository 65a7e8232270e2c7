use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dvr_recorder::RecordingError;
use live_stream::StreamError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Recording(#[from] RecordingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Stream(e) => match e {
                StreamError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                StreamError::Spawn(_) | StreamError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Recording(e) => match e {
                RecordingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                RecordingError::AlreadyRecording(_) | RecordingError::NotRecording(_) => {
                    StatusCode::CONFLICT
                }
                RecordingError::DiskFull { .. } => StatusCode::INSUFFICIENT_STORAGE,
                RecordingError::Spawn(_) => StatusCode::SERVICE_UNAVAILABLE,
                RecordingError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Text shown to the client. Internal failures are not described.
    pub fn message(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("API error: {}", self);
        } else {
            tracing::debug!("API error: {}", self);
        }

        let body = ErrorBody {
            success: false,
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}
