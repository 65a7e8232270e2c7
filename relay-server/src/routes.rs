use axum::{
    extract::{Path, State},
    Json,
};
use dvr_recorder::{ActiveRecording, RecordedFile};
use live_stream::ActiveStream;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;

/// A configured DVR channel and whether it is being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub id: u32,
    pub name: String,
    pub recording: bool,
}

/// Reply to recording start/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingReply {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub ffmpeg: String,
    pub live_sessions: usize,
    pub recordings: usize,
}

/// `GET /api/channels`
pub async fn channels_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelStatus>> {
    let mut channels = Vec::with_capacity(state.config.dvr.channels.len());
    for channel in &state.config.dvr.channels {
        channels.push(ChannelStatus {
            id: channel.id,
            name: channel.name.clone(),
            recording: state.recordings.is_recording(channel.id).await,
        });
    }
    Json(channels)
}

/// `GET /api/streams`
pub async fn streams_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ActiveStream>> {
    Json(state.streams.active_streams().await)
}

/// `GET /api/recordings`
pub async fn recordings_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ActiveRecording>> {
    Json(state.recordings.active_recordings().await)
}

/// `GET /api/recordings/files`
pub async fn recorded_files_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RecordedFile>>, ApiError> {
    Ok(Json(state.recordings.list_recorded_files().await?))
}

/// `POST /api/recordings/{channel}/start`
pub async fn start_recording_handler(
    Path(channel): Path<u32>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RecordingReply>, ApiError> {
    let name = state.config.dvr.channel_name(channel);
    let started = state.recordings.start_recording(channel, &name).await?;
    Ok(Json(RecordingReply {
        success: true,
        message: started.message(),
        file_path: Some(started.file_path.display().to_string()),
    }))
}

/// `POST /api/recordings/{channel}/stop`
pub async fn stop_recording_handler(
    Path(channel): Path<u32>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RecordingReply>, ApiError> {
    let stopped = state.recordings.stop_recording(channel).await?;
    Ok(Json(RecordingReply {
        success: true,
        message: stopped.message(),
        file_path: Some(stopped.file_path.display().to_string()),
    }))
}

/// `GET /api/health`
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<Health>, ApiError> {
    let ffmpeg = transcoder::ffmpeg_version(&state.config.transcoder.ffmpeg_path)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(Health {
        status: "ok",
        ffmpeg,
        live_sessions: state.streams.active_streams().await.len(),
        recordings: state.recordings.active_recordings().await.len(),
    }))
}
