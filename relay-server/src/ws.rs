use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use live_stream::{Quality, ViewerEvent};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// Raw `/ws/live` query. Every field is required; there are no defaults.
#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    pub channel: Option<String>,
    pub quality: Option<String>,
    pub audio: Option<String>,
}

/// The stream a viewer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveTarget {
    pub channel_id: u32,
    pub quality: Quality,
    pub audio: bool,
}

impl LiveQuery {
    pub fn parse(&self) -> Result<LiveTarget, ApiError> {
        let channel = required(&self.channel, "channel")?;
        let channel_id = channel
            .parse::<u32>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid channel: {}", channel)))?;

        let quality = required(&self.quality, "quality")?
            .parse::<Quality>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let audio = match required(&self.audio, "audio")?.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => return Err(ApiError::BadRequest(format!("invalid audio flag: {}", other))),
        };

        Ok(LiveTarget {
            channel_id,
            quality,
            audio,
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("missing query parameter: {}", name))),
    }
}

/// `GET /ws/live?channel=3&quality=low&audio=false`
pub async fn live_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<LiveQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let target = query.parse()?;
    Ok(ws.on_upgrade(move |socket| handle_viewer(socket, state, target)))
}

/// Attach one browser to a shared live session until either side ends it.
async fn handle_viewer(socket: WebSocket, state: Arc<AppState>, target: LiveTarget) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (viewer, mut feed) = state.streams.viewer();
    let viewer_id = viewer.id();

    if let Err(e) = state
        .streams
        .subscribe(viewer, target.channel_id, target.quality, target.audio)
        .await
    {
        tracing::warn!("Live view of channel {} refused: {}", target.channel_id, e);
        let _ = ws_tx
            .send(Message::Close(Some(close_frame(close_code::ERROR, &e.to_string()))))
            .await;
        return;
    }

    loop {
        tokio::select! {
            event = feed.recv() => match event {
                Some(ViewerEvent::Frame(chunk)) => {
                    if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(ViewerEvent::Ended(reason)) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(close_frame(close_code::AWAY, &reason))))
                        .await;
                    break;
                }
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Viewers only listen
                Some(Ok(_)) => {}
            },
        }
    }

    state
        .streams
        .unsubscribe(viewer_id, target.channel_id, target.quality, target.audio)
        .await;
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    }
}
