//! HTTP and WebSocket front end of the DVR relay.
//!
//! ```text
//! Browser <--WS (MPEG-TS)--> relay-server <--ffmpeg--> DVR (RTSP)
//! ```
//!
//! Live viewers connect to `/ws/live` and receive the transcoder's output as
//! binary messages. The JSON API under `/api` starts and stops recordings and
//! reports what is running.

pub mod error;
pub mod routes;
pub mod ws;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use dvr_recorder::RecordingManager;
use live_stream::StreamManager;
use relay_config::RelayConfig;
use std::future::Future;
use std::sync::Arc;
use transcoder::Launcher;

pub use error::ApiError;

/// Everything the handlers share. One per process.
pub struct AppState {
    pub config: RelayConfig,
    pub streams: StreamManager,
    pub recordings: RecordingManager,
}

impl AppState {
    pub fn new(config: RelayConfig, launcher: Arc<dyn Launcher>) -> Self {
        let streams = StreamManager::new(&config, launcher.clone());
        let recordings = RecordingManager::new(&config, launcher);
        Self {
            config,
            streams,
            recordings,
        }
    }

    /// Stop every live session, then finish every recording.
    pub async fn shutdown(&self) {
        self.streams.shutdown().await;
        self.recordings.stop_all().await;
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/live", get(ws::live_handler))
        .route("/api/channels", get(routes::channels_handler))
        .route("/api/streams", get(routes::streams_handler))
        .route("/api/recordings", get(routes::recordings_handler))
        .route("/api/recordings/files", get(routes::recorded_files_handler))
        .route("/api/recordings/{channel}/start", post(routes::start_recording_handler))
        .route("/api/recordings/{channel}/stop", post(routes::stop_recording_handler))
        .route("/api/health", get(routes::health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop all transcoders.
pub async fn run_server(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;

    state.shutdown().await;
    tracing::info!("Relay stopped");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use transcoder::ScriptLauncher;

    #[tokio::test]
    async fn test_shutdown_clears_both_registries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.recording.dir = dir.path().to_path_buf();
        config.recording.disk_reserve_percent = 100;
        let launcher = Arc::new(ScriptLauncher::new(
            r#"trap 'exit 0' INT; while :; do printf x; sleep 0.05; done"#,
        ));
        let state = AppState::new(config, launcher);

        let (viewer, _feed) = state.streams.viewer();
        state
            .streams
            .subscribe(viewer, 2, live_stream::Quality::High, true)
            .await
            .unwrap();
        state.recordings.start_recording(2, "Gate").await.unwrap();

        state.shutdown().await;
        assert!(state.streams.active_streams().await.is_empty());
        assert!(state.recordings.active_recordings().await.is_empty());
    }

    #[tokio::test]
    async fn test_router_builds() {
        let state = Arc::new(AppState::new(
            RelayConfig::default(),
            Arc::new(ScriptLauncher::new("exit 0")),
        ));
        let _ = router(state);
    }
}
