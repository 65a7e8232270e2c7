//! Transcoder process supervision for the DVR relay.
//!
//! Builds ffmpeg command lines for the two jobs the relay runs against a DVR
//! channel and owns the resulting processes:
//!
//! - **Live view**: low-latency MPEG-TS on stdout, fanned out to browsers
//! - **Recording**: video copied to an MP4 file, stopped with SIGINT so the
//!   file is finalized
//!
//! ```rust,ignore
//! let source = RtspSource::new(&config.dvr, 3, StreamIndex::Sub)?;
//! let invocation = Invocation::live(&config.transcoder, &source, &config.transcoder.low, false, "live ch3/low");
//! let (mut handle, mut events) = CommandLauncher::new(64 * 1024).launch(&invocation)?;
//! while let Some(ProcessEvent::Data(chunk)) = events.recv().await { /* ... */ }
//! handle.terminate();
//! ```

pub mod error;
pub mod invocation;
pub mod launcher;
pub mod process;
pub mod source;

use std::path::Path;
use tokio::process::Command;

pub use error::TranscoderError;
pub use invocation::{Invocation, OutputTarget};
pub use launcher::{CommandLauncher, Launcher};
#[cfg(any(test, feature = "testing"))]
pub use launcher::ScriptLauncher;
pub use process::{ExitReport, ProcessEvent, ProcessEvents, ProcessHandle, Termination, TERMINATE_GRACE};
pub use source::{RtspSource, StreamIndex};

/// First line of `ffmpeg -version`, e.g. "ffmpeg version 6.1.1".
pub async fn ffmpeg_version(ffmpeg: &Path) -> Result<String, TranscoderError> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TranscoderError::NotFound(ffmpeg.display().to_string())
            } else {
                TranscoderError::Check(e.to_string())
            }
        })?;

    if !output.status.success() {
        return Err(TranscoderError::Check(
            "ffmpeg returned non-zero exit code".to_string(),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Check if ffmpeg is available at the given path.
pub async fn check_ffmpeg(ffmpeg: &Path) -> Result<(), TranscoderError> {
    ffmpeg_version(ffmpeg).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ffmpeg_available() {
        // Not every build machine has ffmpeg
        match ffmpeg_version(Path::new("ffmpeg")).await {
            Ok(version) => assert!(version.starts_with("ffmpeg")),
            Err(e) => eprintln!("ffmpeg not available, skipping test: {}", e),
        }
    }

    #[tokio::test]
    async fn test_missing_ffmpeg() {
        let result = check_ffmpeg(Path::new("/nonexistent/ffmpeg")).await;
        assert!(matches!(result, Err(TranscoderError::NotFound(_))));
    }
}
