//! Per-channel recordings of the DVR's main streams.
//!
//! Each recording copies the video as-is into an MP4 file named after the
//! channel and start time, e.g. `recordings/Front_Door-2024-03-09T14-05-07.mp4`.
//! Recordings are stopped with SIGINT so ffmpeg writes a playable file.
//!
//! # Features
//! - One recording per channel; a second start is rejected
//! - Refuses to start when the disk has reached its reserve threshold
//! - A recorder that dies on its own is logged and its session cleared
//! - Lists finished recordings for download

pub mod disk;
pub mod error;
pub mod manager;
pub mod naming;

pub use disk::{available_bytes, disk_usage_percent, format_bytes, over_reserve};
pub use error::{DiskError, RecordingError};
pub use manager::{ActiveRecording, RecordedFile, RecordingManager, RecordingStarted, RecordingStopped};
pub use naming::{recording_file_name, sanitize_channel_name, TIMESTAMP_FORMAT};
