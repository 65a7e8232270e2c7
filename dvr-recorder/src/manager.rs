use chrono::{DateTime, Utc};
use relay_config::{DvrConfig, RecordingConfig, RelayConfig, TranscoderConfig};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use transcoder::{Invocation, Launcher, ProcessEvent, ProcessEvents, ProcessHandle, RtspSource, StreamIndex};

use crate::disk::{available_bytes, format_bytes, over_reserve};
use crate::error::RecordingError;
use crate::naming::recording_file_name;

/// How long [`RecordingManager::stop_all`] waits for recorders to finalize
/// their files before killing them.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// A recording in progress, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecording {
    pub channel_id: u32,
    pub channel_name: String,
    pub start_time: DateTime<Utc>,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStarted {
    pub channel_id: u32,
    pub channel_name: String,
    pub file_path: PathBuf,
}

impl RecordingStarted {
    pub fn message(&self) -> String {
        format!("Recording started for {}", self.channel_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStopped {
    pub channel_id: u32,
    pub channel_name: String,
    pub file_path: PathBuf,
}

impl RecordingStopped {
    pub fn message(&self) -> String {
        format!("Recording stopped for {}", self.channel_name)
    }
}

/// A finished recording on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedFile {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

struct RecordingSession {
    /// Distinguishes this session from a later one on the same channel
    serial: u64,
    channel_name: String,
    start_time: DateTime<Utc>,
    file_path: PathBuf,
    process: ProcessHandle,
    watcher: JoinHandle<()>,
}

/// A stopped recorder that may still be writing its trailer.
struct Finishing {
    process: ProcessHandle,
    watcher: JoinHandle<()>,
}

/// At most one recording per channel, each written straight to an MP4 file.
///
/// Cheap to clone; all clones share the registry.
#[derive(Clone)]
pub struct RecordingManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Mutex<HashMap<u32, RecordingSession>>,
    finishing: Mutex<Vec<Finishing>>,
    launcher: Arc<dyn Launcher>,
    dvr: DvrConfig,
    transcoder: TranscoderConfig,
    recording: RecordingConfig,
    next_serial: AtomicU64,
}

impl RecordingManager {
    pub fn new(config: &RelayConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                finishing: Mutex::new(Vec::new()),
                launcher,
                dvr: config.dvr.clone(),
                transcoder: config.transcoder.clone(),
                recording: config.recording.clone(),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.inner.recording.dir
    }

    pub async fn is_recording(&self, channel_id: u32) -> bool {
        self.inner.sessions.lock().await.contains_key(&channel_id)
    }

    /// Snapshot of the recordings in progress, ordered by channel.
    pub async fn active_recordings(&self) -> Vec<ActiveRecording> {
        let sessions = self.inner.sessions.lock().await;
        let mut recordings: Vec<_> = sessions
            .iter()
            .map(|(&channel_id, session)| ActiveRecording {
                channel_id,
                channel_name: session.channel_name.clone(),
                start_time: session.start_time,
                file_path: session.file_path.clone(),
            })
            .collect();
        recordings.sort_by_key(|r| r.channel_id);
        recordings
    }

    /// Start recording the main stream of a channel to a new file.
    ///
    /// Fails without side effects if the channel is already recording or the
    /// disk has reached its reserve threshold.
    pub async fn start_recording(
        &self,
        channel_id: u32,
        channel_name: &str,
    ) -> Result<RecordingStarted, RecordingError> {
        if channel_id == 0 {
            return Err(RecordingError::InvalidInput(
                "channel id must be a positive integer".to_string(),
            ));
        }

        if self.is_recording(channel_id).await {
            return Err(RecordingError::AlreadyRecording(channel_id));
        }

        let dir = &self.inner.recording.dir;
        tokio::fs::create_dir_all(dir).await?;
        if let Some(usage_percent) = over_reserve(dir, self.inner.recording.disk_reserve_percent) {
            tracing::warn!(
                "Not recording {}: disk is {}% full (reserve {}%)",
                channel_name,
                usage_percent,
                self.inner.recording.disk_reserve_percent
            );
            return Err(RecordingError::DiskFull { usage_percent });
        }
        let free = available_bytes(dir)
            .map(format_bytes)
            .unwrap_or_else(|_| "unknown".to_string());

        let source = RtspSource::new(&self.inner.dvr, channel_id, StreamIndex::Main)?;

        // Another start may have won while the disk was checked.
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(&channel_id) {
            return Err(RecordingError::AlreadyRecording(channel_id));
        }

        let start_time = Utc::now();
        let file_path = dir.join(recording_file_name(
            channel_name,
            start_time,
            &self.inner.recording.extension,
        ));
        let invocation = Invocation::recording(
            &self.inner.transcoder,
            &source,
            &file_path,
            format!("rec ch{}", channel_id),
        );

        let (process, events) = self.inner.launcher.launch(&invocation).map_err(|e| {
            tracing::warn!("Failed to start recording of {}: {}", channel_name, e);
            RecordingError::Spawn(e)
        })?;

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Recording {} (channel {}) to {} (pid {:?}, {} free)",
            channel_name,
            channel_id,
            file_path.display(),
            process.pid(),
            free
        );
        let watcher = tokio::spawn(watch(
            Arc::downgrade(&self.inner),
            channel_id,
            serial,
            file_path.clone(),
            events,
        ));
        sessions.insert(
            channel_id,
            RecordingSession {
                serial,
                channel_name: channel_name.to_string(),
                start_time,
                file_path: file_path.clone(),
                process,
                watcher,
            },
        );
        drop(sessions);

        Ok(RecordingStarted {
            channel_id,
            channel_name: channel_name.to_string(),
            file_path,
        })
    }

    /// Ask the recorder to finish its file (SIGINT) and forget the session.
    ///
    /// Returns as soon as the signal is sent; the file is finalized shortly after.
    pub async fn stop_recording(&self, channel_id: u32) -> Result<RecordingStopped, RecordingError> {
        let mut session = self
            .inner
            .sessions
            .lock()
            .await
            .remove(&channel_id)
            .ok_or(RecordingError::NotRecording(channel_id))?;

        session.process.interrupt();
        tracing::info!(
            "Stopping recording of {} (channel {}) after {}s",
            session.channel_name,
            channel_id,
            (Utc::now() - session.start_time).num_seconds()
        );

        let mut finishing = self.inner.finishing.lock().await;
        finishing.retain(|f| !f.watcher.is_finished());
        finishing.push(Finishing {
            process: session.process,
            watcher: session.watcher,
        });

        Ok(RecordingStopped {
            channel_id,
            channel_name: session.channel_name,
            file_path: session.file_path,
        })
    }

    /// Interrupt every recording and wait for the files to be finalized,
    /// including recordings stopped earlier that are still finishing.
    /// Recorders still running after [`FINALIZE_TIMEOUT`] are killed.
    ///
    /// Returns the number of recordings that were active.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<_> = self
            .inner
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        let stopped = drained.len();

        let mut pending: Vec<Finishing> = self.inner.finishing.lock().await.drain(..).collect();
        for mut session in drained {
            session.process.interrupt();
            pending.push(Finishing {
                process: session.process,
                watcher: session.watcher,
            });
        }
        if pending.is_empty() {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        for Finishing { mut process, mut watcher } in pending {
            if tokio::time::timeout_at(deadline, &mut watcher).await.is_err() {
                tracing::warn!(
                    "Recorder [{}] did not finish within {:?}, killing",
                    process.label(),
                    FINALIZE_TIMEOUT
                );
                process.kill();
                let _ = watcher.await;
            }
        }
        if stopped > 0 {
            tracing::info!("Stopped {} recording(s)", stopped);
        }
        stopped
    }

    /// Finished recordings in the recordings directory, newest first.
    ///
    /// Files still being written are left out.
    pub async fn list_recorded_files(&self) -> Result<Vec<RecordedFile>, RecordingError> {
        let dir = &self.inner.recording.dir;
        let active: HashSet<PathBuf> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .map(|s| s.file_path.clone())
            .collect();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let extension = self.inner.recording.extension.trim_start_matches('.');
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext != extension).unwrap_or(true) || active.contains(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(RecordedFile {
                file_name: entry.file_name().to_string_lossy().to_string(),
                size_bytes: metadata.len(),
                modified: metadata.modified().map(DateTime::<Utc>::from)?,
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(files)
    }
}

/// Follow a recorder until it exits. An exit nobody asked for ends the session.
async fn watch(registry: Weak<Inner>, channel_id: u32, serial: u64, file_path: PathBuf, mut events: ProcessEvents) {
    while let Some(event) = events.recv().await {
        let ProcessEvent::Exited(report) = event else {
            continue;
        };

        if report.requested {
            let size = tokio::fs::metadata(&file_path).await.map(|m| m.len()).unwrap_or(0);
            tracing::info!(
                "Recording {} finalized ({})",
                file_path.display(),
                format_bytes(size)
            );
            return;
        }

        tracing::warn!(
            "Recorder for channel {} exited unexpectedly: {}",
            channel_id,
            report.describe()
        );
        for line in &report.stderr_tail {
            tracing::warn!("[rec ch{}] {}", channel_id, line);
        }

        let Some(inner) = registry.upgrade() else {
            return;
        };
        let mut sessions = inner.sessions.lock().await;
        if sessions.get(&channel_id).map(|s| s.serial == serial).unwrap_or(false) {
            sessions.remove(&channel_id);
        }
        return;
    }
}
