use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transcoder::{ProcessHandle, Termination};

use crate::key::StreamKey;
use crate::viewer::{DeliveryError, Viewer, ViewerEvent, ViewerId};

/// One running live-view transcoder and the viewers attached to it.
///
/// Everything mutable sits behind a single lock so that fan-out never sees
/// the subscriber set mid-change.
pub(crate) struct StreamSession {
    key: StreamKey,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    /// Flips to true once the transcoder process is gone
    exited: watch::Sender<bool>,
}

struct SessionState {
    process: ProcessHandle,
    subscribers: HashMap<ViewerId, Viewer>,
    /// Most recent chunk, replayed to viewers who join mid-stream
    last_frame: Option<Bytes>,
    teardown: Option<Teardown>,
    /// Bumped on every arm so a stale timer can tell it was replaced
    generation: u64,
    ended: bool,
}

struct Teardown {
    generation: u64,
    task: JoinHandle<()>,
}

impl StreamSession {
    pub(crate) fn new(key: StreamKey, process: ProcessHandle) -> Self {
        Self {
            key,
            started_at: Utc::now(),
            state: Mutex::new(SessionState {
                process,
                subscribers: HashMap::new(),
                last_frame: None,
                teardown: None,
                generation: 0,
                ended: false,
            }),
            exited: watch::Sender::new(false),
        }
    }

    pub(crate) fn key(&self) -> StreamKey {
        self.key
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Attach a viewer, cancelling any pending teardown. The cached frame, if
    /// any, is queued to the viewer before this returns, ahead of anything new.
    pub(crate) fn add(&self, viewer: Viewer) -> usize {
        let mut state = self.state.lock();
        if let Some(teardown) = state.teardown.take() {
            teardown.task.abort();
            tracing::debug!("Cancelled teardown of {}", self.key);
        }
        if let Some(frame) = state.last_frame.clone() {
            if let Err(e) = viewer.deliver(ViewerEvent::Frame(frame)) {
                tracing::trace!("Cached frame not delivered to {}: {:?}", viewer.id(), e);
            }
        }
        state.subscribers.insert(viewer.id(), viewer);
        state.subscribers.len()
    }

    /// Detach a viewer. Returns the remaining count, or `None` if it was not attached.
    pub(crate) fn remove(&self, id: ViewerId) -> Option<usize> {
        let mut state = self.state.lock();
        state.subscribers.remove(&id)?;
        Some(state.subscribers.len())
    }

    /// Forward a chunk to every open viewer and keep it as the cached frame.
    pub(crate) fn broadcast(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.last_frame = Some(chunk.clone());
        for viewer in state.subscribers.values() {
            if !viewer.is_open() {
                continue;
            }
            match viewer.deliver(ViewerEvent::Frame(chunk.clone())) {
                Ok(()) => {}
                Err(DeliveryError::Lagging) => {
                    tracing::trace!("{} is lagging on {}, frame dropped", viewer.id(), self.key);
                }
                Err(DeliveryError::Closed) => {
                    tracing::trace!("{} closed on {}", viewer.id(), self.key);
                }
            }
        }
    }

    /// Schedule a teardown with `spawn`, replacing any pending one.
    ///
    /// Does nothing if viewers are attached or the session is already
    /// stopping or ended.
    pub(crate) fn arm_teardown(&self, spawn: impl FnOnce(u64) -> JoinHandle<()>) -> bool {
        let mut state = self.state.lock();
        if state.ended || state.process.is_stopping() || !state.subscribers.is_empty() {
            return false;
        }
        if let Some(previous) = state.teardown.take() {
            previous.task.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        state.teardown = Some(Teardown {
            generation,
            task: spawn(generation),
        });
        true
    }

    /// Called by the timer: true if the timer for `generation` is still the
    /// pending one and nobody joined since. Clears the pending slot when true.
    pub(crate) fn teardown_due(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        let due = state.subscribers.is_empty()
            && state
                .teardown
                .as_ref()
                .map(|t| t.generation == generation)
                .unwrap_or(false);
        if due {
            state.teardown = None;
        }
        due
    }

    pub(crate) fn teardown_pending(&self) -> bool {
        self.state.lock().teardown.is_some()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.state.lock().process.pid()
    }

    pub(crate) fn stop(&self, how: Termination) {
        self.state.lock().process.stop(how);
    }

    /// True once the transcoder was asked to stop. Such a session takes no
    /// new viewers.
    pub(crate) fn is_stopping(&self) -> bool {
        self.state.lock().process.is_stopping()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    /// Resolves once the transcoder process has exited.
    pub(crate) async fn wait_exited(&self) {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|gone| *gone).await;
    }

    /// Final notification: tell every viewer the stream is over and let go of them.
    pub(crate) fn end(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.ended {
            return;
        }
        state.ended = true;
        if let Some(teardown) = state.teardown.take() {
            teardown.task.abort();
        }
        for (_, viewer) in state.subscribers.drain() {
            let _ = viewer.deliver(ViewerEvent::Ended(reason.to_string()));
        }
        state.last_frame = None;
    }
}
