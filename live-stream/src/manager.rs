use chrono::{DateTime, Utc};
use relay_config::{DvrConfig, RelayConfig, TranscoderConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use transcoder::{Invocation, Launcher, ProcessEvent, ProcessEvents, RtspSource, Termination};

use crate::error::StreamError;
use crate::key::{Quality, StreamKey};
use crate::session::StreamSession;
use crate::viewer::{Viewer, ViewerFeed, ViewerId};

/// Observability snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStream {
    pub channel_id: u32,
    pub quality: Quality,
    pub audio: bool,
    pub subscribers: usize,
    pub teardown_pending: bool,
    /// The transcoder was asked to stop and has not exited yet
    pub stopping: bool,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub key: StreamKey,
    /// A new transcoder was started for this subscribe
    pub created: bool,
    pub subscribers: usize,
}

/// Registry of live transcoding sessions, one per (channel, quality, audio).
///
/// Viewers with the same key share one transcoder. The transcoder starts with
/// the first viewer and stops a grace period after the last one leaves, so a
/// page reload does not restart it.
///
/// Cheap to clone; all clones share the registry.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Mutex<HashMap<StreamKey, Arc<StreamSession>>>,
    launcher: Arc<dyn Launcher>,
    dvr: DvrConfig,
    transcoder: TranscoderConfig,
    grace: Duration,
    viewer_buffer: usize,
    shutting_down: AtomicBool,
}

impl StreamManager {
    pub fn new(config: &RelayConfig, launcher: Arc<dyn Launcher>) -> Self {
        let grace = Duration::from_secs(config.live.teardown_grace_secs);
        Self::with_grace_period(config, launcher, grace)
    }

    pub fn with_grace_period(config: &RelayConfig, launcher: Arc<dyn Launcher>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                launcher,
                dvr: config.dvr.clone(),
                transcoder: config.transcoder.clone(),
                grace,
                viewer_buffer: config.live.viewer_buffer_frames,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace
    }

    /// New viewer connection pair sized from the config.
    pub fn viewer(&self) -> (Viewer, ViewerFeed) {
        Viewer::channel(self.inner.viewer_buffer)
    }

    /// Attach `viewer` to the session for the key, starting the transcoder if
    /// this is the first viewer.
    ///
    /// Returns as soon as the viewer is registered; frames arrive on its feed.
    pub async fn subscribe(
        &self,
        viewer: Viewer,
        channel_id: u32,
        quality: Quality,
        audio: bool,
    ) -> Result<Subscription, StreamError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }
        let key = StreamKey::new(channel_id, quality, audio)?;
        let viewer_id = viewer.id();

        loop {
            let mut sessions = self.inner.sessions.lock().await;
            // Checked again under the lock so nothing is spawned after shutdown drained the map.
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(StreamError::ShuttingDown);
            }
            let existing = sessions.get(&key).cloned();
            let (session, created) = match existing {
                // At most one transcoder per key: a replacement starts only
                // after the old process is gone.
                Some(dying) if dying.is_stopping() => {
                    drop(sessions);
                    tracing::debug!("Waiting for {} to exit before restarting it", key);
                    dying.wait_exited().await;
                    continue;
                }
                Some(session) => (session, false),
                None => {
                    let session = start_session(&self.inner, key)?;
                    sessions.insert(key, session.clone());
                    (session, true)
                }
            };
            let subscribers = session.add(viewer);
            drop(sessions);

            tracing::debug!(
                "{} subscribed to {} ({} viewer(s))",
                viewer_id,
                key,
                subscribers
            );
            return Ok(Subscription {
                key,
                created,
                subscribers,
            });
        }
    }

    /// Detach a viewer. Unknown sessions or viewers are ignored.
    ///
    /// When the last viewer leaves, the transcoder is stopped after the grace
    /// period unless someone subscribes in the meantime.
    pub async fn unsubscribe(&self, viewer: ViewerId, channel_id: u32, quality: Quality, audio: bool) -> bool {
        let Ok(key) = StreamKey::new(channel_id, quality, audio) else {
            return false;
        };

        let sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get(&key).cloned() else {
            return false;
        };
        let Some(remaining) = session.remove(viewer) else {
            return false;
        };
        tracing::debug!("{} left {} ({} viewer(s))", viewer, key, remaining);

        if remaining == 0 {
            let registry = Arc::downgrade(&self.inner);
            let target = Arc::downgrade(&session);
            let grace = self.inner.grace;
            let armed = session.arm_teardown(|generation| {
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let (Some(inner), Some(session)) = (registry.upgrade(), target.upgrade()) {
                        expire(&inner, &session, generation).await;
                    }
                })
            });
            if armed {
                tracing::debug!("No viewers left on {}, stopping in {:?}", key, grace);
            }
        }
        drop(sessions);
        true
    }

    /// Stop every session immediately. Used once, at process exit.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<_> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.end("relay shutting down");
            session.stop(Termination::Kill);
        }
        if !drained.is_empty() {
            tracing::info!("Stopped {} live session(s)", drained.len());
        }
    }

    /// Snapshot of the running sessions, ordered by channel.
    pub async fn active_streams(&self) -> Vec<ActiveStream> {
        let sessions = self.inner.sessions.lock().await;
        let mut streams: Vec<_> = sessions
            .values()
            .map(|session| {
                let key = session.key();
                ActiveStream {
                    channel_id: key.channel_id,
                    quality: key.quality,
                    audio: key.audio,
                    subscribers: session.subscriber_count(),
                    teardown_pending: session.teardown_pending(),
                    stopping: session.is_stopping(),
                    pid: session.pid(),
                    started_at: session.started_at(),
                }
            })
            .collect();
        streams.sort_by_key(|s| (s.channel_id, s.quality, s.audio));
        streams
    }
}

/// Spawn the transcoder for `key` and start forwarding its output.
///
/// Called with the registry locked: spawning is fork/exec only and never waits
/// for the DVR.
fn start_session(inner: &Arc<Inner>, key: StreamKey) -> Result<Arc<StreamSession>, StreamError> {
    let source = RtspSource::new(&inner.dvr, key.channel_id, key.quality.stream_index())?;
    let profile = match key.quality {
        Quality::Low => &inner.transcoder.low,
        Quality::High => &inner.transcoder.high,
    };
    let invocation = Invocation::live(&inner.transcoder, &source, profile, key.audio, key.label());

    let (process, events) = inner.launcher.launch(&invocation).map_err(|e| {
        tracing::warn!("Failed to start live session {}: {}", key, e);
        StreamError::Spawn(e)
    })?;
    tracing::info!(
        "Started live session {} from {} (pid {:?})",
        key,
        source,
        process.pid()
    );

    let session = Arc::new(StreamSession::new(key, process));
    tokio::spawn(forward(Arc::downgrade(inner), session.clone(), events));
    Ok(session)
}

/// Fan transcoder output out to the session's viewers until the process exits.
async fn forward(registry: Weak<Inner>, session: Arc<StreamSession>, mut events: ProcessEvents) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Data(chunk) => session.broadcast(chunk),
            ProcessEvent::Exited(report) => {
                let reason = if report.requested {
                    tracing::debug!("Live session {} stopped", session.key());
                    "stream stopped".to_string()
                } else {
                    tracing::warn!(
                        "Transcoder for {} exited unexpectedly: {}",
                        session.key(),
                        report.describe()
                    );
                    format!("transcoder exited: {}", report.describe())
                };
                if let Some(inner) = registry.upgrade() {
                    remove_if_current(&inner, &session).await;
                }
                session.end(&reason);
                break;
            }
        }
    }
    session.mark_exited();
}

async fn remove_if_current(inner: &Inner, session: &Arc<StreamSession>) -> bool {
    let mut sessions = inner.sessions.lock().await;
    let key = session.key();
    let current = sessions
        .get(&key)
        .map(|registered| Arc::ptr_eq(registered, session))
        .unwrap_or(false);
    if current {
        sessions.remove(&key);
    }
    current
}

/// Teardown timer body: stop the session if it is still registered, still
/// empty, and this timer was not replaced or cancelled.
///
/// The session stays registered until its process exits, so a new subscriber
/// for the key waits for the old transcoder instead of starting a second one.
async fn expire(inner: &Inner, session: &Arc<StreamSession>, generation: u64) {
    let key = session.key();
    let sessions = inner.sessions.lock().await;
    let current = sessions
        .get(&key)
        .map(|registered| Arc::ptr_eq(registered, session))
        .unwrap_or(false);
    if !current || !session.teardown_due(generation) {
        return;
    }
    session.stop(Termination::Terminate);
    drop(sessions);

    tracing::info!("Stopping idle live session {} after {:?}", key, inner.grace);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::viewer::ViewerEvent;
    use bytes::Bytes;
    use relay_config::ChannelConfig;
    use transcoder::ScriptLauncher;

    const FRAMES: &str = "while :; do printf frame; sleep 0.05; done";
    const GRACE: Duration = Duration::from_millis(300);

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.dvr.set_password("secret");
        config.dvr.channels.push(ChannelConfig {
            id: 3,
            name: "Front Door".into(),
        });
        config
    }

    fn manager(script: &str) -> (StreamManager, Arc<ScriptLauncher>) {
        let launcher = Arc::new(ScriptLauncher::new(script));
        let manager = StreamManager::with_grace_period(&config(), launcher.clone(), GRACE);
        (manager, launcher)
    }

    async fn next_event(feed: &mut ViewerFeed) -> ViewerEvent {
        tokio::time::timeout(Duration::from_secs(5), feed.recv())
            .await
            .expect("timed out waiting for viewer event")
            .expect("feed closed")
    }

    #[tokio::test]
    async fn test_shared_session_lifecycle() {
        let (manager, launcher) = manager(FRAMES);
        let (a, _feed_a) = manager.viewer();
        let (b, _feed_b) = manager.viewer();
        let (a_id, b_id) = (a.id(), b.id());

        let sub = manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        assert!(sub.created);
        assert_eq!(launcher.launches(), 1);

        let sub = manager.subscribe(b, 3, Quality::Low, false).await.unwrap();
        assert!(!sub.created);
        assert_eq!(sub.subscribers, 2);
        assert_eq!(launcher.launches(), 1);

        assert!(manager.unsubscribe(a_id, 3, Quality::Low, false).await);
        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].subscribers, 1);
        assert!(!streams[0].teardown_pending);

        assert!(manager.unsubscribe(b_id, 3, Quality::Low, false).await);
        let streams = manager.active_streams().await;
        assert_eq!(streams[0].subscribers, 0);
        assert!(streams[0].teardown_pending);

        tokio::time::sleep(GRACE * 3).await;
        assert!(manager.active_streams().await.is_empty());
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_stubborn_transcoder_is_not_doubled() {
        let (manager, launcher) = manager("trap '' TERM; while :; do printf x; sleep 0.05; done");
        let (a, _feed_a) = manager.viewer();
        let a_id = a.id();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        let old_pid = manager.active_streams().await[0].pid.unwrap();
        manager.unsubscribe(a_id, 3, Quality::Low, false).await;

        tokio::time::sleep(GRACE * 2).await;
        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 1);
        assert!(streams[0].stopping);

        let (b, mut feed_b) = manager.viewer();
        let sub = tokio::time::timeout(
            transcoder::TERMINATE_GRACE * 3,
            manager.subscribe(b, 3, Quality::Low, false),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(sub.created);
        assert_eq!(launcher.launches(), 2);

        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 1);
        assert!(!streams[0].stopping);
        assert_ne!(streams[0].pid, Some(old_pid));
        let old = nix::unistd::Pid::from_raw(old_pid as i32);
        assert!(nix::sys::signal::kill(old, None).is_err());
        assert!(matches!(next_event(&mut feed_b).await, ViewerEvent::Frame(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_survives_until_grace_elapses() {
        let (manager, _launcher) = manager(FRAMES);
        let (a, _feed) = manager.viewer();
        let a_id = a.id();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        manager.unsubscribe(a_id, 3, Quality::Low, false).await;

        tokio::time::sleep(GRACE / 3).await;
        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 1);
        assert!(streams[0].teardown_pending);
    }

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_process() {
        let (manager, launcher) = manager(FRAMES);
        let (a, _feed_a) = manager.viewer();
        let a_id = a.id();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        let pid = manager.active_streams().await[0].pid;
        manager.unsubscribe(a_id, 3, Quality::Low, false).await;

        tokio::time::sleep(GRACE / 3).await;
        let (b, mut feed_b) = manager.viewer();
        let sub = manager.subscribe(b, 3, Quality::Low, false).await.unwrap();
        assert!(!sub.created);

        tokio::time::sleep(GRACE * 2).await;
        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].pid, pid);
        assert!(!streams[0].teardown_pending);
        assert_eq!(launcher.launches(), 1);
        assert!(matches!(next_event(&mut feed_b).await, ViewerEvent::Frame(_)));
    }

    #[tokio::test]
    async fn test_concurrent_first_subscribers_spawn_once() {
        let (manager, launcher) = manager(FRAMES);
        let mut feeds = Vec::new();
        let mut joins = Vec::new();
        for _ in 0..16 {
            let (viewer, feed) = manager.viewer();
            feeds.push(feed);
            let manager = manager.clone();
            joins.push(tokio::spawn(async move {
                manager.subscribe(viewer, 5, Quality::High, true).await
            }));
        }
        let results = futures::future::join_all(joins).await;
        let created = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|s| s.created)
            .count();

        assert_eq!(created, 1);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(manager.active_streams().await[0].subscribers, 16);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_cached_frame_first() {
        let (manager, _launcher) = manager("printf first; exec sleep 30");
        let (a, mut feed_a) = manager.viewer();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        assert_eq!(
            next_event(&mut feed_a).await,
            ViewerEvent::Frame(Bytes::from_static(b"first"))
        );

        let (b, mut feed_b) = manager.viewer();
        manager.subscribe(b, 3, Quality::Low, false).await.unwrap();
        assert_eq!(
            feed_b.try_recv(),
            Some(ViewerEvent::Frame(Bytes::from_static(b"first")))
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_session_sends_nothing_before_first_frame() {
        let (manager, _launcher) = manager("exec sleep 30");
        let (a, mut feed_a) = manager.viewer();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(feed_a.try_recv(), None);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_removes_session_and_ends_viewers() {
        let (manager, _launcher) = manager("printf x; exit 1");
        let (a, mut feed_a) = manager.viewer();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();

        assert_eq!(next_event(&mut feed_a).await, ViewerEvent::Frame(Bytes::from_static(b"x")));
        assert!(matches!(next_event(&mut feed_a).await, ViewerEvent::Ended(_)));
        assert_eq!(feed_a.recv().await, None);
        assert!(manager.active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn test_crash_with_viewers_then_resubscribe_spawns_again() {
        let (manager, launcher) = manager("exit 1");
        let (a, mut feed_a) = manager.viewer();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();
        assert!(matches!(next_event(&mut feed_a).await, ViewerEvent::Ended(_)));

        launcher.set_script(FRAMES);
        let (b, mut feed_b) = manager.viewer();
        let sub = manager.subscribe(b, 3, Quality::Low, false).await.unwrap();
        assert!(sub.created);
        assert_eq!(launcher.launches(), 2);
        assert!(matches!(next_event(&mut feed_b).await, ViewerEvent::Frame(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_registered() {
        let launcher = Arc::new(ScriptLauncher::missing_program());
        let manager = StreamManager::with_grace_period(&config(), launcher, GRACE);
        let (a, _feed) = manager.viewer();

        let result = manager.subscribe(a, 3, Quality::Low, false).await;
        assert!(matches!(result, Err(StreamError::Spawn(_))));
        assert!(manager.active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_channel() {
        let (manager, launcher) = manager(FRAMES);
        let (a, _feed) = manager.viewer();
        let result = manager.subscribe(a, 0, Quality::Low, false).await;
        assert!(matches!(result, Err(StreamError::InvalidInput(_))));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let (manager, _launcher) = manager(FRAMES);
        let (a, _feed) = manager.viewer();
        assert!(!manager.unsubscribe(a.id(), 3, Quality::Low, false).await);

        let (b, _feed_b) = manager.viewer();
        manager.subscribe(b, 3, Quality::Low, false).await.unwrap();
        assert!(!manager.unsubscribe(a.id(), 3, Quality::Low, false).await);
        assert_eq!(manager.active_streams().await[0].subscribers, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_keys_are_separate_sessions() {
        let (manager, launcher) = manager(FRAMES);
        for (quality, audio) in [(Quality::Low, false), (Quality::Low, true), (Quality::High, false)] {
            let (viewer, _feed) = manager.viewer();
            manager.subscribe(viewer, 3, quality, audio).await.unwrap();
        }
        assert_eq!(launcher.launches(), 3);
        let streams = manager.active_streams().await;
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].quality, Quality::Low);
        assert_eq!(streams[2].quality, Quality::High);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invocation_matches_key() {
        let (manager, launcher) = manager(FRAMES);
        let (viewer, _feed) = manager.viewer();
        manager.subscribe(viewer, 3, Quality::Low, false).await.unwrap();

        let invocation = &launcher.invocations()[0];
        assert_eq!(invocation.label, "live ch3/low");
        assert!(invocation.args.contains(&"-an".to_string()));
        assert!(invocation.args.contains(&"640x360".to_string()));
        assert!(invocation.args.iter().any(|a| a.contains("channel=3&subtype=1")));
        assert!(!invocation.describe().contains("secret"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_lagging_viewer_does_not_stall_others() {
        let (manager, _launcher) = manager(FRAMES);
        let (slow, _slow_feed) = Viewer::channel(1);
        let (fast, mut fast_feed) = manager.viewer();
        manager.subscribe(slow, 3, Quality::Low, false).await.unwrap();
        manager.subscribe(fast, 3, Quality::Low, false).await.unwrap();

        for _ in 0..5 {
            assert!(matches!(next_event(&mut fast_feed).await, ViewerEvent::Frame(_)));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (manager, _launcher) = manager(FRAMES);
        let (a, mut feed_a) = manager.viewer();
        manager.subscribe(a, 3, Quality::Low, false).await.unwrap();

        manager.shutdown().await;
        assert!(manager.active_streams().await.is_empty());
        loop {
            match next_event(&mut feed_a).await {
                ViewerEvent::Frame(_) => continue,
                ViewerEvent::Ended(reason) => {
                    assert_eq!(reason, "relay shutting down");
                    break;
                }
            }
        }

        let (b, _feed_b) = manager.viewer();
        let result = manager.subscribe(b, 3, Quality::Low, false).await;
        assert!(matches!(result, Err(StreamError::ShuttingDown)));
    }

    #[test]
    fn test_snapshot_serialization() {
        let stream = ActiveStream {
            channel_id: 3,
            quality: Quality::Low,
            audio: false,
            subscribers: 2,
            teardown_pending: false,
            stopping: false,
            pid: Some(42),
            started_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&stream).unwrap();
        assert_eq!(json["channelId"], 3);
        assert_eq!(json["quality"], "low");
        assert_eq!(json["subscribers"], 2);
        assert_eq!(json["teardownPending"], false);
        assert_eq!(json["stopping"], false);
    }
}
