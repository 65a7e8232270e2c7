use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one viewer connection for unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer#{}", self.0)
    }
}

/// What a viewer connection receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    Frame(Bytes),
    /// The transcoder stopped; no more frames will come.
    Ended(String),
}

/// Why a frame did not reach a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    /// The viewer's buffer is full, the frame was dropped
    Lagging,
    /// The connection side went away
    Closed,
}

/// Sending half of a viewer connection, held by the session.
///
/// Delivery never waits: a viewer that is not keeping up loses frames instead
/// of stalling everyone else on the session.
#[derive(Debug, Clone)]
pub struct Viewer {
    id: ViewerId,
    tx: mpsc::Sender<ViewerEvent>,
}

impl Viewer {
    /// Create a connected pair with room for `capacity` undelivered events.
    pub fn channel(capacity: usize) -> (Viewer, ViewerFeed) {
        let id = ViewerId(NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Viewer { id, tx }, ViewerFeed { id, rx })
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn deliver(&self, event: ViewerEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Receiving half, owned by the transport (e.g. a WebSocket task).
///
/// `recv` returns `None` once the session has dropped this viewer and the
/// buffered events are consumed.
#[derive(Debug)]
pub struct ViewerFeed {
    id: ViewerId,
    rx: mpsc::Receiver<ViewerEvent>,
}

impl ViewerFeed {
    pub fn id(&self) -> ViewerId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ViewerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ViewerEvent> {
        self.rx.try_recv().ok()
    }
}
