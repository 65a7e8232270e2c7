//! Shared live-view sessions.
//!
//! One transcoder runs per (channel, quality, audio) no matter how many
//! browsers watch it. Output chunks are fanned out to every attached viewer
//! through a small per-viewer buffer; a slow viewer loses frames rather than
//! holding up the rest. When the last viewer leaves, the transcoder keeps
//! running for a grace period so a quick reconnect reuses it.
//!
//! ```rust,ignore
//! let streams = StreamManager::new(&config, Arc::new(CommandLauncher::new(64 * 1024)));
//! let (viewer, mut feed) = streams.viewer();
//! let viewer_id = viewer.id();
//! streams.subscribe(viewer, 3, Quality::Low, false).await?;
//! while let Some(ViewerEvent::Frame(chunk)) = feed.recv().await {
//!     socket.send(chunk).await?;
//! }
//! streams.unsubscribe(viewer_id, 3, Quality::Low, false).await;
//! ```

pub mod error;
pub mod key;
pub mod manager;
mod session;
pub mod viewer;

pub use error::StreamError;
pub use key::{Quality, StreamKey};
pub use manager::{ActiveStream, StreamManager, Subscription};
pub use viewer::{Viewer, ViewerEvent, ViewerFeed, ViewerId};
