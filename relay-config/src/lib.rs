//! Configuration for the DVR streaming relay.
//!
//! Stored as TOML at `~/.config/dvr-relay/relay.toml` unless a path is given.
//! Every section has defaults, so a minimal file only needs the DVR host,
//! credentials and channel list.

mod config;
mod error;
mod obfuscate;
mod paths;

pub use config::{
    ChannelConfig, DvrConfig, LiveConfig, QualityProfile, RecordingConfig, RelayConfig,
    ServerConfig, TranscoderConfig, DEFAULT_URL_TEMPLATE,
};
pub use error::ConfigError;
pub use paths::{config_dir, relay_config_path};
