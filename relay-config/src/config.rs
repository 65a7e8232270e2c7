use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::obfuscate;
use crate::paths;

/// Default RTSP path layout: `subtype` 0 is the main stream, 1 the sub stream.
pub const DEFAULT_URL_TEMPLATE: &str =
    "rtsp://{user}:{password}@{host}:{port}/cam/realmonitor?channel={channel}&subtype={stream}";

/// Connection details for the DVR and its channel list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DvrConfig {
    pub host: String,
    pub rtsp_port: u16,
    pub username: String,
    /// Base64-encoded password
    pub password_b64: String,
    /// RTSP URL layout with `{user}`, `{password}`, `{host}`, `{port}`,
    /// `{channel}` and `{stream}` placeholders.
    pub url_template: String,
    pub channels: Vec<ChannelConfig>,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.108".to_string(),
            rtsp_port: 554,
            username: "admin".to_string(),
            password_b64: String::new(),
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            channels: Vec::new(),
        }
    }
}

impl DvrConfig {
    /// Store a plain password (base64 encoded on disk)
    pub fn set_password(&mut self, password: &str) {
        self.password_b64 = obfuscate::encode(password);
    }

    /// Get decoded password
    pub fn password(&self) -> Result<String, ConfigError> {
        obfuscate::decode(&self.password_b64)
    }

    /// Display name of a channel, falling back to "Channel N" for unlisted ids.
    pub fn channel_name(&self, id: u32) -> String {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("Channel {}", id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,
}

/// Output size and rate for one live-view quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub framerate: u32,
}

impl QualityProfile {
    pub fn low() -> Self {
        Self {
            width: 640,
            height: 360,
            bitrate_kbps: 600,
            framerate: 25,
        }
    }

    pub fn high() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate_kbps: 2000,
            framerate: 25,
        }
    }

    /// ffmpeg `-s` argument, e.g. "640x360"
    pub fn size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub low: QualityProfile,
    pub high: QualityProfile,
    /// Live-view audio bitrate (kbps)
    pub audio_bitrate_kbps: u32,
    /// Recording audio bitrate (kbps)
    pub recording_audio_bitrate_kbps: u32,
    /// Bytes read from transcoder stdout per chunk
    pub read_chunk_size: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            low: QualityProfile::low(),
            high: QualityProfile::high(),
            audio_bitrate_kbps: 64,
            recording_audio_bitrate_kbps: 128,
            read_chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Delay after the last viewer leaves before the transcoder is stopped
    pub teardown_grace_secs: u64,
    /// Frames buffered per viewer before frames are dropped for that viewer
    pub viewer_buffer_frames: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            teardown_grace_secs: 30,
            viewer_buffer_frames: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub dir: PathBuf,
    /// Refuse to start recording when disk usage reaches this percentage
    pub disk_reserve_percent: u8,
    pub extension: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("recordings"),
            disk_reserve_percent: 95,
            extension: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub dvr: DvrConfig,
    pub transcoder: TranscoderConfig,
    pub live: LiveConfig,
    pub recording: RecordingConfig,
    pub server: ServerConfig,
}

impl RelayConfig {
    /// Load config from default XDG location
    pub fn load() -> Result<Self, ConfigError> {
        let path = paths::relay_config_path()?;
        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        paths::ensure_parent_dir(path)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dvr = &self.dvr;
        if dvr.host.trim().is_empty() {
            return Err(ConfigError::Invalid("dvr.host is empty".into()));
        }
        if dvr.rtsp_port == 0 {
            return Err(ConfigError::Invalid("dvr.rtsp_port must be non-zero".into()));
        }
        for placeholder in ["{channel}", "{stream}"] {
            if !dvr.url_template.contains(placeholder) {
                return Err(ConfigError::Invalid(format!(
                    "dvr.url_template is missing {}",
                    placeholder
                )));
            }
        }

        let mut seen = HashSet::new();
        for channel in &dvr.channels {
            if channel.id == 0 {
                return Err(ConfigError::Invalid("channel ids start at 1".into()));
            }
            if !seen.insert(channel.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
        }

        for (name, profile) in [("low", &self.transcoder.low), ("high", &self.transcoder.high)] {
            if profile.width == 0 || profile.height == 0 || profile.bitrate_kbps == 0 {
                return Err(ConfigError::Invalid(format!(
                    "transcoder.{} has a zero dimension or bitrate",
                    name
                )));
            }
        }
        if self.transcoder.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("transcoder.read_chunk_size must be non-zero".into()));
        }
        if self.live.viewer_buffer_frames == 0 {
            return Err(ConfigError::Invalid("live.viewer_buffer_frames must be non-zero".into()));
        }
        if self.recording.disk_reserve_percent > 100 {
            return Err(ConfigError::Invalid(
                "recording.disk_reserve_percent must be at most 100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [dvr]
            host = "10.0.0.5"
            username = "viewer"

            [[dvr.channels]]
            id = 3
            name = "Front Door"
            "#,
        )
        .unwrap();

        assert_eq!(config.dvr.host, "10.0.0.5");
        assert_eq!(config.dvr.rtsp_port, 554);
        assert_eq!(config.live.teardown_grace_secs, 30);
        assert_eq!(config.transcoder.low, QualityProfile::low());
        assert_eq!(config.dvr.channel_name(3), "Front Door");
        assert_eq!(config.dvr.channel_name(9), "Channel 9");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.toml");

        let mut config = RelayConfig::default();
        config.dvr.set_password("hunter2");
        config.dvr.channels.push(ChannelConfig {
            id: 1,
            name: "Yard".into(),
        });
        config.save_to(&path).unwrap();

        let loaded = RelayConfig::load_from(&path).unwrap();
        assert_eq!(loaded.dvr.password().unwrap(), "hunter2");
        assert_eq!(loaded.dvr.channels, config.dvr.channels);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = RelayConfig::load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RelayConfig::default();
        config.dvr.channels = vec![
            ChannelConfig { id: 2, name: "A".into() },
            ChannelConfig { id: 2, name: "B".into() },
        ];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.dvr.url_template = "rtsp://{host}/live".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.recording.disk_reserve_percent = 101;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
