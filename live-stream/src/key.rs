use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use transcoder::StreamIndex;

use crate::error::StreamError;

/// Coarse live-view profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    High,
}

impl Quality {
    /// Low pulls the DVR's sub stream, high the main stream.
    pub fn stream_index(self) -> StreamIndex {
        match self {
            Quality::Low => StreamIndex::Sub,
            Quality::High => StreamIndex::Main,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "high" => Ok(Quality::High),
            other => Err(StreamError::InvalidInput(format!(
                "quality must be \"low\" or \"high\", got {:?}",
                other
            ))),
        }
    }
}

/// Identifies one transcoding pipeline. Viewers with equal keys share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub channel_id: u32,
    pub quality: Quality,
    pub audio: bool,
}

impl StreamKey {
    pub fn new(channel_id: u32, quality: Quality, audio: bool) -> Result<Self, StreamError> {
        if channel_id == 0 {
            return Err(StreamError::InvalidInput(
                "channel id must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            channel_id,
            quality,
            audio,
        })
    }

    /// Log label for the transcoder, e.g. "live ch3/low+audio".
    pub fn label(&self) -> String {
        format!("live {}", self)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}/{}", self.channel_id, self.quality)?;
        if self.audio {
            f.write_str("+audio")?;
        }
        Ok(())
    }
}
