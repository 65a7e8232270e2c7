use std::path::{Path, PathBuf};

use relay_config::{QualityProfile, TranscoderConfig};

use crate::source::RtspSource;

/// Where the transcoder writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Continuous stream on stdout, delivered as `ProcessEvent::Data`
    Pipe,
    /// The transcoder writes the file itself; stdout is discarded
    File(PathBuf),
}

/// A fully built transcoder command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: OutputTarget,
    /// Short name used in logs, e.g. "live ch3/low"
    pub label: String,
    source: Option<RtspSource>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, output: OutputTarget, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output,
            label: label.into(),
            source: None,
        }
    }

    /// Low-latency live view: MPEG-TS with MPEG-1 video on stdout.
    ///
    /// Input buffering and stream analysis are disabled so the first bytes
    /// come out as soon as the DVR starts sending.
    pub fn live(
        config: &TranscoderConfig,
        source: &RtspSource,
        profile: &QualityProfile,
        audio: bool,
        label: impl Into<String>,
    ) -> Self {
        let mut args = strings(&[
            "-hide_banner",
            "-loglevel",
            "warning",
            // Input settings
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-probesize",
            "32",
            "-analyzeduration",
            "0",
            "-rtsp_transport",
            "tcp",
            "-i",
            source.url(),
            // Output settings
            "-f",
            "mpegts",
            "-codec:v",
            "mpeg1video",
        ]);
        args.extend([
            "-s".to_string(),
            profile.size(),
            "-r".to_string(),
            profile.framerate.to_string(),
            "-b:v".to_string(),
            format!("{}k", profile.bitrate_kbps),
            "-maxrate".to_string(),
            format!("{}k", profile.bitrate_kbps),
            "-bf".to_string(),
            "0".to_string(),
        ]);
        if audio {
            args.extend([
                "-codec:a".to_string(),
                "mp2".to_string(),
                "-ar".to_string(),
                "44100".to_string(),
                "-ac".to_string(),
                "1".to_string(),
                "-b:a".to_string(),
                format!("{}k", config.audio_bitrate_kbps),
            ]);
        } else {
            args.push("-an".to_string());
        }
        args.push("pipe:1".to_string());

        Self {
            program: config.ffmpeg_path.clone(),
            args,
            output: OutputTarget::Pipe,
            label: label.into(),
            source: Some(source.clone()),
        }
    }

    /// Recording to disk: video copied as-is, audio to AAC, moov atom up front.
    ///
    /// Must be stopped with SIGINT so ffmpeg writes the trailer.
    pub fn recording(
        config: &TranscoderConfig,
        source: &RtspSource,
        path: &Path,
        label: impl Into<String>,
    ) -> Self {
        let mut args = strings(&[
            "-hide_banner",
            "-loglevel",
            "warning",
            "-rtsp_transport",
            "tcp",
            "-i",
            source.url(),
            // No video re-encode
            "-c:v",
            "copy",
            "-c:a",
            "aac",
        ]);
        args.extend([
            "-b:a".to_string(),
            format!("{}k", config.recording_audio_bitrate_kbps),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-y".to_string(),
            path.to_string_lossy().to_string(),
        ]);

        Self {
            program: config.ffmpeg_path.clone(),
            args,
            output: OutputTarget::File(path.to_path_buf()),
            label: label.into(),
            source: Some(source.clone()),
        }
    }

    /// Remove credentials from text produced by this invocation.
    pub fn redact(&self, text: &str) -> String {
        match &self.source {
            Some(source) => source.redact(text),
            None => text.to_string(),
        }
    }

    /// Command line for logs, with credentials removed.
    pub fn describe(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&self.redact(arg));
        }
        line
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamIndex;
    use relay_config::DvrConfig;

    fn source(stream: StreamIndex) -> RtspSource {
        let mut dvr = DvrConfig::default();
        dvr.set_password("secret");
        RtspSource::new(&dvr, 3, stream).unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_live_low_without_audio() {
        let config = TranscoderConfig::default();
        let inv = Invocation::live(&config, &source(StreamIndex::Sub), &config.low, false, "live ch3/low");

        assert_eq!(inv.output, OutputTarget::Pipe);
        assert_eq!(value_after(&inv.args, "-s"), Some("640x360"));
        assert_eq!(value_after(&inv.args, "-b:v"), Some("600k"));
        assert_eq!(value_after(&inv.args, "-fflags"), Some("nobuffer"));
        assert!(inv.args.contains(&"-an".to_string()));
        assert!(!inv.args.contains(&"-codec:a".to_string()));
        assert_eq!(inv.args.last().map(|s| s.as_str()), Some("pipe:1"));
        assert!(value_after(&inv.args, "-i").unwrap().contains("subtype=1"));
    }

    #[test]
    fn test_live_high_with_audio() {
        let config = TranscoderConfig::default();
        let inv = Invocation::live(&config, &source(StreamIndex::Main), &config.high, true, "live");

        assert_eq!(value_after(&inv.args, "-s"), Some("1280x720"));
        assert_eq!(value_after(&inv.args, "-codec:a"), Some("mp2"));
        assert_eq!(value_after(&inv.args, "-b:a"), Some("64k"));
        assert!(!inv.args.contains(&"-an".to_string()));
    }

    #[test]
    fn test_recording_copies_video() {
        let config = TranscoderConfig::default();
        let path = PathBuf::from("/tmp/rec/Front_Door-2024-01-01T00-00-00.mp4");
        let inv = Invocation::recording(&config, &source(StreamIndex::Main), &path, "rec ch3");

        assert_eq!(inv.output, OutputTarget::File(path.clone()));
        assert_eq!(value_after(&inv.args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&inv.args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&inv.args, "-movflags"), Some("+faststart"));
        assert_eq!(inv.args.last().map(PathBuf::from), Some(path));
    }

    #[test]
    fn test_describe_is_redacted() {
        let config = TranscoderConfig::default();
        let inv = Invocation::live(&config, &source(StreamIndex::Sub), &config.low, false, "live");
        let line = inv.describe();
        assert!(line.starts_with("ffmpeg "));
        assert!(!line.contains("secret"));
        assert!(line.contains("admin:***@"));
    }
}
