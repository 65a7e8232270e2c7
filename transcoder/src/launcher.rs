use crate::error::TranscoderError;
use crate::invocation::Invocation;
use crate::process::{ProcessEvents, ProcessHandle};

/// Starts transcoder processes for the session managers.
pub trait Launcher: Send + Sync {
    fn launch(&self, invocation: &Invocation) -> Result<(ProcessHandle, ProcessEvents), TranscoderError>;
}

/// Runs the invocation as-is.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    chunk_size: usize,
}

impl CommandLauncher {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, invocation: &Invocation) -> Result<(ProcessHandle, ProcessEvents), TranscoderError> {
        tracing::debug!("Launching {}", invocation.describe());
        ProcessHandle::spawn(invocation, self.chunk_size)
    }
}

#[cfg(any(test, feature = "testing"))]
pub use script::ScriptLauncher;

#[cfg(any(test, feature = "testing"))]
mod script {
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::invocation::OutputTarget;

    /// Runs a shell script in place of ffmpeg and records every launch.
    ///
    /// The script gets the output file path as `$1` for file invocations.
    pub struct ScriptLauncher {
        program: PathBuf,
        script: Mutex<String>,
        launches: AtomicUsize,
        invocations: Mutex<Vec<Invocation>>,
    }

    impl ScriptLauncher {
        pub fn new(script: impl Into<String>) -> Self {
            Self {
                program: PathBuf::from("sh"),
                script: Mutex::new(script.into()),
                launches: AtomicUsize::new(0),
                invocations: Mutex::new(Vec::new()),
            }
        }

        /// A launcher whose executable does not exist.
        pub fn missing_program() -> Self {
            Self {
                program: PathBuf::from("/nonexistent/transcoder"),
                ..Self::new("")
            }
        }

        /// Script used by subsequent launches.
        pub fn set_script(&self, script: impl Into<String>) {
            *self.script.lock() = script.into();
        }

        /// Processes successfully spawned so far.
        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        /// The invocations the managers asked for, in order.
        pub fn invocations(&self) -> Vec<Invocation> {
            self.invocations.lock().clone()
        }
    }

    impl Launcher for ScriptLauncher {
        fn launch(&self, invocation: &Invocation) -> Result<(ProcessHandle, ProcessEvents), TranscoderError> {
            let mut args = vec![
                "-c".to_string(),
                self.script.lock().clone(),
                "transcoder".to_string(),
            ];
            if let OutputTarget::File(path) = &invocation.output {
                args.push(path.to_string_lossy().to_string());
            }
            let script = Invocation::new(
                self.program.clone(),
                args,
                invocation.output.clone(),
                invocation.label.clone(),
            );
            let spawned = ProcessHandle::spawn(&script, 64 * 1024)?;
            self.invocations.lock().push(invocation.clone());
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(spawned)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::invocation::OutputTarget;
    use crate::process::ProcessEvent;

    #[tokio::test]
    async fn test_script_launcher_counts_launches() {
        let launcher = ScriptLauncher::new("printf frame");
        let inv = Invocation::new("ffmpeg", vec![], OutputTarget::Pipe, "live ch1/low");

        let (_handle, mut events) = launcher.launch(&inv).unwrap();
        match events.recv().await {
            Some(ProcessEvent::Data(chunk)) => assert_eq!(&chunk[..], b"frame"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.invocations()[0].label, "live ch1/low");
    }

    #[tokio::test]
    async fn test_missing_program_fails_without_counting() {
        let launcher = ScriptLauncher::missing_program();
        let inv = Invocation::new("ffmpeg", vec![], OutputTarget::Pipe, "live");
        assert!(matches!(launcher.launch(&inv), Err(TranscoderError::NotFound(_))));
        assert_eq!(launcher.launches(), 0);
    }
}
