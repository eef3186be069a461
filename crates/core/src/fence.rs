//! Fencing (STONITH) hook: the external program that guarantees the old
//! active server cannot keep acting after a takeover decision.
//!
//! The hook is behind a trait so the state machine driver can be tested with
//! a deterministic fake. The production implementation runs the operator's
//! `stonith` script synchronously; the caller accepts that the machine takes
//! no further actions until the script returns.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Result of a fencing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The fencing program ran and exited zero: the target is down.
    Fenced,
    /// No fencing program is installed. Treated as success, logged at info.
    Absent,
    /// The fencing program exited non-zero. The takeover must not proceed;
    /// the state machine retries after a back-off.
    Failed,
}

/// A mechanism that forcibly downs a named host.
pub trait Fence {
    fn fence(&self, target_host: &str) -> FenceOutcome;
}

/// Production fence: invokes `<priv>/stonith <host>` with stdout and stderr
/// captured to a spool file, logs the capture once, then removes it.
#[derive(Debug, Clone)]
pub struct ScriptFence {
    script: PathBuf,
    spool_dir: PathBuf,
    own_host: String,
}

impl ScriptFence {
    pub fn new(script: PathBuf, spool_dir: PathBuf, own_host: impl Into<String>) -> Self {
        Self {
            script,
            spool_dir,
            own_host: own_host.into(),
        }
    }

    fn capture_path(&self, target_host: &str) -> PathBuf {
        self.spool_dir.join(format!(
            "stonith_out_err_fl_{}_{}",
            target_host,
            std::process::id()
        ))
    }

    /// Read, log, and remove the output capture. Best-effort: a missing or
    /// unreadable capture only loses the log line, never the outcome.
    fn drain_capture(&self, path: &PathBuf, exit_code: Option<i32>) {
        if let Ok(body) = fs::read_to_string(path) {
            let body = body.trim_end_matches(['\r', '\n']);
            if !body.is_empty() {
                tracing::info!(
                    exit_code = exit_code.unwrap_or(-1),
                    "fence output: {}",
                    body
                );
            }
        }
        let _ = fs::remove_file(path);
    }
}

impl Fence for ScriptFence {
    fn fence(&self, target_host: &str) -> FenceOutcome {
        match fs::metadata(&self.script) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no fence script installed, skipping fencing");
                return FenceOutcome::Absent;
            }
            Err(e) => {
                tracing::error!("cannot stat fence script {}: {}", self.script.display(), e);
                return FenceOutcome::Failed;
            }
        }

        let capture = self.capture_path(target_host);
        tracing::info!(
            script = %self.script.display(),
            target = target_host,
            from = %self.own_host,
            "executing fence script to bring down peer"
        );

        let stdout = match fs::File::create(&capture) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("cannot create fence capture file: {}", e);
                return FenceOutcome::Failed;
            }
        };
        let stderr = match stdout.try_clone() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("cannot clone fence capture handle: {}", e);
                return FenceOutcome::Failed;
            }
        };

        let status = Command::new(&self.script)
            .arg(target_host)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status();

        match status {
            Ok(status) if status.success() => {
                tracing::info!("fence script executed successfully");
                self.drain_capture(&capture, status.code());
                FenceOutcome::Fenced
            }
            Ok(status) => {
                tracing::error!(
                    exit_code = status.code().unwrap_or(-1),
                    "fence script execution failed"
                );
                self.drain_capture(&capture, status.code());
                FenceOutcome::Failed
            }
            Err(e) => {
                tracing::error!("failed to spawn fence script: {}", e);
                self.drain_capture(&capture, None);
                FenceOutcome::Failed
            }
        }
    }
}
