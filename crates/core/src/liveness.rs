//! Liveness file: a shared-storage heartbeat independent of the control
//! channel.
//!
//! The active server touches the file's mtime every handshake period. The
//! standby never compares that mtime against its own clock, since the two
//! hosts' clocks may be skewed; it only asks whether the mtime *changed*
//! between successive observations.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle on the liveness file at a fixed path.
#[derive(Debug, Clone)]
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Touch the file's modification time, creating the file if needed.
    ///
    /// Called every handshake period by whichever server is active. Errors
    /// are *transient-io*: the caller logs and retries on the next tick.
    pub fn touch(&self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        file.set_modified(SystemTime::now())?;
        file.sync_all()?;
        Ok(())
    }

    /// Observe the current mtime as seconds since the epoch.
    ///
    /// A stat failure is *transient-io*; the caller treats it as "unknown,
    /// wait and retry". The returned value is only meaningful relative to
    /// earlier observations of the same file.
    pub fn observe_mtime(&self) -> io::Result<u64> {
        let meta = std::fs::metadata(&self.path)?;
        let mtime = meta.modified()?;
        Ok(unix_seconds(mtime))
    }

    /// Set the mtime to an explicit instant. Test scaffolding for the
    /// stagnation checks; the production writer always uses [`touch`].
    ///
    /// [`touch`]: LivenessFile::touch
    pub fn set_mtime(&self, at: SystemTime) -> io::Result<()> {
        let file = File::options().write(true).open(&self.path)?;
        file.set_modified(at)?;
        Ok(())
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
