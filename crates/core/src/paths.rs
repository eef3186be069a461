//! Filesystem layout under the server home directory.
//!
//! Both servers of a failover pair point at the same home on shared storage;
//! the liveness file and the active marker are how they see each other when
//! the control channel is down.

use crate::config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Resolved locations of the failover files under one server home.
#[derive(Debug, Clone)]
pub struct ServerHome {
    home: PathBuf,
}

impl ServerHome {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Create the private and spool directories if they do not exist.
    pub fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(self.priv_dir())?;
        fs::create_dir_all(self.spool_dir())?;
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// `<home>/server_priv`: private state directory.
    pub fn priv_dir(&self) -> PathBuf {
        self.home.join(config::PRIV_DIR_NAME)
    }

    /// `<home>/spool`: fence output captures land here.
    pub fn spool_dir(&self) -> PathBuf {
        self.home.join(config::SPOOL_DIR_NAME)
    }

    /// `<priv>/svrlive`: touched every handshake period by the active server.
    pub fn liveness_path(&self) -> PathBuf {
        self.priv_dir().join(config::LIVENESS_FILE_NAME)
    }

    /// `<priv>/secondary_active`: created by the secondary on promotion.
    pub fn marker_path(&self) -> PathBuf {
        self.priv_dir().join(config::ACTIVE_MARKER_FILE_NAME)
    }

    /// `<priv>/license.fo`: 8-byte XOR of the two host identifiers.
    pub fn license_path(&self) -> PathBuf {
        self.priv_dir().join(config::LICENSE_FILE_NAME)
    }

    /// `<priv>/stonith`: optional operator-supplied fencing executable.
    pub fn fence_script_path(&self) -> PathBuf {
        self.priv_dir().join(config::FENCE_SCRIPT_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_is_created_under_home() {
        let tmp = TempDir::new().unwrap();
        let home = ServerHome::new(tmp.path());
        home.ensure_layout().unwrap();
        assert!(home.priv_dir().is_dir());
        assert!(home.spool_dir().is_dir());
        assert!(home.liveness_path().starts_with(home.priv_dir()));
    }
}
