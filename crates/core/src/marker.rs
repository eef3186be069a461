//! Active-marker file: the secondary's claim on the active role.
//!
//! Created (truncate-and-write, one line with the secondary's hostname) when
//! the secondary promotes itself. The primary stats it on every handshake
//! tick; finding it means the primary was displaced and must recycle. The
//! secondary removes it when it surrenders the role.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Handle on the active-marker file at a fixed path.
#[derive(Debug, Clone)]
pub struct ActiveMarker {
    path: PathBuf,
}

impl ActiveMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the marker claiming the active role for `host`.
    pub fn create(&self, host: &str) -> io::Result<()> {
        let mut file = fs::File::create(&self.path)?;
        writeln!(file, "{}", host)?;
        file.sync_all()?;
        Ok(())
    }

    /// Whether the marker currently exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the hostname recorded in the marker, if present.
    pub fn read_host(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(body) => Ok(Some(body.trim_end().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the marker. Removing an absent marker is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_read_remove() {
        let tmp = TempDir::new().unwrap();
        let marker = ActiveMarker::new(tmp.path().join("secondary_active"));

        assert!(!marker.exists());
        assert_eq!(marker.read_host().unwrap(), None);

        marker.create("standby.example.com").unwrap();
        assert!(marker.exists());
        assert_eq!(
            marker.read_host().unwrap().as_deref(),
            Some("standby.example.com")
        );

        marker.remove().unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let marker = ActiveMarker::new(tmp.path().join("secondary_active"));
        marker.remove().unwrap();
        marker.remove().unwrap();
    }

    #[test]
    fn create_truncates_previous_claim() {
        let tmp = TempDir::new().unwrap();
        let marker = ActiveMarker::new(tmp.path().join("secondary_active"));
        marker.create("a-very-long-hostname.example.com").unwrap();
        marker.create("b.example.com").unwrap();
        assert_eq!(marker.read_host().unwrap().as_deref(), Some("b.example.com"));
    }
}
