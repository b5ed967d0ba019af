//! Per-path read/write bookkeeping.
//!
//! The contract between read and mutate tools: a path must have been read
//! in this process before it may be edited, and a file whose mtime is newer
//! than the recorded read is stale. Timestamps are our own wall clock, not
//! filesystem mtime, so hosts with coarse mtimes still behave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::ToolResponse;

#[derive(Debug, Clone, Copy, Default)]
struct FileTimes {
    read: Option<SystemTime>,
    write: Option<SystemTime>,
}

#[derive(Default)]
pub struct FileRecords {
    inner: RwLock<HashMap<PathBuf, FileTimes>>,
}

impl FileRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, path: &Path) {
        let mut map = self.inner.write().expect("file record lock poisoned");
        map.entry(path.to_path_buf()).or_default().read = Some(SystemTime::now());
    }

    pub fn record_write(&self, path: &Path) {
        let mut map = self.inner.write().expect("file record lock poisoned");
        map.entry(path.to_path_buf()).or_default().write = Some(SystemTime::now());
    }

    pub fn last_read(&self, path: &Path) -> Option<SystemTime> {
        self.inner
            .read()
            .expect("file record lock poisoned")
            .get(path)
            .and_then(|t| t.read)
    }

    pub fn last_write(&self, path: &Path) -> Option<SystemTime> {
        self.inner
            .read()
            .expect("file record lock poisoned")
            .get(path)
            .and_then(|t| t.write)
    }

    /// Gate for edit/overwrite/delete of an existing file: the path must
    /// have been read here, and not modified on disk since.
    pub fn check_mutable(&self, path: &Path) -> Result<(), ToolResponse> {
        let Some(last_read) = self.last_read(path) else {
            return Err(ToolResponse::error(format!(
                "you must read the file before editing it. Use the view tool first: {}",
                path.display()
            )));
        };

        let mod_time = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| ToolResponse::error(format!("failed to access file: {e}")))?;

        if mod_time > last_read {
            return Err(ToolResponse::error(format!(
                "file {} has been modified since it was last read (mod time: {}, last read: {})",
                path.display(),
                rfc3339(mod_time),
                rfc3339(last_read)
            )));
        }
        Ok(())
    }
}

pub fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unread_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();

        let records = FileRecords::new();
        let err = records.check_mutable(&path).unwrap_err();
        assert!(err.content.contains("must read the file before editing"));
    }

    #[test]
    fn stale_file_reports_both_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();

        let records = FileRecords::new();
        records.record_read(&path);

        // Out-of-band modification after the read.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, "y").unwrap();

        let err = records.check_mutable(&path).unwrap_err();
        assert!(err.content.contains("has been modified since it was last read"));
        // Two RFC3339 timestamps with timezone offsets.
        assert!(err.content.matches('T').count() >= 2);
        assert!(err.content.contains("mod time:"));
        assert!(err.content.contains("last read:"));
    }

    #[test]
    fn fresh_read_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();

        let records = FileRecords::new();
        std::thread::sleep(Duration::from_millis(20));
        records.record_read(&path);
        assert!(records.check_mutable(&path).is_ok());
        assert!(records.last_read(&path).is_some());
        assert!(records.last_write(&path).is_none());
    }
}
