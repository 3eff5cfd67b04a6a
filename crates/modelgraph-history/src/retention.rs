use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use modelgraph_core::Result;

use crate::checkpoint::checkpoint_files;

/// Age-based eviction of checkpoint files. Count is never considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retain: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::days(7)
    }
}

impl RetentionPolicy {
    pub fn new(retain: Duration) -> Self {
        Self { retain }
    }

    pub fn days(days: i64) -> Self {
        Self::new(Duration::days(days))
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retain
    }

    /// Delete checkpoints in `dir` created before `now - retain`.
    pub fn sweep(&self, dir: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        self.sweep_by(dir, now, file_created_at)
    }

    /// Like [`sweep`](Self::sweep) with a caller-supplied creation time.
    pub fn sweep_by<F>(&self, dir: &Path, now: DateTime<Utc>, created_at: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&Path) -> io::Result<DateTime<Utc>>,
    {
        let cutoff = self.cutoff(now);
        let mut removed = Vec::new();

        for path in checkpoint_files(dir)? {
            let created = match created_at(&path) {
                Ok(created) => created,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read checkpoint age, keeping it");
                    continue;
                }
            };

            if created < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "Expired checkpoint deleted");
                        removed.push(path);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete expired checkpoint")
                    }
                }
            }
        }

        if !removed.is_empty() {
            info!(dir = %dir.display(), removed = removed.len(), "Retention sweep finished");
        }
        Ok(removed)
    }
}

/// File creation time, or modification time on filesystems that do not
/// record creation.
pub fn file_created_at(path: &Path) -> io::Result<DateTime<Utc>> {
    let metadata = fs::metadata(path)?;
    let time = metadata.created().or_else(|_| metadata.modified())?;
    Ok(DateTime::<Utc>::from(time))
}
