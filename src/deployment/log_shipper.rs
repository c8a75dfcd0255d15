//! Wraps a line-delimited deployment log into the JSON shape the server
//! expects, and prunes old logs before a new one is written (spec §4.7).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Keep at most this many rotated log files.
pub const LOG_RETENTION_COUNT: usize = 5;
/// Keep pruning until at least this much space is free in the log
/// directory's filesystem.
pub const LOG_RETENTION_FREE_BYTES: u64 = 100 * 1024;

const WRAPPER_PREFIX: &str = "{\"messages\":[";
const WRAPPER_SUFFIX: &str = "]}";

/// Read `log_file_path` (one JSON object per line) and wrap it as
/// `{"messages":[obj,obj,...]}`, replacing the newlines between entries
/// with commas.
pub fn wrap_log_file(log_file_path: &Path) -> io::Result<Vec<u8>> {
    let contents = fs::read_to_string(log_file_path)?;
    let trimmed = contents.strip_suffix('\n').unwrap_or(&contents);
    let joined = trimmed.lines().collect::<Vec<_>>().join(",");

    let mut body = Vec::with_capacity(WRAPPER_PREFIX.len() + joined.len() + WRAPPER_SUFFIX.len());
    body.extend_from_slice(WRAPPER_PREFIX.as_bytes());
    body.extend_from_slice(joined.as_bytes());
    body.extend_from_slice(WRAPPER_SUFFIX.as_bytes());
    Ok(body)
}

/// Manages a directory of rotated deployment log files named
/// `deployments.<NNNN>.<id>.log`. The log currently being written is
/// always index `0000`; older logs are re-indexed `0001`, `0002`, … on
/// each rotation.
pub struct LogDirectory {
    dir: PathBuf,
}

impl LogDirectory {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The path the active (index `0000`) log for `deployment_id` should
    /// be written to. Rotates existing logs out of the way first, keeping
    /// at most [`LOG_RETENTION_COUNT`] and pruning the oldest until
    /// [`LOG_RETENTION_FREE_BYTES`] is free.
    pub fn begin_new_log(&self, deployment_id: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let mut existing = self.list_logs()?;
        existing.sort_by_key(|(index, _)| *index);

        while existing.len() >= LOG_RETENTION_COUNT {
            let (_, oldest) = existing.remove(existing.len() - 1);
            let _ = fs::remove_file(oldest);
        }

        while !self.has_enough_free_space()? && !existing.is_empty() {
            let (_, oldest) = existing.remove(existing.len() - 1);
            let _ = fs::remove_file(oldest);
        }

        for (index, path) in existing.iter().rev() {
            let new_index = index + 1;
            let new_path = self.dir.join(log_file_name(new_index, deployment_id));
            if *path != new_path {
                fs::rename(path, new_path)?;
            }
        }

        Ok(self.dir.join(log_file_name(0, deployment_id)))
    }

    fn list_logs(&self) -> io::Result<Vec<(u32, PathBuf)>> {
        let mut logs = Vec::new();
        if !self.dir.exists() {
            return Ok(logs);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_log_index(name) {
                logs.push((index, entry.path()));
            }
        }
        Ok(logs)
    }

    fn has_enough_free_space(&self) -> io::Result<bool> {
        let free = fs2::available_space(&self.dir)?;
        Ok(free >= LOG_RETENTION_FREE_BYTES)
    }
}

fn log_file_name(index: u32, deployment_id: &str) -> String {
    format!("deployments.{index:04}.{deployment_id}.log")
}

fn parse_log_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("deployments.")?;
    let (index, _) = rest.split_once('.')?;
    index.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_lines_into_a_messages_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").unwrap();
        let body = wrap_log_file(&path).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"messages":[{"a":1},{"a":2}]}"#
        );
    }

    #[test]
    fn rotation_keeps_at_most_the_retention_count() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().to_path_buf());
        for i in 0..LOG_RETENTION_COUNT {
            let path = logs.begin_new_log("dep-1").unwrap();
            std::fs::write(&path, format!("entry {i}")).unwrap();
        }
        // One more rotation should not grow past the cap.
        let path = logs.begin_new_log("dep-1").unwrap();
        std::fs::write(&path, "latest").unwrap();

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(count <= LOG_RETENTION_COUNT);
    }

    #[test]
    fn newest_log_is_always_index_zero() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDirectory::new(dir.path().to_path_buf());
        let first = logs.begin_new_log("dep-1").unwrap();
        assert!(first.ends_with("deployments.0000.dep-1.log"));
        std::fs::write(&first, "first").unwrap();

        let second = logs.begin_new_log("dep-1").unwrap();
        assert!(second.ends_with("deployments.0000.dep-1.log"));
        assert!(dir.path().join("deployments.0001.dep-1.log").exists());
    }
}
