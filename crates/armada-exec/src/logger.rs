use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};

/// Append-only log file for one task, shared by the scheduler and the step
/// runner's stream copiers. Every line carries an RFC 3339 timestamp.
pub struct TaskLogger {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
    keep: bool,
    errored: AtomicBool,
}

impl TaskLogger {
    fn create(scratch_root: &Path, prefix: &str, keep: bool) -> Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!("{prefix}."))
            .suffix(".log")
            .tempfile_in(scratch_root)
            .with_context(|| format!("create log file with prefix {prefix:?}"))?
            .keep()
            .context("persist log file")?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            keep,
            errored: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Write failures are swallowed; losing a
    /// log line must not fail the task producing it.
    pub fn log(&self, line: &str) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{ts} {line}");
        }
    }

    /// Append one line of container output, prefixed with its stream name.
    pub fn log_stream(&self, stream: &str, line: &str) {
        self.log(&format!("{stream} | {line}"));
    }

    /// Flag the task as failed so the file survives `close`.
    pub fn mark_errored(&self) {
        self.errored.store(true, Ordering::SeqCst);
    }

    /// Close the file and apply the retention policy: keep it when the task
    /// errored or logs are kept globally, delete it otherwise. Idempotent.
    pub fn close(&self) -> Result<()> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner()).take();
        if file.is_none() {
            return Ok(());
        }
        drop(file);

        if self.errored.load(Ordering::SeqCst) || self.keep {
            return Ok(());
        }
        std::fs::remove_file(&self.path)
            .with_context(|| format!("remove log file {}", self.path.display()))
    }
}

/// Owns every task logger of a run and closes them collectively.
pub struct LogManager {
    keep_logs: bool,
    loggers: Mutex<Vec<std::sync::Arc<TaskLogger>>>,
}

impl LogManager {
    pub fn new(keep_logs: bool) -> Self {
        Self {
            keep_logs,
            loggers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_task(&self, prefix: &str, scratch_root: &Path) -> Result<std::sync::Arc<TaskLogger>> {
        let logger = std::sync::Arc::new(TaskLogger::create(scratch_root, prefix, self.keep_logs)?);
        self.loggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(logger.clone());
        Ok(logger)
    }

    /// Close all loggers, accumulating failures instead of stopping at the
    /// first.
    pub fn close(&self) -> Result<()> {
        let loggers = self.loggers.lock().unwrap_or_else(|e| e.into_inner());
        let errors: Vec<String> = loggers
            .iter()
            .filter_map(|l| l.close().err().map(|e| format!("{e:#}")))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "closing {} task log(s) failed: {}",
                errors.len(),
                errors.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn lines_are_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(true);
        let logger = manager.add_task("changeset-acme-widgets", dir.path()).unwrap();

        logger.log("[Step 1] docker run alpine:3");
        logger.log_stream("stdout", "hello");
        logger.close().unwrap();

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let (ts, rest) = line.split_once(' ').unwrap();
            DateTime::parse_from_rfc3339(ts).unwrap();
            assert!(!rest.is_empty());
        }
        assert!(lines[1].ends_with("stdout | hello"));
    }

    #[test]
    fn close_deletes_unless_kept_or_errored() {
        let dir = tempfile::tempdir().unwrap();

        let manager = LogManager::new(false);
        let discarded = manager.add_task("t", dir.path()).unwrap();
        let errored = manager.add_task("t", dir.path()).unwrap();
        errored.mark_errored();

        let keeping = LogManager::new(true);
        let kept = keeping.add_task("t", dir.path()).unwrap();

        discarded.close().unwrap();
        errored.close().unwrap();
        kept.close().unwrap();

        assert!(!discarded.path().exists());
        assert!(errored.path().exists());
        assert!(kept.path().exists());
    }

    #[test]
    fn manager_close_is_collective_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(false);
        let a = manager.add_task("a", dir.path()).unwrap();
        let b = manager.add_task("b", dir.path()).unwrap();

        // One logger already closed individually; the manager must not trip
        // over it.
        a.close().unwrap();
        manager.close().unwrap();

        assert!(!a.path().exists());
        assert!(!b.path().exists());
    }
}
