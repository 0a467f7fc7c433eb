use std::path::PathBuf;

use chrono::{DateTime, Utc};

use armada_core::ChangesetSpec;

/// Observable per-task state record. Fields are populated monotonically:
/// `enqueued_at` at registration, `started_at` when a worker picks the task
/// up, and `finished_at` together with exactly one of `changeset_spec` or
/// `error` at the terminal transition.
#[derive(Clone, Debug, Default)]
pub struct TaskStatus {
    /// The result came out of the execution cache; no step ran and no log
    /// file exists.
    pub cached: bool,
    pub log_file: Option<PathBuf>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub changeset_spec: Option<ChangesetSpec>,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.is_terminal() && self.error.is_none()
    }
}
