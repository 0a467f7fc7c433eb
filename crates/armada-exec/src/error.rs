use std::time::Duration;

use thiserror::Error;

/// Terminal error of one task. Every task-scoped variant names the
/// repository so aggregated output stays attributable.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The task is missing a required field.
    #[error("invalid task for {repo:?}: {reason}")]
    Config { repo: String, reason: String },

    /// Archive fetch or image-digest resolution failed.
    #[error("fetching archive for {repo:?}: {cause:#}")]
    Resolution { repo: String, cause: anyhow::Error },

    /// The archive was malformed or tried to escape the workspace.
    #[error("extracting archive for {repo:?}: {cause:#}")]
    Extract { repo: String, cause: anyhow::Error },

    /// Bootstrapping or diffing the working tree failed.
    #[error("preparing workspace for {repo:?}: {cause:#}")]
    Workspace { repo: String, cause: anyhow::Error },

    /// A container step could not be launched or exited non-zero.
    #[error("running container image {image:?} for {repo:?}: {cause:#}")]
    Step {
        repo: String,
        image: String,
        cause: anyhow::Error,
    },

    /// The per-task deadline was exhausted while a step was running.
    #[error("timeout reached for {repo:?}: execution took longer than {timeout:?}")]
    TimeoutReached { repo: String, timeout: Duration },

    /// Cache get/set/clear failed.
    #[error("cache {op} for {repo:?}: {cause:#}")]
    Cache {
        repo: String,
        op: &'static str,
        cause: anyhow::Error,
    },

    /// The per-task log file could not be created.
    #[error("creating log file for {repo:?}: {cause:#}")]
    Log { repo: String, cause: anyhow::Error },

    /// The caller cancelled the run.
    #[error("execution cancelled for {repo:?}")]
    Cancelled { repo: String },

    /// A task worker died without producing a result.
    #[error("internal executor failure: {cause:#}")]
    Internal { cause: anyhow::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_duration() {
        let err = ExecError::TimeoutReached {
            repo: "acme/widgets".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("1s"), "{err}");
    }

    #[test]
    fn step_error_names_the_image() {
        let err = ExecError::Step {
            repo: "acme/widgets".into(),
            image: "sha256:aa".into(),
            cause: anyhow::anyhow!("exit status: 3"),
        };
        let msg = err.to_string();
        assert!(msg.contains("sha256:aa"), "{msg}");
        assert!(msg.contains("acme/widgets"), "{msg}");
    }
}
