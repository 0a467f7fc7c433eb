//! Execution engine for campaign tasks.
//!
//! For every (repository, steps, changeset template) task the engine fetches
//! a snapshot archive, materializes it as a git working tree under the
//! scratch root, runs the step containers in order with the tree bind-mounted
//! at `/work`, and packages the resulting diff as a changeset spec. Tasks run
//! with bounded parallelism, carry per-task logs and timeouts, and are
//! deduplicated through a content-addressed execution cache.

pub mod cache;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod logger;
pub mod status;
mod steps;
pub mod workspace;

pub use cache::{DiskCache, ExecutionCache, NoopCache};
pub use error::ExecError;
pub use executor::{Executor, ExecutorOpts, UpdateCallback, DEFAULT_RUNTIME_BIN};
pub use fetch::{ArchiveFetcher, HttpArchiveFetcher};
pub use logger::{LogManager, TaskLogger};
pub use status::TaskStatus;
pub use workspace::DEFAULT_SCRATCH_ROOT;
