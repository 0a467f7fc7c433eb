use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use armada_core::{
    task_fingerprint, ChangesetSpec, ChangesetTemplate, CreatedChangeset, GitCommitDescription,
    Repository, Step, Task,
};

use crate::cache::ExecutionCache;
use crate::error::ExecError;
use crate::fetch::ArchiveFetcher;
use crate::logger::{LogManager, TaskLogger};
use crate::status::TaskStatus;
use crate::steps::{self, StepFailure};
use crate::workspace;

/// Container runtime binary resolved on `PATH`.
pub const DEFAULT_RUNTIME_BIN: &str = "docker";

/// Invoked on every observable state transition of a task. Workers call this
/// concurrently for distinct tasks; invocations for the same task are totally
/// ordered. Serialize externally if the consumer needs a global order.
pub type UpdateCallback = Arc<dyn Fn(&Task, &TaskStatus) + Send + Sync>;

pub struct ExecutorOpts {
    pub cache: Arc<dyn ExecutionCache>,
    pub fetcher: Arc<dyn ArchiveFetcher>,
    /// Container runtime binary. Injected so tests can substitute a stub.
    pub runtime_bin: String,
    /// Root for workspaces, archives, logs and cid sidecars. Defaults to
    /// [`workspace::DEFAULT_SCRATCH_ROOT`]; see there for why it is not the
    /// ambient temp dir.
    pub scratch_root: PathBuf,
    /// Upper bound on concurrently running tasks. Clamped to at least 1.
    pub parallelism: usize,
    /// Wall-clock budget for one task's step execution.
    pub timeout: Duration,
    /// Drop any existing cache entry instead of consulting it.
    pub clear_cache: bool,
    /// Retain every task log, not only those of failed tasks.
    pub keep_logs: bool,
}

impl ExecutorOpts {
    pub fn new(cache: Arc<dyn ExecutionCache>, fetcher: Arc<dyn ArchiveFetcher>) -> Self {
        Self {
            cache,
            fetcher,
            runtime_bin: DEFAULT_RUNTIME_BIN.into(),
            scratch_root: workspace::DEFAULT_SCRATCH_ROOT.into(),
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeout: Duration::from_secs(60 * 60),
            clear_cache: false,
            keep_logs: false,
        }
    }
}

/// Bounded-parallelism task executor: runs every registered task through
/// fetch → materialize → steps → diff, deduplicated by the execution cache,
/// and aggregates the produced changeset specs.
///
/// Tasks must be registered before [`start`](Executor::start); the first task
/// error is surfaced by [`wait`](Executor::wait) and discards partial
/// results. Other tasks keep running to completion regardless.
pub struct Executor {
    inner: Arc<Inner>,
    semaphore: Arc<Semaphore>,
    join_set: Arc<Mutex<JoinSet<Result<(), ExecError>>>>,
    started: AtomicBool,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

struct Inner {
    opts: ExecutorOpts,
    logs: LogManager,
    update: Option<UpdateCallback>,
    tasks: Mutex<Vec<Arc<Task>>>,
    statuses: Mutex<Vec<TaskStatus>>,
    specs: Mutex<Vec<ChangesetSpec>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Executor {
    pub fn new(opts: ExecutorOpts, update: Option<UpdateCallback>) -> Self {
        let parallelism = opts.parallelism.max(1);
        let keep_logs = opts.keep_logs;
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                logs: LogManager::new(keep_logs),
                update,
                tasks: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
                specs: Mutex::new(Vec::new()),
                opts,
            }),
            semaphore: Arc::new(Semaphore::new(parallelism)),
            join_set: Arc::new(Mutex::new(JoinSet::new())),
            started: AtomicBool::new(false),
            done_tx: Arc::new(done_tx),
            done_rx,
        }
    }

    /// Register a task. Not supported after [`start`](Executor::start): the
    /// worker set is enumerated once.
    pub fn add_task(&self, repository: Repository, steps: Vec<Step>, template: ChangesetTemplate) {
        debug_assert!(
            !self.started.load(Ordering::SeqCst),
            "add_task after start is not supported"
        );
        let task = Arc::new(Task::new(repository, steps, template));
        let mut tasks = lock(&self.inner.tasks);
        let mut statuses = lock(&self.inner.statuses);
        tasks.push(task);
        statuses.push(TaskStatus {
            enqueued_at: Some(Utc::now()),
            ..TaskStatus::default()
        });
    }

    /// Spawn one worker per registered task and return immediately.
    /// Admission runs in the background: a permit is taken from the
    /// parallelism semaphore before each worker exists, so workers are
    /// admitted in registration order and at most `parallelism` run at once.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<Arc<Task>> = lock(&self.inner.tasks).clone();
        let inner = self.inner.clone();
        let semaphore = self.semaphore.clone();
        let join_set = self.join_set.clone();
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            for (index, task) in tasks.into_iter().enumerate() {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let inner = inner.clone();
                let cancel = cancel.clone();
                lock(&join_set).spawn(async move {
                    let _permit = permit;
                    inner.run_task(index, task, cancel).await
                });
            }
            let _ = done_tx.send(true);
        });
    }

    /// Block until every task reached a terminal state, then return the
    /// aggregated changeset specs in completion order. The first task error
    /// is returned instead and partial results are discarded.
    pub async fn wait(&self) -> Result<Vec<ChangesetSpec>, ExecError> {
        // One-shot condition set by start() once every worker is spawned.
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;

        let mut join_set = std::mem::take(&mut *lock(&self.join_set));
        let mut first_err: Option<ExecError> = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "task failed");
                    first_err.get_or_insert(e);
                }
                Err(join_err) => {
                    first_err.get_or_insert(ExecError::Internal {
                        cause: anyhow!(join_err),
                    });
                }
            }
        }

        if let Err(e) = self.inner.logs.close() {
            warn!(error = format!("{e:#}"), "closing task logs");
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(lock(&self.inner.specs).clone()),
        }
    }

    /// Snapshot of every task's status, indexed by registration order.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        lock(&self.inner.statuses).clone()
    }
}

impl Inner {
    fn update_status(&self, index: usize, task: &Task, mutate: impl FnOnce(&mut TaskStatus)) {
        let snapshot = {
            let mut statuses = lock(&self.statuses);
            mutate(&mut statuses[index]);
            statuses[index].clone()
        };
        if let Some(update) = &self.update {
            update(task, &snapshot);
        }
    }

    async fn run_task(
        &self,
        index: usize,
        task: Arc<Task>,
        cancel: CancellationToken,
    ) -> Result<(), ExecError> {
        let result = self.drive(index, &task, &cancel).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        self.update_status(index, &task, |status| {
            status.finished_at.get_or_insert_with(Utc::now);
            status.error = error;
        });
        result
    }

    async fn drive(
        &self,
        index: usize,
        task: &Arc<Task>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let repo = &task.repository;
        self.update_status(index, task, |status| {
            status.started_at = Some(Utc::now());
        });

        if repo.name.is_empty() {
            return Err(ExecError::Config {
                repo: repo.id.clone(),
                reason: "repository name is empty".into(),
            });
        }

        let key = task_fingerprint(task).map_err(|e| ExecError::Config {
            repo: repo.name.clone(),
            reason: e.to_string(),
        })?;

        if self.opts.clear_cache {
            self.opts
                .cache
                .clear(&key)
                .await
                .map_err(|cause| ExecError::Cache {
                    repo: repo.name.clone(),
                    op: "clear",
                    cause,
                })?;
        } else if let Some(spec) =
            self.opts
                .cache
                .get(&key)
                .await
                .map_err(|cause| ExecError::Cache {
                    repo: repo.name.clone(),
                    op: "get",
                    cause,
                })?
        {
            debug!(repo = %repo.name, "cache hit; skipping execution");
            self.update_status(index, task, |status| {
                status.cached = true;
                status.changeset_spec = Some(spec.clone());
                status.finished_at = Some(Utc::now());
            });
            lock(&self.specs).push(spec);
            return Ok(());
        }

        let log = self
            .logs
            .add_task(&format!("changeset-{}", repo.slug()), &self.opts.scratch_root)
            .map_err(|cause| ExecError::Log {
                repo: repo.name.clone(),
                cause,
            })?;
        lock(&self.statuses)[index].log_file = Some(log.path().to_path_buf());

        let deadline = Instant::now() + self.opts.timeout;
        let result = match self.execute(task, &log, cancel, deadline).await {
            Ok(diff) => {
                let spec = build_spec(task, &diff);
                self.update_status(index, task, |status| {
                    status.changeset_spec = Some(spec.clone());
                });
                lock(&self.specs).push(spec.clone());

                // Written under the caller's token, not the deadline: a
                // result computed just inside the budget is still worth
                // caching. If the caller has cancelled, skip silently.
                if cancel.is_cancelled() {
                    Ok(())
                } else {
                    self.opts
                        .cache
                        .set(&key, &spec)
                        .await
                        .map_err(|cause| ExecError::Cache {
                            repo: repo.name.clone(),
                            op: "set",
                            cause,
                        })
                }
            }
            Err(e) => Err(e),
        };

        if result.is_err() {
            log.mark_errored();
        }
        if let Err(e) = log.close() {
            warn!(repo = %repo.name, error = format!("{e:#}"), "closing task log");
        }
        result
    }

    /// Fetch → materialize → step loop → diff, all inside the workspace
    /// lifetime. The archive and workspace are unconditionally removed on
    /// exit; retained logs are the only scratch state that may survive.
    async fn execute(
        &self,
        task: &Task,
        log: &Arc<TaskLogger>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Vec<u8>, ExecError> {
        let repo = &task.repository;
        let name = &repo.name;

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled { repo: name.clone() });
        }

        let archive = self
            .opts
            .fetcher
            .fetch(repo, &self.opts.scratch_root, cancel)
            .await
            .map_err(|cause| {
                if cancel.is_cancelled() {
                    ExecError::Cancelled { repo: name.clone() }
                } else {
                    ExecError::Resolution {
                        repo: name.clone(),
                        cause,
                    }
                }
            })?;
        let _archive_guard = RemoveFileOnDrop(archive.clone());

        let prefix = format!("changeset-{}", repo.slug());
        let ws = workspace::extract_archive(&archive, &self.opts.scratch_root, &prefix).map_err(
            |cause| ExecError::Extract {
                repo: name.clone(),
                cause,
            },
        )?;
        let _ws_guard = RemoveDirOnDrop(ws.clone());

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ExecError::Cancelled { repo: name.clone() });
            }
            res = workspace::init_clean_tree(&ws) => {
                res.map_err(|cause| ExecError::Workspace {
                    repo: name.clone(),
                    cause,
                })?;
            }
        }

        for (i, step) in task.steps.iter().enumerate() {
            steps::run_step(
                &self.opts.runtime_bin,
                &ws,
                &self.opts.scratch_root,
                &prefix,
                step,
                i + 1,
                log,
                deadline,
                cancel,
            )
            .await
            .map_err(|failure| match failure {
                StepFailure::Timeout => ExecError::TimeoutReached {
                    repo: name.clone(),
                    timeout: self.opts.timeout,
                },
                StepFailure::Cancelled => ExecError::Cancelled { repo: name.clone() },
                StepFailure::Error(cause) => ExecError::Step {
                    repo: name.clone(),
                    image: step.image().to_string(),
                    cause,
                },
            })?;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                Err(ExecError::Cancelled { repo: name.clone() })
            }
            res = workspace::staged_diff(&ws) => {
                res.map_err(|cause| ExecError::Workspace {
                    repo: name.clone(),
                    cause,
                })
            }
        }
    }
}

fn build_spec(task: &Task, diff: &[u8]) -> ChangesetSpec {
    let repo = &task.repository;
    let template = &task.template;
    ChangesetSpec::Created(CreatedChangeset {
        base_repository: repo.id.clone(),
        base_ref: format!("refs/heads/{}", repo.default_branch),
        base_rev: repo.rev.clone(),
        head_repository: repo.id.clone(),
        head_ref: format!("refs/heads/{}", template.branch),
        title: template.title.clone(),
        body: template.body.clone(),
        commits: vec![GitCommitDescription {
            message: template.commit.message.clone(),
            diff: String::from_utf8_lossy(diff).into_owned(),
        }],
        published: template.published,
    })
}

struct RemoveFileOnDrop(PathBuf);

impl Drop for RemoveFileOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct RemoveDirOnDrop(PathBuf);

impl Drop for RemoveDirOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
