use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use armada_core::Step;

use crate::logger::TaskLogger;

/// Mount point of the workspace inside every step container.
const CONTAINER_WORKDIR: &str = "/work";

/// Why a step did not complete. The caller turns these into task errors; the
/// runner itself has no notion of a repository.
pub(crate) enum StepFailure {
    /// The per-task deadline fired; the container was killed.
    Timeout,
    /// The caller cancelled the run; the container was killed.
    Cancelled,
    Error(anyhow::Error),
}

/// Run one container step against the workspace. The container id sidecar is
/// removed and a best-effort `rm -f` issued on every exit path, so a runtime
/// that ignored `--rm` still does not leak containers.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_step(
    runtime_bin: &str,
    workspace: &Path,
    scratch_root: &Path,
    prefix: &str,
    step: &Step,
    index: usize,
    logger: &Arc<TaskLogger>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), StepFailure> {
    let cid_path = reserve_cid_path(scratch_root, prefix).map_err(StepFailure::Error)?;
    let result = run_container(
        runtime_bin, workspace, step, index, logger, &cid_path, deadline, cancel,
    )
    .await;
    remove_container(runtime_bin, &cid_path).await;
    result
}

/// Reserve a unique sidecar path without leaving a file behind: the runtime
/// refuses to start if the cidfile already exists.
fn reserve_cid_path(scratch_root: &Path, prefix: &str) -> Result<PathBuf> {
    let (file, path) = tempfile::Builder::new()
        .prefix(&format!("{prefix}-container-id."))
        .tempfile_in(scratch_root)
        .context("create container id sidecar")?
        .keep()
        .context("persist container id sidecar")?;
    drop(file);
    std::fs::remove_file(&path).context("clear container id sidecar")?;
    Ok(path)
}

#[allow(clippy::too_many_arguments)]
async fn run_container(
    runtime_bin: &str,
    workspace: &Path,
    step: &Step,
    index: usize,
    logger: &Arc<TaskLogger>,
    cid_path: &Path,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), StepFailure> {
    logger.log(&format!("[Step {index}] {runtime_bin} run {}", step.image()));

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--cidfile".into(),
        cid_path.display().to_string(),
        "--workdir".into(),
        CONTAINER_WORKDIR.into(),
        "--mount".into(),
        format!(
            "type=bind,source={},target={}",
            workspace.display(),
            CONTAINER_WORKDIR
        ),
    ];
    for (key, value) in &step.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push("--".into());
    args.push(step.image().to_string());
    // The run string rides as a single argument; the container's default
    // entrypoint is responsible for interpreting it.
    args.push(step.run.clone());

    if let Ok(rendered) = serde_json::to_string(&args) {
        logger.log(&rendered);
    }

    let mut child = Command::new(runtime_bin)
        .args(&args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StepFailure::Error(
                anyhow!(e).context(format!("launching container runtime {runtime_bin:?}")),
            )
        })?;

    let out_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(pipe_stream(s, logger.clone(), "stdout")));
    let err_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(pipe_stream(s, logger.clone(), "stderr")));

    let started = Instant::now();
    let status = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => status,
            Err(e) => {
                return Err(StepFailure::Error(
                    anyhow!(e).context("waiting for container"),
                ))
            }
        },
        _ = tokio::time::sleep_until(deadline) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            logger.log(&format!(
                "[Step {index}] took {:?}; killed at the task deadline",
                round_ms(started.elapsed())
            ));
            return Err(StepFailure::Timeout);
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            logger.log(&format!("[Step {index}] cancelled"));
            return Err(StepFailure::Cancelled);
        }
    };

    // Drain the copiers so every output line lands before the step returns.
    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }

    let elapsed = round_ms(started.elapsed());
    if !status.success() {
        logger.log(&format!(
            "[Step {index}] took {elapsed:?}; error running container: {status}"
        ));
        return Err(StepFailure::Error(anyhow!("container exited with {status}")));
    }

    debug!(step = index, image = step.image(), ?elapsed, "step complete");
    logger.log(&format!("[Step {index}] complete in {elapsed:?}"));
    Ok(())
}

async fn pipe_stream<R: AsyncRead + Unpin>(stream: R, logger: Arc<TaskLogger>, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger.log_stream(name, &line);
    }
}

/// Read the sidecar if the runtime wrote one and force-remove that container
/// under a short deadline of its own, detached from the task's. Failures are
/// ignored: this only guards against a runtime that did not honor `--rm`.
async fn remove_container(runtime_bin: &str, cid_path: &Path) {
    let cid = std::fs::read_to_string(cid_path).ok();
    let _ = std::fs::remove_file(cid_path);
    let Some(cid) = cid else { return };
    let cid = cid.trim();
    if cid.is_empty() {
        return;
    }

    let mut rm = Command::new(runtime_bin);
    rm.args(["rm", "-f", "--", cid])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), rm.status()).await;
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogManager;

    #[tokio::test]
    async fn missing_runtime_is_a_step_error_and_leaves_no_sidecar() {
        let scratch = tempfile::tempdir().unwrap();
        let manager = LogManager::new(true);
        let logger = manager.add_task("t", scratch.path()).unwrap();
        let step = Step::new("alpine:3", "true").resolve("sha256:aa");

        let failure = run_step(
            "/nonexistent/container-runtime",
            scratch.path(),
            scratch.path(),
            "t",
            &step,
            1,
            &logger,
            Instant::now() + Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match failure {
            StepFailure::Error(e) => {
                assert!(format!("{e:#}").contains("container runtime"), "{e:#}")
            }
            _ => panic!("expected spawn failure"),
        }

        let leftover: Vec<_> = std::fs::read_dir(scratch.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("container-id"))
            .collect();
        assert!(leftover.is_empty(), "sidecars left behind: {leftover:?}");
    }
}
