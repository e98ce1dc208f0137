//! Isolated command execution.
//!
//! Commands run through a POSIX shell with a child environment built only
//! from the task's declared allowlist. No host variable passes through: a
//! task that needs `PATH` must declare it. The child gets its own process
//! group so cancellation kills the whole tree.

use crate::{Error, Result, Task};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Execution context shared by every task body in a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Working directory the command runs in.
    pub workdir: PathBuf,
    /// Cooperative cancellation signal for the run.
    pub cancel: CancellationToken,
}

/// Captured result of one command execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Full stdout bytes.
    pub stdout: Vec<u8>,
    /// Full stderr bytes.
    pub stderr: Vec<u8>,
    /// Child exit status code.
    pub exit_code: i32,
    /// The task hash this execution was performed for.
    pub hash: String,
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child was placed in its own process group with pgid == pid.
    // SAFETY: killpg is async-signal-safe and takes plain integers.
    #[allow(unsafe_code)]
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Run `task.run` through `sh -c` under strict environment isolation.
///
/// stdout and stderr are captured to byte buffers in full. On cancellation
/// the child's process group receives `SIGKILL`, the child is reaped, and a
/// cancellation error is returned.
///
/// # Errors
///
/// Fails on an empty `run`, a child that cannot be started, or
/// cancellation. A non-zero exit status is NOT an error here; it is
/// reported through `exit_code`.
pub async fn execute(task: &Task, hash: &str, ctx: &ExecutionContext) -> Result<ExecutionOutput> {
    if task.run.is_empty() {
        return Err(Error::execution(format!(
            "task '{}' has an empty run command",
            task.name
        )));
    }

    tracing::debug!(
        task = %task.name,
        workdir = %ctx.workdir.display(),
        env_vars = task.env.len(),
        "executing command"
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&task.run)
        .current_dir(&ctx.workdir)
        .env_clear()
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &task.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(e, &ctx.workdir, format!("spawn task {}", task.name)))?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
        Error::system(format!("stdout pipe not available for task '{}'", task.name))
    })?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
        Error::system(format!("stderr pipe not available for task '{}'", task.name))
    })?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        biased;

        () = ctx.cancel.cancelled() => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            // Reap so no zombie outlives the run.
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            tracing::warn!(task = %task.name, "task killed by cancellation");
            return Err(Error::Cancelled);
        }
        status = child.wait() => {
            status.map_err(|e| Error::io(e, &ctx.workdir, format!("wait for task {}", task.name)))?
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| Error::system(format!("stdout reader failed: {e}")))?;
    let stderr = stderr_task
        .await
        .map_err(|e| Error::system(format!("stderr reader failed: {e}")))?;
    let exit_code = status.code().unwrap_or(-1);

    if exit_code != 0 {
        tracing::warn!(task = %task.name, exit = exit_code, "task exited non-zero");
    }

    Ok(ExecutionOutput {
        stdout,
        stderr,
        exit_code,
        hash: hash.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ExecutionContext {
        ExecutionContext {
            workdir: dir.path().to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    fn shell_task(run: &str) -> Task {
        Task {
            name: "t".into(),
            inputs: vec![],
            run: run.into(),
            env: BTreeMap::new(),
            outputs: vec![],
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let out = execute(&shell_task("echo hello"), "h", &ctx(&tmp)).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"hello\n");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let out = execute(&shell_task("exit 7"), "h", &ctx(&tmp)).await.unwrap();
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn host_environment_is_invisible() {
        let tmp = TempDir::new().unwrap();
        // HOME is set in essentially every host environment; the child must
        // not see it.
        let out = execute(
            &shell_task("echo ${HOME:-unset}"),
            "h",
            &ctx(&tmp),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, b"unset\n");
    }

    #[tokio::test]
    async fn declared_env_is_the_whole_environment() {
        let tmp = TempDir::new().unwrap();
        let mut task = shell_task("/usr/bin/env");
        task.env.insert("ONLY_VAR".into(), "present".into());
        let out = execute(&task, "h", &ctx(&tmp)).await.unwrap();
        let rendered = String::from_utf8_lossy(&out.stdout);
        assert!(rendered.contains("ONLY_VAR=present"));
        assert!(!rendered.contains("PATH="));
    }

    #[tokio::test]
    async fn empty_run_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = execute(&shell_task(""), "h", &ctx(&tmp)).await.unwrap_err();
        assert!(err.to_string().contains("empty run"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let tmp = TempDir::new().unwrap();
        let context = ctx(&tmp);
        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = execute(&shell_task("sleep 30"), "h", &context).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
