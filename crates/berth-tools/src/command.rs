//! Timeout-aware, cancellable subprocess execution shared by the container
//! runtime and cluster clients.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_types::{BerthError, CancellationToken, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Variables whose names end with one of these (case-insensitively) never
/// reach child processes.
const SECRET_SUFFIXES: [&str; 5] = ["_API_KEY", "_SECRET", "_TOKEN", "_PASSWORD", "_CREDENTIAL"];

/// Passed through even when they look like secrets.
const RUNTIME_VARS: [&str; 7] = [
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TMPDIR",
    "DOCKER_HOST",
    "KUBECONFIG",
];

fn child_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars().filter(|(key, _)| {
        let upper = key.to_ascii_uppercase();
        RUNTIME_VARS.contains(&key.as_str()) || !SECRET_SUFFIXES.iter().any(|s| upper.ends_with(s))
    })
}

fn collect<R: AsyncRead + Unpin + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "Child output pipe closed early");
        }
        buf
    })
}

/// Result of running an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout and stderr joined, for error reports.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs programs directly (no shell) with a scrubbed environment.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    extra_env: HashMap<String, String>,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            extra_env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program` with `args` in `cwd`.
    ///
    /// A timeout is reported through `CommandOutput::timed_out` rather than an
    /// error so callers can decide whether it is retryable. Cancellation kills
    /// the process group and returns `Cancelled`.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env_clear()
            .envs(child_env())
            .envs(&self.extra_env)
            .kill_on_drop(true);

        // Own process group so a kill reaches grandchildren too.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        tracing::debug!(program, ?args, cwd = %cwd.display(), "Spawning command");
        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            BerthError::execution(program, format!("failed to spawn '{program}': {e}"))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BerthError::execution(program, "child output was not captured"));
        };
        let (stdout_task, stderr_task) = (collect(stdout), collect(stderr));

        let mut timed_out = false;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(self.timeout) => {
                timed_out = true;
                terminate(&mut child).await;
                None
            }
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(BerthError::Cancelled { operation: program.to_string() });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let mut stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        if timed_out {
            stderr.push_str(&format!("\nKilled after {}ms", self.timeout.as_millis()));
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Try graceful termination of the process group, then force kill.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signalling a process group we spawned; a stale pid only yields ESRCH.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            _ = child.wait() => return,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
    }
    let _ = child.kill().await;
}

/// Locate `program` on `PATH`, for diagnostics.
pub fn which(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
