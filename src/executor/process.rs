//! Subprocess spawning, capped output capture, and cancellation, grounded
//! directly in the teacher's `dispatch::cli::CliDispatch::query_model`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountsStore;
use crate::queue::{ExecutionOutcome, Prompt};

use super::rate_limit;

/// The literal token submitted in place of a prompt's content when resuming
/// a previously rate-limited execution (spec.md §4.2, Glossary).
pub const RESUMPTION_TOKEN: &str = "continue";

/// What to actually hand the executor on this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSubmission {
    Original,
    Resume,
}

/// Outcome of a single `execute_prompt` call plus whatever was captured for
/// the prompt's bounded execution log.
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub captured_lines: Vec<String>,
}

/// Kills the entire process group (not just the leader PID) on drop, so
/// grandchildren spawned by the executor don't survive as orphans. Mirrors
/// `dispatch::cli::ProcessGroupGuard` verbatim.
pub(crate) struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

pub struct ExecutorAdapter {
    pub executable: String,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub output_capture_bytes: usize,
    pub execution_log_lines: usize,
    pub rate_limit_signals: Vec<String>,
    pub rate_limit_backoff_seconds: i64,
    pub cancel_grace: Duration,
    /// The account store backing the active-credentials directory this
    /// executor reads on every spawn (spec.md §5: "the active-credentials
    /// directory is read by C2 on every spawn and rewritten by C5 on use").
    pub accounts: Arc<AccountsStore>,
}

/// Apply the active profile's environment to a spawned command: unset every
/// variable this system is known to ever set, then apply the active
/// profile's API-key bindings (if any), so the executor never observes a
/// half-updated environment across a concurrent `use` (spec.md §4.5).
async fn apply_account_env(cmd: &mut Command, accounts: &AccountsStore) {
    cmd.env("CLAUDE_CONFIG_DIR", accounts.active_dir());
    match accounts.active_env_bindings().await {
        Ok((unset, set)) => {
            for var in unset {
                cmd.env_remove(var);
            }
            for (k, v) in set {
                cmd.env(k, v);
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to load account env bindings, spawning with inherited environment"),
    }
}

impl ExecutorAdapter {
    /// Fast probe, run once at processor startup (spec.md §4.2). Failure
    /// aborts startup with a clear message.
    pub async fn test_connection(&self) -> (bool, String) {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return (false, format!("failed to spawn {}: {e}", self.executable)),
        };

        match tokio::time::timeout(Duration::from_secs(2), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    (true, String::from_utf8_lossy(&output.stdout).trim().to_string())
                } else {
                    (
                        false,
                        format!(
                            "{} --version exited with {}",
                            self.executable,
                            output.status
                        ),
                    )
                }
            }
            Ok(Err(e)) => (false, format!("failed to run {}: {e}", self.executable)),
            Err(_) => (false, format!("{} --version timed out", self.executable)),
        }
    }

    /// Run the executor against one prompt. Never returns `Err` — every
    /// failure mode (spawn error, timeout, non-zero exit) is folded into an
    /// `ExecutionOutcome::Failure` so the processor always has a transition
    /// to apply (spec.md §4.4 step 6).
    pub async fn execute_prompt(
        &self,
        prompt: &Prompt,
        submission: PromptSubmission,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let content = match submission {
            PromptSubmission::Original => prompt.content.clone(),
            PromptSubmission::Resume => RESUMPTION_TOKEN.to_string(),
        };

        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.extra_args)
            .arg(&content)
            .current_dir(&prompt.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // Held across env setup and spawn so a concurrent `use_profile`
        // can't switch the active directory out from under us mid-spawn
        // (spec.md §5, Testable Property #7): `use_profile` takes the
        // write side of this same lock for its whole clear+copy.
        let _active_guard = self.accounts.read_active().await;
        apply_account_env(&mut cmd, &self.accounts).await;

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ExecutionResult {
                    outcome: ExecutionOutcome::Failure {
                        error: format!("failed to spawn {}: {e}", self.executable),
                    },
                    captured_lines: Vec::new(),
                }
            }
        };
        drop(_active_guard);

        let _pg_guard = ProcessGroupGuard::new(child.id());
        let child_pid = child.id();

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let cap = self.output_capture_bytes;
        let read_limit = cap as u64 + 1;

        let read_future = async move {
            let stdout_handle = tokio::spawn(async move {
                let mut buf = Vec::with_capacity(cap.min(64 * 1024));
                let mut capped = stdout_pipe.take(read_limit);
                if let Err(e) = capped.read_to_end(&mut buf).await {
                    tracing::warn!("stdout pipe read error: {e}");
                }
                buf
            });
            let stderr_handle = tokio::spawn(async move {
                let mut buf = Vec::with_capacity(cap.min(64 * 1024));
                let mut capped = stderr_pipe.take(read_limit);
                if let Err(e) = capped.read_to_end(&mut buf).await {
                    tracing::warn!("stderr pipe read error: {e}");
                }
                buf
            });

            let kill_on_cap = |buf: &[u8]| {
                if buf.len() > cap
                    && let Some(pid) = child_pid
                {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            };

            let mut stdout_handle = stdout_handle;
            let mut stderr_handle = stderr_handle;
            let (stdout_buf, stderr_buf) = tokio::select! {
                result = &mut stdout_handle => {
                    let buf = result.unwrap_or_default();
                    kill_on_cap(&buf);
                    let stderr_buf = stderr_handle.await.unwrap_or_default();
                    kill_on_cap(&stderr_buf);
                    (buf, stderr_buf)
                }
                result = &mut stderr_handle => {
                    let buf = result.unwrap_or_default();
                    kill_on_cap(&buf);
                    let stdout_buf = stdout_handle.await.unwrap_or_default();
                    kill_on_cap(&stdout_buf);
                    (stdout_buf, buf)
                }
            };
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout_buf, stderr_buf, status))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Some(pid) = child_pid {
                    unsafe { libc::kill(-(pid as i32), libc::SIGINT); }
                }
                // Give the process a chance to exit cleanly on SIGINT; the
                // guard's drop sends SIGKILL regardless once we return.
                let _ = tokio::time::timeout(self.cancel_grace, tokio::time::sleep(self.cancel_grace)).await;
                ExecutionResult {
                    outcome: ExecutionOutcome::Cancelled,
                    captured_lines: Vec::new(),
                }
            }
            timed = tokio::time::timeout(self.timeout, read_future) => {
                self.finish(timed, child_pid)
            }
        }
    }

    fn finish(
        &self,
        timed: Result<Result<(Vec<u8>, Vec<u8>, std::process::ExitStatus), std::io::Error>, tokio::time::error::Elapsed>,
        child_pid: Option<u32>,
    ) -> ExecutionResult {
        let (stdout, stderr, status) = match timed {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                return ExecutionResult {
                    outcome: ExecutionOutcome::Failure {
                        error: format!("failed to read from {}: {e}", self.executable),
                    },
                    captured_lines: Vec::new(),
                }
            }
            Err(_) => {
                if let Some(pid) = child_pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                return ExecutionResult {
                    outcome: ExecutionOutcome::Failure {
                        error: format!("timed out after {}s", self.timeout.as_secs()),
                    },
                    captured_lines: Vec::new(),
                };
            }
        };

        if stdout.len() > self.output_capture_bytes || stderr.len() > self.output_capture_bytes {
            return ExecutionResult {
                outcome: ExecutionOutcome::Failure {
                    error: format!(
                        "executor output exceeded {} byte limit",
                        self.output_capture_bytes
                    ),
                },
                captured_lines: Vec::new(),
            };
        }

        let stdout_text = String::from_utf8_lossy(&stdout).to_string();
        let stderr_text = String::from_utf8_lossy(&stderr).to_string();
        let combined = format!("{stdout_text}\n{stderr_text}");
        let captured_lines = tail_lines(&combined, self.execution_log_lines);

        let now = Utc::now();
        if let Some(reset_at) = rate_limit::classify(
            &combined,
            &self.rate_limit_signals,
            self.rate_limit_backoff_seconds,
            now,
        ) {
            return ExecutionResult {
                outcome: ExecutionOutcome::RateLimited { reset_at },
                captured_lines,
            };
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            tracing::warn!(executable = %self.executable, code, "executor process failed");
            return ExecutionResult {
                outcome: ExecutionOutcome::Failure { error: stderr_text },
                captured_lines,
            };
        }

        ExecutionResult {
            outcome: ExecutionOutcome::Success,
            captured_lines,
        }
    }
}

fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let all: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if all.len() <= n {
        all
    } else {
        all[all.len() - n..].to_vec()
    }
}
