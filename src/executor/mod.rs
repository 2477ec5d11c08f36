//! [MODULE C2] Executor Adapter — spawns the external CLI, streams its
//! output, classifies rate-limit conditions, and returns a classified
//! result. No knowledge of queue semantics; the processor (C4) decides
//! retries, persistence, and broadcasting.

pub mod process;
pub mod rate_limit;

pub use process::{ExecutionResult, ExecutorAdapter, PromptSubmission, RESUMPTION_TOKEN};

use std::pin::Pin;
use std::process::Stdio;

use futures_util::stream::{self, Stream};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::queue::Prompt;

impl ExecutorAdapter {
    /// A lazy, finite sequence of stdout lines for interactive/live-tail use
    /// (spec.md §4.2). Not used by the main queue loop, which needs the
    /// full captured result from `execute_prompt`.
    pub async fn stream_prompt(&self, prompt: &Prompt) -> Pin<Box<dyn Stream<Item = String> + Send>> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.extra_args)
            .arg(&prompt.content)
            .current_dir(&prompt.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);

        // See `process::execute_prompt` — held across env setup and spawn
        // so a concurrent `use_profile` can't switch the active directory
        // mid-spawn (spec.md §5, Testable Property #7).
        let active_guard = self.accounts.read_active().await;
        cmd.env("CLAUDE_CONFIG_DIR", self.accounts.active_dir());
        if let Ok((unset, set)) = self.accounts.active_env_bindings().await {
            for var in unset {
                cmd.env_remove(var);
            }
            for (k, v) in set {
                cmd.env(k, v);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(executable = %self.executable, error = %e, "failed to spawn for streaming");
                return Box::pin(stream::empty());
            }
        };
        drop(active_guard);

        let guard = process::ProcessGroupGuard::new(child.id());
        let stdout = child.stdout.take().expect("stdout was piped");
        let reader = BufReader::new(stdout).lines();

        Box::pin(stream::unfold(
            (reader, child, guard),
            |(mut reader, child, guard)| async move {
                match reader.next_line().await {
                    Ok(Some(line)) => Some((line, (reader, child, guard))),
                    _ => None,
                }
            },
        ))
    }
}
