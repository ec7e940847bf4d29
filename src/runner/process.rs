//! Event handler that runs the workflow engine as a child process.
//!
//! The event payload is written to a temporary file and the engine is
//! invoked as `<program> <args..> <event> --eventpath <file> [--job <id>]`.
//! Output is streamed line by line into the task's tracing span; the tail
//! of stderr becomes the failure message when the process exits non-zero.

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::runner::handler::EventHandler;
use crate::runner::task::TaskAssignment;

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Runs one event kind through an external engine binary.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    event: String,
    program: String,
    args: Vec<String>,
    cache_url: Option<String>,
    workdir: Option<PathBuf>,
}

impl ProcessHandler {
    pub fn new(event: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            program: program.into(),
            args: Vec::new(),
            cache_url: None,
            workdir: None,
        }
    }

    /// Build a handler for `event` from the executor settings.
    pub fn from_config(event: impl Into<String>, config: &ExecutorConfig) -> Self {
        Self {
            event: event.into(),
            program: config.program.clone(),
            args: config.args.clone(),
            cache_url: config.cache_url.clone(),
            workdir: config.workdir.clone(),
        }
    }

    /// Arguments placed before the event name.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, task: &TaskAssignment, event_path: &std::path::Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(task.event_name())
            .arg("--eventpath")
            .arg(event_path);
        if let Some(job) = task.job_id() {
            command.arg("--job").arg(job);
        }
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        command
            .env("RUNNER_UUID", task.runner_uuid())
            .env("RUNNER_BUILD_UUID", task.build_uuid())
            .env("GITHUB_EVENT_NAME", task.event_name());
        if let Some(url) = &self.cache_url {
            command.env("ACTIONS_CACHE_URL", url);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl EventHandler for ProcessHandler {
    fn event(&self) -> &str {
        &self.event
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        task: &TaskAssignment,
    ) -> Result<(), ExecutionError> {
        let mut event_file = tempfile::Builder::new()
            .prefix("event-")
            .suffix(".json")
            .tempfile()?;
        event_file.write_all(task.event_payload().as_bytes())?;
        event_file.flush()?;

        let mut child = self
            .command(task, event_file.path())
            .spawn()
            .map_err(|e| ExecutionError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(program = %self.program, pid = ?child.id(), "Spawned engine");

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump_lines(out, Stream::Stdout).in_current_span())
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(pump_lines(err, Stream::Stderr).in_current_span())
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                tracing::info!("Cancellation requested, killing engine");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill engine process");
                }
                return Err(ExecutionError::Cancelled);
            }
        };

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if status.success() {
            return Ok(());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let mut message = format!("{} exited with status {code}", self.program);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&Vec::from(tail).join("\n"));
        }
        Err(ExecutionError::Failed(message))
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward a child stream to tracing, returning its last lines.
async fn pump_lines<R>(reader: R, stream: Stream) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    Stream::Stdout => tracing::info!(target: "act_runner::engine_output", "{line}"),
                    Stream::Stderr => tracing::warn!(target: "act_runner::engine_output", "{line}"),
                }
                if matches!(stream, Stream::Stderr) {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Engine output stream ended with error");
                break;
            }
        }
    }
    tail
}
