//! Task supervision: capacity admission, deadline, shutdown cancellation.
//!
//! Each admitted task runs on its own tokio task. The supervisor never
//! touches the session; terminal outcomes are handed back to the daemon
//! over a channel so that the daemon stays the only writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::TaskPolicy;
use crate::error::ExecutionError;
use crate::runner::capacity::{CapacityGate, CapacitySlot};
use crate::runner::handler::EventHandler;
use crate::runner::task::{Outcome, TaskAssignment};

/// A finished task, ready to be reported.
#[derive(Debug, Clone)]
pub struct Completion {
    pub assignment: TaskAssignment,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Launches and supervises task executions.
pub struct Supervisor {
    gate: Arc<CapacityGate>,
    deadline: Duration,
    shutdown: CancellationToken,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its completion channel.
    pub fn new(
        gate: Arc<CapacityGate>,
        policy: &TaskPolicy,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            gate,
            deadline: policy.deadline,
            shutdown,
            completions: tx,
        };
        (supervisor, rx)
    }

    pub fn gate(&self) -> &Arc<CapacityGate> {
        &self.gate
    }

    /// Admit a task and run it in the background.
    ///
    /// Fails with `CapacityExhausted` when no slot is free; the task is not
    /// started in that case. The outcome arrives later as a `Completion`.
    pub fn launch(
        &self,
        assignment: TaskAssignment,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ExecutionError> {
        let slot = self.admit()?;
        let span = tracing::info_span!(
            "task",
            build_uuid = %assignment.build_uuid(),
            event = %assignment.event_name(),
        );
        let outstanding = self.gate.outstanding();
        let deadline = self.deadline;
        let shutdown = self.shutdown.clone();
        let completions = self.completions.clone();

        tokio::spawn(
            async move {
                let started = Instant::now();
                tracing::info!(outstanding, "Task started");
                let outcome = supervise(handler, &assignment, deadline, &shutdown).await;
                drop(slot);

                let elapsed = started.elapsed();
                tracing::info!(outcome = %outcome, elapsed = ?elapsed, "Task finished");
                let completion = Completion {
                    assignment,
                    outcome,
                    elapsed,
                };
                if completions.send(completion).is_err() {
                    tracing::warn!("Completion channel closed, dropping task result");
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Admit a task and wait for its outcome on the current task.
    pub async fn execute(
        &self,
        assignment: TaskAssignment,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Outcome, ExecutionError> {
        let slot = self.admit()?;
        let outcome = supervise(handler, &assignment, self.deadline, &self.shutdown).await;
        drop(slot);
        Ok(outcome)
    }

    fn admit(&self) -> Result<CapacitySlot, ExecutionError> {
        self.gate
            .try_slot()
            .ok_or(ExecutionError::CapacityExhausted {
                capacity: self.gate.capacity(),
            })
    }
}

/// Run one handler to a terminal outcome.
///
/// Shutdown wins over completion and completion wins over the deadline
/// when several are ready at once. On shutdown or deadline the handler is
/// signalled through its child token and abandoned without waiting.
async fn supervise(
    handler: Arc<dyn EventHandler>,
    assignment: &TaskAssignment,
    deadline: Duration,
    shutdown: &CancellationToken,
) -> Outcome {
    let cancel = shutdown.child_token();
    let task = assignment.clone();
    let token = cancel.clone();
    let mut work = tokio::spawn(async move { handler.run(token, &task).await }.in_current_span());

    tokio::select! {
        biased;

        _ = shutdown.cancelled() => {
            cancel.cancel();
            Outcome::Cancelled
        }
        joined = &mut work => match joined {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(e) if e.is_panic() => Outcome::Failed("task panicked during execution".to_string()),
            Err(e) => Outcome::Failed(format!("task aborted: {e}")),
        },
        _ = tokio::time::sleep(deadline) => {
            tracing::warn!(deadline_secs = deadline.as_secs(), "Task exceeded deadline, cancelling");
            cancel.cancel();
            Outcome::TimedOut(deadline)
        }
    }
}
