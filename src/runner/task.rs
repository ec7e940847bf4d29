//! Task assignment and terminal outcome types.

use std::fmt;
use std::time::Duration;

use crate::protocol::Message;

/// Error code carried by every failed build result.
pub const ERR_CODE_FAILURE: i64 = 1;

/// One unit of work assigned by the server.
///
/// Built from an inbound `RequestBuild` message and never modified after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    runner_uuid: String,
    build_uuid: String,
    event_name: String,
    event_payload: String,
    job_id: Option<String>,
}

impl TaskAssignment {
    pub fn new(
        runner_uuid: impl Into<String>,
        build_uuid: impl Into<String>,
        event_name: impl Into<String>,
        event_payload: impl Into<String>,
        job_id: Option<String>,
    ) -> Self {
        Self {
            runner_uuid: runner_uuid.into(),
            build_uuid: build_uuid.into(),
            event_name: event_name.into(),
            event_payload: event_payload.into(),
            job_id: job_id.filter(|j| !j.is_empty()),
        }
    }

    /// Extract the assignment carried by a `RequestBuild` message.
    pub fn from_message(msg: &Message) -> Self {
        Self::new(
            msg.runner_uuid.clone(),
            msg.build_uuid.clone(),
            msg.event_name.clone(),
            msg.event_payload.clone(),
            Some(msg.job_id.clone()),
        )
    }

    pub fn runner_uuid(&self) -> &str {
        &self.runner_uuid
    }

    pub fn build_uuid(&self) -> &str {
        &self.build_uuid
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_payload(&self) -> &str {
        &self.event_payload
    }

    /// The single job to run, or `None` for the whole workflow.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }
}

/// Terminal result of one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// The workload reported an error.
    Failed(String),
    /// The hard deadline expired and the task was cancelled.
    TimedOut(Duration),
    /// The runner is shutting down and abandoned the task.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// `errCode` for the build result: 0 on success.
    pub fn err_code(&self) -> i64 {
        if self.is_success() {
            0
        } else {
            ERR_CODE_FAILURE
        }
    }

    /// `errContent` for the build result: empty on success.
    pub fn err_content(&self) -> String {
        match self {
            Self::Succeeded => String::new(),
            Self::Failed(reason) => reason.clone(),
            Self::TimedOut(deadline) => {
                format!("task timed out after {}s", deadline.as_secs())
            }
            Self::Cancelled => "task cancelled: runner shutting down".to_string(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut(deadline) => write!(f, "timed out after {deadline:?}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
