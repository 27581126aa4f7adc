//! Tracking of vCenter tasks across reconciles
//!
//! The actuator never waits for lifecycle tasks. It records the task id in
//! `providerStatus.taskRef` and, on the next reconcile, classifies the task
//! with [`check_task`].

use tracing::debug;

use vsphere_client::{MoRef, TaskState, VimClient};

use crate::error::{Error, Result};

/// Description id prefix of clone tasks; some servers append `VM`
pub const CLONE_TASK_PREFIX: &str = "VirtualMachine.clone";

/// What became of a previously launched task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Queued or running
    Unfinished {
        /// Operation identifier
        description_id: String,
    },
    /// Completed without error
    Succeeded {
        /// Operation identifier
        description_id: String,
    },
    /// Completed with an error
    Failed {
        /// Operation identifier
        description_id: String,
        /// Localized task error
        message: String,
    },
    /// The server no longer knows the task, e.g. after garbage collection
    ServerForgot,
}

impl TaskOutcome {
    /// Whether the task was a clone
    pub fn is_clone(&self) -> bool {
        match self {
            TaskOutcome::Unfinished { description_id }
            | TaskOutcome::Succeeded { description_id }
            | TaskOutcome::Failed { description_id, .. } => {
                description_id.contains(CLONE_TASK_PREFIX)
            }
            TaskOutcome::ServerForgot => false,
        }
    }
}

/// Classify the task recorded as `task_ref`
///
/// States this client does not know are surfaced as errors rather than
/// treated as finished.
pub async fn check_task(vim: &dyn VimClient, task_ref: &str) -> Result<TaskOutcome> {
    let task = MoRef::task(task_ref);
    let info = match vim.task_info(&task).await {
        Ok(info) => info,
        Err(e) if e.is_managed_object_not_found() => {
            debug!(task = task_ref, "task no longer known to vCenter");
            return Ok(TaskOutcome::ServerForgot);
        }
        Err(e) => return Err(e.into()),
    };

    let description_id = info.description_id;
    match info.state {
        TaskState::Queued | TaskState::Running => Ok(TaskOutcome::Unfinished { description_id }),
        TaskState::Success => Ok(TaskOutcome::Succeeded { description_id }),
        TaskState::Error => Ok(TaskOutcome::Failed {
            description_id,
            message: info
                .error
                .map(|e| e.localized_message)
                .unwrap_or_else(|| "task failed without error details".to_string()),
        }),
        TaskState::Unknown => Err(Error::internal(format!(
            "unknown state for {description_id} task {task_ref}"
        ))),
    }
}
