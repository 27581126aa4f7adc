//! Error types for the machine actuator
//!
//! Errors fall into three groups that drive how the controller reacts:
//! configuration errors never resolve on their own, fatal operation errors
//! move the Machine to `Failed`, and everything else is retried.

use std::time::Duration;

use thiserror::Error;

/// Default delay before re-entering a reconcile that is waiting on something
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(20);

/// Main error type for actuator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// vCenter error
    #[error("vsphere error: {source}")]
    VSphere {
        /// The underlying vCenter client error
        #[from]
        source: vsphere_client::Error,
    },

    /// The Machine asks for something that can never succeed as written
    #[error("{machine}: invalid machine configuration: {message}")]
    InvalidConfiguration {
        /// Machine name, empty when not known yet
        machine: String,
        /// Description of what's invalid
        message: String,
    },

    /// A finished clone or power-on task failed
    #[error("{machine}: failed to create machine: {message}")]
    CreateMachine {
        /// Machine name
        machine: String,
        /// Task error message
        message: String,
    },

    /// A finished delete-path task failed
    #[error("{machine}: failed to delete machine: {message}")]
    DeleteMachine {
        /// Machine name
        machine: String,
        /// Task error message
        message: String,
    },

    /// Update could not reconcile the VM with the Machine
    #[error("{machine}: failed to update machine: {message}")]
    UpdateMachine {
        /// Machine name
        machine: String,
        /// Description of what failed
        message: String,
    },

    /// A Ready node still has volumes attached and is not being drained
    #[error("node {node} is in operational state, won't proceed with pods deletion")]
    NodeOperational {
        /// Node name
        node: String,
    },

    /// Work is in progress; come back later
    #[error("{message}")]
    Requeue {
        /// What is being waited on
        message: String,
        /// Suggested delay
        after: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal invariant broken or unexpected state
    #[error("internal error: {message}")]
    Internal {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn invalid_configuration(machine: &str, msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            machine: machine.to_string(),
            message: msg.into(),
        }
    }

    /// Create a fatal create error
    pub fn create_machine(machine: &str, msg: impl Into<String>) -> Self {
        Self::CreateMachine {
            machine: machine.to_string(),
            message: msg.into(),
        }
    }

    /// Create a fatal delete error
    pub fn delete_machine(machine: &str, msg: impl Into<String>) -> Self {
        Self::DeleteMachine {
            machine: machine.to_string(),
            message: msg.into(),
        }
    }

    /// Create an update error
    pub fn update_machine(machine: &str, msg: impl Into<String>) -> Self {
        Self::UpdateMachine {
            machine: machine.to_string(),
            message: msg.into(),
        }
    }

    /// Create a requeue error with the default delay
    pub fn requeue(msg: impl Into<String>) -> Self {
        Self::Requeue {
            message: msg.into(),
            after: DEFAULT_REQUEUE_AFTER,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// Whether the error is a permanent configuration problem
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Error::InvalidConfiguration { .. })
    }

    /// Whether a vCenter task finished in error and the Machine should fail
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CreateMachine { .. } | Error::DeleteMachine { .. }
        )
    }

    /// Whether the error signals work in progress rather than a failure
    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::Requeue { .. })
    }

    /// Whether retrying the reconcile may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::VSphere { .. } => true,
            Error::InvalidConfiguration { .. } => false,
            Error::CreateMachine { .. } => false,
            // the failed task is cleared, so the next delete starts over
            Error::DeleteMachine { .. } => true,
            Error::UpdateMachine { .. } => true,
            Error::NodeOperational { .. } => true,
            Error::Requeue { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Delay requested by an in-progress error
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Requeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Machine error reason recorded on `status.errorReason`
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration { .. } => "InvalidConfiguration",
            Error::CreateMachine { .. } => "CreateError",
            Error::DeleteMachine { .. } => "DeleteError",
            Error::UpdateMachine { .. } => "UpdateError",
            _ => "ReconcileError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Result alias for actuator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
