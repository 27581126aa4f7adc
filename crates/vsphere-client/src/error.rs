//! Error types for vCenter access

use thiserror::Error;

/// Message vCenter attaches to faults for objects it no longer knows about
const OBJECT_GONE_MESSAGE: &str = "has already been deleted or has not been completely created";

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// vCenter client error types
#[derive(Debug, Error)]
pub enum Error {
    /// Inventory lookup matched nothing
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind (vm, folder, datastore, tag, ...)
        kind: String,
        /// Name, path or id that was looked up
        name: String,
    },

    /// Inventory lookup matched more than one object
    #[error("path '{name}' resolves to multiple {kind}s")]
    MultipleFound {
        /// Object kind
        kind: String,
        /// Name or path that was looked up
        name: String,
    },

    /// Server reported a managed object reference it no longer tracks
    #[error("the object '{reference}' {message}")]
    ManagedObjectNotFound {
        /// Reference as `Type:value`
        reference: String,
        /// Server message
        message: String,
    },

    /// Any other fault returned by the server
    #[error("{fault}: {message}")]
    Fault {
        /// Fault type name, e.g. `InvalidState`
        fault: String,
        /// Localized message
        message: String,
    },

    /// Session missing or expired
    #[error("not authenticated: {message}")]
    NotAuthenticated {
        /// Error message
        message: String,
    },

    /// Transport or unexpected HTTP status
    #[error("http error{}: {message}", status_suffix(.status))]
    Http {
        /// HTTP status, when a response was received
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// Response body could not be decoded
    #[error("decode error: {message}")]
    Decode {
        /// Error message
        message: String,
    },

    /// Operation did not complete within its deadline
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Caller passed something the server can never accept
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a multiple-found error
    pub fn multiple_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MultipleFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a managed-object-not-found error
    pub fn managed_object_not_found(reference: impl Into<String>) -> Self {
        Self::ManagedObjectNotFound {
            reference: reference.into(),
            message: OBJECT_GONE_MESSAGE.to_string(),
        }
    }

    /// Create a fault error
    pub fn fault(fault: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault {
            fault: fault.into(),
            message: message.into(),
        }
    }

    /// Create a not-authenticated error
    pub fn not_authenticated(msg: impl Into<String>) -> Self {
        Self::NotAuthenticated {
            message: msg.into(),
        }
    }

    /// Create an HTTP error
    pub fn http(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Whether a lookup found nothing (inventory miss or HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::Http { status: Some(404), .. }
        )
    }

    /// Whether a lookup was ambiguous
    pub fn is_multiple_found(&self) -> bool {
        matches!(self, Error::MultipleFound { .. })
    }

    /// Whether the server no longer knows the referenced object
    ///
    /// Matches the structured fault first and falls back to the server's
    /// message for faults that arrive untyped.
    pub fn is_managed_object_not_found(&self) -> bool {
        match self {
            Error::ManagedObjectNotFound { .. } => true,
            Error::Fault { fault, message } => {
                fault == "ManagedObjectNotFound" || message.contains(OBJECT_GONE_MESSAGE)
            }
            _ => false,
        }
    }

    /// Whether the session needs to be rebuilt
    pub fn is_not_authenticated(&self) -> bool {
        matches!(
            self,
            Error::NotAuthenticated { .. } | Error::Http { status: Some(401), .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Error::timeout(
                e.url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
            );
        }
        if e.is_decode() {
            return Error::decode(e.to_string());
        }
        Error::http(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::decode(e.to_string())
    }
}

/// Result alias for vCenter operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
