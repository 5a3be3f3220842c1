use thiserror::Error;

use crate::lock::LockInfo;
use crate::message::MessageId;

/// Errors that can occur in the index layer.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Another lock handle (usually another process) owns the index directory.
    #[error("index is locked by {0}")]
    LockHeld(Box<LockInfo>),

    #[error("query parse error: {message} (near {fragment:?})")]
    Parse { message: String, fragment: String },

    #[error("{capability} is not implemented by the {backend} index")]
    NotImplemented {
        backend: &'static str,
        capability: &'static str,
    },

    #[error("unknown index type {requested:?}: {reason}")]
    BackendResolution { requested: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    pub fn parse(message: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            fragment: fragment.into(),
        }
    }

    pub fn not_implemented(backend: &'static str, capability: &'static str) -> Self {
        Self::NotImplemented {
            backend,
            capability,
        }
    }

    pub fn message_not_found(id: &MessageId) -> Self {
        Self::NotFound(format!("message {}", id))
    }
}

/// Failures raised by background tasks.
///
/// These never abort the task that hit them; they are delivered on the index
/// handle's background error channel.
#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("lock heartbeat failed: {0}")]
    Heartbeat(IndexError),

    #[error("index sync of {id} failed: {error}")]
    SyncUpdate { id: MessageId, error: IndexError },
}
