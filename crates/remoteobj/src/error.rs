//! Error taxonomy for remote handles.
//!
//! - [`Fault`]: raised while applying an operation to a concrete object. Always
//!   recoverable, reported to the caller that triggered it.
//! - [`RemoteError`]: everything a caller can see from `resolve()`, including
//!   faults re-raised from the owning side and transport failures.

use thiserror::Error;

use crate::bridge::channel::ChannelError;
use crate::bridge::protocol::ErrorEnvelope;
use crate::chain::{ChainError, ResolveFailure};

/// A resolution error: a kind (e.g. `AttributeError`) and a message.
///
/// Kinds are plain strings so that owner-defined kinds survive the trip to the
/// caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    kind: String,
    message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn key(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new("IndexError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new("NameError", message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new("PermissionError", message)
    }

    /// The standard "no such attribute" fault for an object of `type_name`.
    pub fn no_attribute(type_name: &str, name: &str) -> Self {
        Self::attribute(format!("'{type_name}' object has no attribute '{name}'"))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A fault re-raised on the caller side from an [`ErrorEnvelope`].
///
/// The remote trace is supplementary text; it is never merged into the
/// caller's own stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteFault {
    kind: String,
    message: String,
    trace: String,
}

impl RemoteFault {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Formatted trace captured on the owning side.
    pub fn remote_trace(&self) -> &str {
        &self.trace
    }
}

impl From<ErrorEnvelope> for RemoteFault {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self {
            kind: envelope.kind,
            message: envelope.message,
            trace: envelope.trace,
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Fault raised while resolving in the owner's own service loop.
    #[error("{0}")]
    Resolution(ResolveFailure),

    /// Fault raised on the owning side and carried back in an envelope.
    #[error("{0}")]
    Remote(RemoteFault),

    /// The handle has no active service loop and no default was configured.
    #[error("remote handle is not running")]
    NotRunning,

    #[error("transport failure: {0}")]
    Transport(#[from] ChannelError),

    #[error("service loop panicked: {0}")]
    Panicked(String),

    /// Lifecycle operations are only available on the owning side.
    #[error("operation requires the owning side of the handle")]
    NotOwner,
}

impl RemoteError {
    /// Kind of the underlying fault, for both native and re-raised faults.
    pub fn fault_kind(&self) -> Option<&str> {
        match self {
            Self::Resolution(failure) => Some(failure.fault().kind()),
            Self::Remote(fault) => Some(fault.kind()),
            _ => None,
        }
    }

    /// Message of the underlying fault, for both native and re-raised faults.
    pub fn fault_message(&self) -> Option<&str> {
        match self {
            Self::Resolution(failure) => Some(failure.fault().message()),
            Self::Remote(fault) => Some(fault.message()),
            _ => None,
        }
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning)
    }
}
