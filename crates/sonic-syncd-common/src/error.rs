//! Error types for the sync engine
//!
//! Every error carries an [`ErrorClass`] so the event loop can decide between
//! logging and continuing, or terminating the daemon.

use crate::event::EventKind;
use thiserror::Error;

/// How the event loop must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log, skip the operation and keep running.
    Transient,
    /// Reconciliation cannot proceed safely; exit non-zero and let the
    /// supervisor restart us.
    Fatal,
    /// Misuse or misconfiguration detected at startup.
    Programming,
}

/// Errors that can occur in the sync daemons
#[derive(Debug, Error)]
pub enum SyncError {
    /// Redis connection or command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// The socket receive buffer overflowed and notifications were lost
    #[error("Netlink receive buffer overrun, notifications were lost")]
    Overrun,

    /// A kernel message could not be decoded
    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    /// Store write failed (after retries, or from a fake store)
    #[error("Store write to {table}:{key} failed: {reason}")]
    Store {
        table: String,
        key: String,
        reason: String,
    },

    /// The previously published records could not be read back
    #[error("Failed to read warm restart snapshot of {table}: {reason}")]
    SnapshotRead { table: String, reason: String },

    /// The kernel never signalled that its own state was restored
    #[error("Kernel state restore not finished after {0} seconds")]
    RestoreTimeout(u64),

    /// A handler for this event kind is already registered
    #[error("Handler already registered for {0:?}")]
    DuplicateHandler(EventKind),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Classify this error for the event loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::SnapshotRead { .. } | SyncError::RestoreTimeout(_) => ErrorClass::Fatal,
            SyncError::DuplicateHandler(_) | SyncError::Config(_) => ErrorClass::Programming,
            SyncError::Redis(_)
            | SyncError::Netlink(_)
            | SyncError::Overrun
            | SyncError::Decode { .. }
            | SyncError::Store { .. }
            | SyncError::Io(_) => ErrorClass::Transient,
        }
    }

    /// True when the daemon must stop.
    pub fn is_fatal(&self) -> bool {
        self.class() != ErrorClass::Transient
    }

    pub(crate) fn decode(what: &'static str, reason: impl Into<String>) -> Self {
        SyncError::Decode {
            what,
            reason: reason.into(),
        }
    }
}

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;
