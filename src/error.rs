//! Error types for the supervisor, the worker run loop and the process table
//!
//! Absence is not an error: `kill` and lookups on an untracked pid return
//! `false`/`None` instead of one of these variants.

use crate::supervisor::TerminationReason;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`ProcessTable`](crate::table::ProcessTable) operations
#[derive(Debug, Error)]
pub enum TableError {
    /// The table already holds `capacity` records
    #[error("process table is full ({capacity} entries)")]
    Full { capacity: usize },

    /// A table must be able to hold at least one record
    #[error("process table capacity must be at least 1")]
    ZeroCapacity,

    /// Records are keyed by positive pids; 0 marks a free slot
    #[error("invalid pid {0}")]
    InvalidPid(i32),

    /// A string or metadata blob does not fit its fixed-size column
    #[error("{field} is {len} bytes, column holds at most {max}")]
    FieldTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Metadata could not be encoded as JSON
    #[error("failed to encode record metadata: {0}")]
    Metadata(#[source] serde_json::Error),

    /// The shared memory mapping could not be created
    #[error("failed to map shared process table: {0}")]
    Map(#[source] io::Error),
}

/// Errors raised by [`ProcessSupervisor`](crate::supervisor::ProcessSupervisor)
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker type does not satisfy the contract requested by the caller
    #[error("invalid worker type '{worker}': {reason}")]
    InvalidWorkerType { worker: String, reason: String },

    /// A spawn argument has a value the transport cannot use
    #[error("invalid argument '{key}': {reason}")]
    InvalidArgument { key: &'static str, reason: String },

    /// The OS refused to create the worker process
    #[error("failed to fork worker process: {0}")]
    Spawn(#[source] nix::Error),

    /// The duplex channel for the worker could not be created
    #[error("failed to create worker channel: {0}")]
    Channel(#[source] io::Error),

    /// A TCP worker did not report its ephemeral port in time
    ///
    /// The worker keeps running and stays tracked; the caller decides
    /// whether to kill it.
    #[error("worker {pid} did not report its port within {waited:?}")]
    HandshakeTimeout { pid: i32, waited: Duration },

    /// A TCP worker exited before reporting its ephemeral port
    ///
    /// The worker has been reaped and is no longer tracked.
    #[error("worker {pid} exited before reporting its port ({reason})")]
    WorkerExited {
        pid: i32,
        reason: TerminationReason,
    },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Errors raised inside a worker process
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Creating, binding or listening on the worker's socket failed
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The ephemeral port could not be reported to the supervisor
    #[error("failed to send port handshake: {0}")]
    Handshake(#[source] io::Error),

    /// Shutdown signal handlers could not be installed
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    /// The handler could not be constructed from the worker arguments
    #[error("handler initialization failed: {0:#}")]
    Init(anyhow::Error),

    /// The handler failed and the fault policy says to stop
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_full_message() {
        let err = TableError::Full { capacity: 4 };
        assert_eq!(err.to_string(), "process table is full (4 entries)");
    }

    #[test]
    fn test_table_error_converts_into_supervisor_error() {
        let err: SupervisorError = TableError::ZeroCapacity.into();
        assert!(matches!(err, SupervisorError::Table(TableError::ZeroCapacity)));
        assert_eq!(err.to_string(), "process table capacity must be at least 1");
    }

    #[test]
    fn test_bind_error_names_endpoint() {
        let err = WorkerError::Bind {
            endpoint: "/tmp/missing/dir.sock".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such directory"),
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/missing/dir.sock"));
        assert!(message.contains("no such directory"));
    }

    #[test]
    fn test_handler_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("writing log line");
        let err = WorkerError::Handler(inner);
        assert_eq!(err.to_string(), "handler failed: writing log line: disk full");
    }
}
