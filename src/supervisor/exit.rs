//! How a reaped worker ended

use crate::table::ProcessRecord;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Reason a worker process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code
    Exited(i32),
    /// Killed by a signal it did not handle
    Signaled(Signal),
    /// The process was already reaped elsewhere
    Unknown,
}

impl TerminationReason {
    /// Exit code 0, i.e. a graceful shutdown
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            _ => Self::Unknown,
        }
    }
}

/// A worker removed from the table after its process ended
#[derive(Debug, Clone)]
pub struct ExitedWorker {
    /// Final record, marked `Stopped`
    pub record: ProcessRecord,
    pub reason: TerminationReason,
}
