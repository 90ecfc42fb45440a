//! Process records stored in the shared table

use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a tracked worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Forked, not yet confirmed ready (TCP workers waiting on the handshake)
    Starting,
    /// Forked and ready
    Running,
    /// Observed to have exited
    Stopped,
}

impl ProcessStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            ProcessStatus::Starting => 1,
            ProcessStatus::Running => 2,
            ProcessStatus::Stopped => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProcessStatus::Starting),
            2 => Some(ProcessStatus::Running),
            3 => Some(ProcessStatus::Stopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
        }
    }
}

/// One entry per live worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// OS process id, unique key of the table
    pub pid: i32,
    /// Worker type running in the process
    pub name: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub transport: TransportKind,
    /// Transport facts such as `socket_path` or `port`
    pub metadata: Map<String, Value>,
}

impl ProcessRecord {
    /// Create a `Starting` record stamped with the current time
    pub fn new(pid: i32, name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            pid,
            name: name.into(),
            status: ProcessStatus::Starting,
            started_at: Utc::now(),
            transport,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn socket_path(&self) -> Option<&str> {
        self.metadata.get("socket_path").and_then(Value::as_str)
    }

    pub fn port(&self) -> Option<u16> {
        self.metadata
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }
}
