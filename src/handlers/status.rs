//! Reports the supervisor's process table from inside a worker

use crate::table::{ProcessTable, ProcessStatus};
use crate::worker::{Handler, WorkerArgs};
use anyhow::Context;

/// Replies with the table as a JSON array
///
/// A request of `running` limits the reply to running workers; anything else
/// returns every record.
pub struct StatusHandler {
    table: ProcessTable,
}

impl Handler for StatusHandler {
    const NAME: &'static str = "status";

    fn init(_args: &WorkerArgs, table: &ProcessTable) -> anyhow::Result<Self> {
        Ok(Self {
            table: table.clone(),
        })
    }

    fn process_message(&mut self, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut records = self.table.scan();
        if String::from_utf8_lossy(request).trim() == "running" {
            records.retain(|record| record.status == ProcessStatus::Running);
        }
        records.sort_by_key(|record| record.pid);

        let body = serde_json::to_vec(&records).context("Failed to encode process table")?;
        Ok(Some(body))
    }
}
