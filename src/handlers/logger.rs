//! Appends each request to a log file, one timestamped line per request

use crate::table::ProcessTable;
use crate::worker::{Handler, WorkerArgs};
use anyhow::Context;
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub const DEFAULT_LOG_FILE: &str = "/tmp/procyard.log";

/// Characters of the request echoed back in the acknowledgement
const PREVIEW_CHARS: usize = 30;

pub struct LoggerHandler {
    log_file: PathBuf,
}

impl LoggerHandler {
    pub fn log_file(&self) -> &PathBuf {
        &self.log_file
    }
}

impl Handler for LoggerHandler {
    const NAME: &'static str = "logger";

    fn init(args: &WorkerArgs, _table: &ProcessTable) -> anyhow::Result<Self> {
        let log_file = args.get_str("log_file").unwrap_or(DEFAULT_LOG_FILE);
        Ok(Self {
            log_file: PathBuf::from(log_file),
        })
    }

    fn process_message(&mut self, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let data = String::from_utf8_lossy(request);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open {}", self.log_file.display()))?;
        writeln!(file, "{} {}", Local::now().format("[%Y-%m-%d %H:%M:%S]"), data)
            .with_context(|| format!("Failed to write {}", self.log_file.display()))?;

        let mut preview: String = data.chars().take(PREVIEW_CHARS).collect();
        if data.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }

        Ok(Some(format!("Logged: {}", preview).into_bytes()))
    }
}
