//! Supervisor configuration parsing from .procyardrc
//!
//! The file is shell-style `KEY=value` lines (optional `export`, quotes and
//! `#` comments):
//! - PROCYARD_MAX_PROCESSES (table capacity, 128)
//! - PROCYARD_POLL_INTERVAL_MS (worker tick, 10)
//! - PROCYARD_HANDSHAKE_TIMEOUT_MS (3000)
//! - PROCYARD_HANDSHAKE_POLL_MS (10)
//! - PROCYARD_READ_TIMEOUT_MS (5000, 0 disables)
//! - PROCYARD_SOCKET_DIR (/tmp)
//! - PROCYARD_TCP_HOST (127.0.0.1)
//! - PROCYARD_FAULT_POLICY (continue, exit)
//! - PROCYARD_WORKER_<name>="<transport>:<handler>"
//! - PROCYARD_WORKER_<name>_ARGS="key=value key=value"

use crate::transport::TransportKind;
use crate::worker::{FaultPolicy, RunOptions, WorkerArgs};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_PROCESSES: usize = 128;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const WORKER_PREFIX: &str = "PROCYARD_WORKER_";

/// One worker to spawn when the daemon boots
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    /// Declaration name (from PROCYARD_WORKER_<name>)
    pub name: String,
    /// Registry name of the handler
    pub handler: String,
    pub transport: TransportKind,
    pub args: WorkerArgs,
}

/// Complete supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Capacity of the shared process table
    pub max_processes: usize,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub handshake_poll_interval: Duration,
    /// `None` disables the per-connection timeout
    pub read_timeout: Option<Duration>,
    /// Where generated Unix socket paths go
    pub socket_dir: PathBuf,
    /// Default bind host for TCP workers
    pub tcp_host: String,
    pub fault_policy: FaultPolicy,
    pub workers: Vec<WorkerSpec>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let run = RunOptions::default();
        Self {
            max_processes: DEFAULT_MAX_PROCESSES,
            poll_interval: run.poll_interval,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_poll_interval: DEFAULT_HANDSHAKE_POLL_INTERVAL,
            read_timeout: run.read_timeout,
            socket_dir: PathBuf::from("/tmp"),
            tcp_host: crate::transport::DEFAULT_TCP_HOST.to_string(),
            fault_policy: run.fault_policy,
            workers: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Parse ~/.procyardrc, falling back to defaults when it is missing
    pub fn from_procyardrc() -> Self {
        let path = Self::procyardrc_path();
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }

    /// Get the path to .procyardrc
    pub fn procyardrc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".procyardrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse configuration from content string
    ///
    /// Unknown keys are ignored; malformed values keep the default and are
    /// logged.
    pub fn parse(content: &str) -> Self {
        let mut config = SupervisorConfig::default();
        let mut worker_kinds: HashMap<String, String> = HashMap::new();
        let mut worker_args: HashMap<String, String> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "PROCYARD_MAX_PROCESSES" => {
                    if let Some(n) = parse_number(&key, &value) {
                        config.max_processes = n as usize;
                    }
                }
                "PROCYARD_POLL_INTERVAL_MS" => {
                    if let Some(ms) = parse_number(&key, &value) {
                        config.poll_interval = Duration::from_millis(ms);
                    }
                }
                "PROCYARD_HANDSHAKE_TIMEOUT_MS" => {
                    if let Some(ms) = parse_number(&key, &value) {
                        config.handshake_timeout = Duration::from_millis(ms);
                    }
                }
                "PROCYARD_HANDSHAKE_POLL_MS" => {
                    if let Some(ms) = parse_number(&key, &value) {
                        config.handshake_poll_interval = Duration::from_millis(ms);
                    }
                }
                "PROCYARD_READ_TIMEOUT_MS" => {
                    if let Some(ms) = parse_number(&key, &value) {
                        config.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                    }
                }
                "PROCYARD_SOCKET_DIR" => {
                    config.socket_dir = PathBuf::from(value);
                }
                "PROCYARD_TCP_HOST" => {
                    config.tcp_host = value;
                }
                "PROCYARD_FAULT_POLICY" => match value.parse() {
                    Ok(policy) => config.fault_policy = policy,
                    Err(e) => warn!(key = %key, error = %e, "ignoring config value"),
                },
                _ if key.starts_with(WORKER_PREFIX) => {
                    let suffix = &key[WORKER_PREFIX.len()..];

                    if let Some(name) = suffix.strip_suffix("_ARGS") {
                        worker_args.insert(name.to_lowercase(), value);
                    } else {
                        worker_kinds.insert(suffix.to_lowercase(), value);
                    }
                }
                _ => {}
            }
        }

        for (name, kind) in worker_kinds {
            let args = worker_args.get(&name).map(String::as_str).unwrap_or("");
            match parse_worker(&name, &kind, args) {
                Ok(spec) => config.workers.push(spec),
                Err(e) => warn!(worker = %name, error = %e, "skipping worker declaration"),
            }
        }

        // Sort workers by name for deterministic spawn order
        config.workers.sort_by(|a, b| a.name.cmp(&b.name));

        config
    }

    /// Get a worker declaration by name
    pub fn get_worker(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Run loop settings handed to every spawned worker
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            poll_interval: self.poll_interval,
            read_timeout: self.read_timeout,
            fault_policy: self.fault_policy,
        }
    }
}

/// Parse `"<transport>:<handler>"` plus its argument pairs
fn parse_worker(name: &str, kind: &str, args: &str) -> Result<WorkerSpec, String> {
    let (transport, handler) = kind
        .split_once(':')
        .ok_or_else(|| format!("expected <transport>:<handler>, got '{}'", kind))?;

    let transport: TransportKind = transport.trim().parse()?;
    let handler = handler.trim();
    if handler.is_empty() {
        return Err("missing handler name".to_string());
    }

    Ok(WorkerSpec {
        name: name.to_string(),
        handler: handler.to_string(),
        transport,
        args: WorkerArgs::parse_pairs(args)?,
    })
}

fn parse_number(key: &str, value: &str) -> Option<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key = %key, value = %value, "expected a non-negative integer, keeping default");
            None
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = SupervisorConfig::parse("");
        assert_eq!(config.max_processes, 128);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.handshake_poll_interval, Duration::from_millis(10));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.socket_dir, PathBuf::from("/tmp"));
        assert_eq!(config.tcp_host, "127.0.0.1");
        assert_eq!(config.fault_policy, FaultPolicy::Continue);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_parse_overrides() {
        let content = r#"
PROCYARD_MAX_PROCESSES=16
PROCYARD_POLL_INTERVAL_MS=25
PROCYARD_HANDSHAKE_TIMEOUT_MS="500"
PROCYARD_READ_TIMEOUT_MS=0
PROCYARD_SOCKET_DIR='/run/procyard'
PROCYARD_TCP_HOST=0.0.0.0
PROCYARD_FAULT_POLICY=exit
"#;
        let config = SupervisorConfig::parse(content);

        assert_eq!(config.max_processes, 16);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.socket_dir, PathBuf::from("/run/procyard"));
        assert_eq!(config.tcp_host, "0.0.0.0");
        assert_eq!(config.fault_policy, FaultPolicy::Exit);

        let run = config.run_options();
        assert_eq!(run.poll_interval, Duration::from_millis(25));
        assert_eq!(run.read_timeout, None);
        assert_eq!(run.fault_policy, FaultPolicy::Exit);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let content = r#"
PROCYARD_MAX_PROCESSES=lots
PROCYARD_FAULT_POLICY=retry
"#;
        let config = SupervisorConfig::parse(content);
        assert_eq!(config.max_processes, 128);
        assert_eq!(config.fault_policy, FaultPolicy::Continue);
    }

    #[test]
    fn test_parse_workers() {
        let content = r#"
PROCYARD_WORKER_api="tcp:http-proxy"
PROCYARD_WORKER_api_ARGS="port=0 upstream=http://localhost:9000"
PROCYARD_WORKER_audit="unix:logger"
PROCYARD_WORKER_audit_ARGS="log_file=/var/log/audit.log"
PROCYARD_WORKER_bad="carrier-pigeon:echo"
"#;
        let config = SupervisorConfig::parse(content);

        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].name, "api");
        assert_eq!(config.workers[1].name, "audit");

        let api = config.get_worker("api").unwrap();
        assert_eq!(api.transport, TransportKind::Tcp);
        assert_eq!(api.handler, "http-proxy");
        assert_eq!(api.args.get_u64("port"), Some(0));
        assert_eq!(api.args.get_str("upstream"), Some("http://localhost:9000"));

        let audit = config.get_worker("audit").unwrap();
        assert_eq!(audit.transport, TransportKind::Unix);
        assert_eq!(audit.args.get_str("log_file"), Some("/var/log/audit.log"));

        assert!(config.get_worker("bad").is_none());
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# workers
export PROCYARD_WORKER_ping="standard:echo"
export PROCYARD_MAX_PROCESSES=4
"#;
        let config = SupervisorConfig::parse(content);
        assert_eq!(config.max_processes, 4);
        let ping = config.get_worker("ping").unwrap();
        assert_eq!(ping.transport, TransportKind::Standard);
        assert!(ping.args.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procyardrc");
        fs::write(&path, "PROCYARD_SOCKET_DIR=/srv/sockets\n").unwrap();

        let config = SupervisorConfig::from_file(&path).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/srv/sockets"));

        assert!(SupervisorConfig::from_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
