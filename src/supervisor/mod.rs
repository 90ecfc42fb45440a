//! Process supervisor
//!
//! Forks one OS process per worker, tracks it in the shared
//! [`ProcessTable`], and keeps the supervisor's end of each worker's channel.
//!
//! - `spawn`, `spawn_unix`, `spawn_tcp`: fork a worker type
//! - `kill`, `kill_with`, `shutdown_all`: signal workers and forget them
//! - `reap_exited`, `wait_all`: collect exit statuses
//!
//! Nothing here blocks except the TCP port handshake (bounded by
//! `handshake_timeout`) and `wait_all`.

mod exit;
mod registry;

pub use exit::{ExitedWorker, TerminationReason};
pub use registry::{SpawnedWorker, WorkerRegistry};

use crate::channel::WorkerChannel;
use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult, TableError};
use crate::handshake::{self, HandshakeOutcome};
use crate::table::{ProcessRecord, ProcessStatus, ProcessTable};
use crate::transport::{unique_socket_path, TransportKind, DEFAULT_TCP_HOST};
use crate::worker::{run_worker, Worker, WorkerArgs, WorkerContext};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A Unix-socket worker that was spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixWorker {
    pub pid: i32,
    pub socket_path: PathBuf,
}

/// A TCP worker that was spawned, with its resolved port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpWorker {
    pub pid: i32,
    pub port: u16,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    table: ProcessTable,
    /// Supervisor ends of the worker channels, keyed by pid
    channels: HashMap<i32, WorkerChannel>,
}

impl ProcessSupervisor {
    /// Create a supervisor with a table of `config.max_processes` slots
    pub fn new(config: SupervisorConfig) -> SupervisorResult<Self> {
        let table = ProcessTable::new(config.max_processes)?;
        Ok(Self {
            config,
            table,
            channels: HashMap::new(),
        })
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn a worker of any transport
    ///
    /// Unix and TCP workers get the same argument preparation as
    /// [`spawn_unix`](Self::spawn_unix) and [`spawn_tcp`](Self::spawn_tcp).
    pub fn spawn<W: Worker>(&mut self, args: WorkerArgs) -> SupervisorResult<i32> {
        match W::TRANSPORT {
            TransportKind::Standard => self.launch::<W>(args, Map::new(), ProcessStatus::Running),
            TransportKind::Unix => self.spawn_unix::<W>(args).map(|worker| worker.pid),
            TransportKind::Tcp => self.spawn_tcp::<W>(args).map(|worker| worker.pid),
        }
    }

    /// Spawn a Unix-socket worker
    ///
    /// A unique socket path under `socket_dir` is generated when `args` has
    /// no `socket_path`.
    pub fn spawn_unix<W: Worker>(&mut self, mut args: WorkerArgs) -> SupervisorResult<UnixWorker> {
        expect_transport::<W>(TransportKind::Unix)?;

        let socket_path = match args.get_str("socket_path") {
            Some(path) => PathBuf::from(path),
            None => {
                let path = unique_socket_path(&self.config.socket_dir);
                args.insert("socket_path", path.display().to_string());
                path
            }
        };

        let mut metadata = Map::new();
        metadata.insert(
            "socket_path".to_string(),
            Value::from(socket_path.display().to_string()),
        );

        let pid = self.launch::<W>(args, metadata, ProcessStatus::Running)?;
        Ok(UnixWorker { pid, socket_path })
    }

    /// Spawn a TCP worker
    ///
    /// With port 0 (or no port) the call blocks until the worker reports the
    /// port it bound, up to `handshake_timeout`. On timeout the worker keeps
    /// running and stays tracked as `Starting`; a worker that exits first
    /// (for example because it could not bind) is reaped and forgotten.
    pub fn spawn_tcp<W: Worker>(&mut self, mut args: WorkerArgs) -> SupervisorResult<TcpWorker> {
        expect_transport::<W>(TransportKind::Tcp)?;

        if !args.contains("host") {
            args.insert("host", self.config.tcp_host.clone());
        }
        let host = args.get_str("host").unwrap_or(DEFAULT_TCP_HOST).to_string();

        let requested = match args.get("port") {
            None => 0,
            Some(_) => args
                .get_u64("port")
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| SupervisorError::InvalidArgument {
                    key: "port",
                    reason: "expected an integer between 0 and 65535".to_string(),
                })?,
        };
        args.insert("port", requested);

        let mut metadata = Map::new();
        metadata.insert("host".to_string(), Value::from(host));
        metadata.insert("port".to_string(), Value::from(requested));

        if requested != 0 {
            let pid = self.launch::<W>(args, metadata, ProcessStatus::Running)?;
            return Ok(TcpWorker {
                pid,
                port: requested,
            });
        }

        let pid = self.launch::<W>(args, metadata, ProcessStatus::Starting)?;
        let channel = self
            .channels
            .get(&pid)
            .ok_or_else(|| SupervisorError::Channel(io::Error::from(io::ErrorKind::NotConnected)))?;

        let timeout = self.config.handshake_timeout;
        let outcome = handshake::wait_for_port(
            channel,
            Some(Pid::from_raw(pid)),
            timeout,
            self.config.handshake_poll_interval,
        )
        .map_err(SupervisorError::Channel)?;

        let port = match outcome {
            HandshakeOutcome::Port(port) => port,
            HandshakeOutcome::Exited(status) => {
                let reason = TerminationReason::from(status);
                if let Some(record) = self.table.get(pid) {
                    self.retire(record, reason);
                }
                return Err(SupervisorError::WorkerExited { pid, reason });
            }
            HandshakeOutcome::TimedOut => {
                warn!(pid, worker = W::NAME, waited = ?timeout, "port handshake timed out");
                return Err(SupervisorError::HandshakeTimeout {
                    pid,
                    waited: timeout,
                });
            }
        };

        self.table.update(pid, |record| {
            record.metadata.insert("port".to_string(), Value::from(port));
            record.status = ProcessStatus::Running;
        })?;

        info!(pid, worker = W::NAME, port, "tcp worker reported its port");
        Ok(TcpWorker { pid, port })
    }

    /// Send `SIGTERM` to a tracked worker and forget it
    pub fn kill(&mut self, pid: i32) -> bool {
        self.kill_with(pid, Signal::SIGTERM)
    }

    /// Send `signal` to a tracked worker and forget it
    ///
    /// Returns false, doing nothing, when `pid` is not tracked. Does not wait
    /// for the process to exit.
    pub fn kill_with(&mut self, pid: i32, signal: Signal) -> bool {
        let Some(record) = self.table.get(pid) else {
            return false;
        };

        if let Err(e) = signal::kill(Pid::from_raw(pid), signal) {
            warn!(pid, signal = signal.as_str(), error = %e, "failed to signal worker");
        }

        self.release(&record);
        info!(pid, worker = %record.name, signal = signal.as_str(), "worker killed");
        true
    }

    /// Kill every tracked worker, returning how many were signalled
    pub fn shutdown_all(&mut self, signal: Signal) -> usize {
        self.table
            .scan()
            .into_iter()
            .filter(|record| self.kill_with(record.pid, signal))
            .count()
    }

    /// True if a tracked worker called `name` is `Running`
    pub fn is_running(&self, name: &str) -> bool {
        self.table
            .scan()
            .iter()
            .any(|record| record.name == name && record.is_running())
    }

    /// Snapshot of every tracked worker
    pub fn running_processes(&self) -> Vec<ProcessRecord> {
        self.table.scan()
    }

    /// The supervisor's end of a worker's channel
    pub fn channel(&self, pid: i32) -> Option<&WorkerChannel> {
        self.channels.get(&pid)
    }

    /// Reap tracked workers that exited on their own, without blocking
    pub fn reap_exited(&mut self) -> Vec<ExitedWorker> {
        // Statuses are collected before the table is read, so a worker that
        // died holding the table lock is already reaped when we take it
        let mut pids: Vec<i32> = self.channels.keys().copied().collect();
        pids.sort_unstable();

        let mut reaped = Vec::new();
        for pid in pids {
            let reason = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    TerminationReason::from(status)
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => TerminationReason::Unknown,
                Err(e) => {
                    warn!(pid, error = %e, "failed to query worker status");
                    continue;
                }
            };
            reaped.push((pid, reason));
        }

        let mut exited = Vec::new();
        for (pid, reason) in reaped {
            match self.table.get(pid) {
                Some(record) => exited.push(self.retire(record, reason)),
                None => {
                    self.channels.remove(&pid);
                    debug!(pid, %reason, "reaped untracked worker");
                }
            }
        }

        exited
    }

    /// Block until every child process has been reaped
    ///
    /// Returns the number of processes reaped. Tracked workers among them
    /// are removed from the table.
    pub fn wait_all(&mut self) -> usize {
        let mut reaped = 0;

        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        continue;
                    };
                    reaped += 1;

                    let reason = TerminationReason::from(status);
                    match self.table.get(pid.as_raw()) {
                        Some(record) => {
                            self.retire(record, reason);
                        }
                        None => debug!(pid = pid.as_raw(), %reason, "reaped child"),
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }

        reaped
    }

    /// Fork `W`, then record it with `status` and `metadata`
    fn launch<W: Worker>(
        &mut self,
        args: WorkerArgs,
        metadata: Map<String, Value>,
        status: ProcessStatus,
    ) -> SupervisorResult<i32> {
        if W::NAME.is_empty() {
            return Err(SupervisorError::InvalidWorkerType {
                worker: String::new(),
                reason: "worker name is empty".to_string(),
            });
        }

        // Everything that can reject the record is checked before forking
        let mut record = ProcessRecord::new(std::process::id() as i32, W::NAME, W::TRANSPORT);
        record.status = status;
        record.metadata = metadata;
        self.table.validate(&record)?;

        if self.table.len() >= self.table.capacity() {
            return Err(TableError::Full {
                capacity: self.table.capacity(),
            }
            .into());
        }

        let (supervisor_end, worker_end) = WorkerChannel::pair().map_err(SupervisorError::Channel)?;
        let options = self.config.run_options();

        // SAFETY: the child only runs the worker and then exits
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(worker_end);

                record.pid = child.as_raw();
                if let Err(e) = self.table.put(&record) {
                    // Another process filled the table after the check above
                    let _ = signal::kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(e.into());
                }
                self.channels.insert(record.pid, supervisor_end);

                info!(
                    pid = record.pid,
                    worker = W::NAME,
                    transport = %W::TRANSPORT,
                    "worker spawned"
                );
                Ok(record.pid)
            }
            Ok(ForkResult::Child) => {
                drop(supervisor_end);
                // Close the inherited ends of every other worker's channel
                self.channels.clear();
                set_process_name(W::NAME);

                let ctx = WorkerContext {
                    channel: worker_end,
                    table: self.table.clone(),
                    options,
                };
                std::process::exit(run_worker::<W>(args, ctx));
            }
            Err(e) => Err(SupervisorError::Spawn(e)),
        }
    }

    /// Forget a worker that was reaped
    fn retire(&mut self, mut record: ProcessRecord, reason: TerminationReason) -> ExitedWorker {
        self.release(&record);
        record.status = ProcessStatus::Stopped;

        if reason.is_success() {
            info!(pid = record.pid, worker = %record.name, %reason, "worker exited");
        } else {
            warn!(pid = record.pid, worker = %record.name, %reason, "worker exited");
        }

        ExitedWorker { record, reason }
    }

    /// Drop the record, the channel and any socket file of a worker
    fn release(&mut self, record: &ProcessRecord) {
        if record.transport == TransportKind::Unix {
            if let Some(path) = record.socket_path() {
                remove_socket_file(Path::new(path));
            }
        }
        self.table.remove(record.pid);
        self.channels.remove(&record.pid);
    }
}

fn expect_transport<W: Worker>(expected: TransportKind) -> SupervisorResult<()> {
    if W::TRANSPORT == expected {
        return Ok(());
    }
    Err(SupervisorError::InvalidWorkerType {
        worker: W::NAME.to_string(),
        reason: format!(
            "declares the {} transport, expected {}",
            W::TRANSPORT,
            expected
        ),
    })
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(socket_path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket_path = %path.display(), error = %e, "failed to remove socket file"),
    }
}

/// Name the worker's main thread after its type (15 bytes on Linux)
#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    let bytes: Vec<u8> = name.bytes().filter(|&b| b != 0).take(15).collect();
    if let Ok(name) = std::ffi::CString::new(bytes) {
        if let Err(e) = nix::sys::prctl::set_name(&name) {
            debug!(error = %e, "failed to set process name");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(_name: &str) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerResult;

    struct NeverRuns;

    impl Worker for NeverRuns {
        const NAME: &'static str = "never-runs";
        const TRANSPORT: TransportKind = TransportKind::Standard;

        fn new(_args: WorkerArgs, _ctx: WorkerContext) -> WorkerResult<Self> {
            Ok(NeverRuns)
        }

        fn handle(self) -> WorkerResult<()> {
            Ok(())
        }
    }

    fn supervisor(capacity: usize) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            max_processes: capacity,
            ..SupervisorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_zero_capacity_config_rejected() {
        let result = ProcessSupervisor::new(SupervisorConfig {
            max_processes: 0,
            ..SupervisorConfig::default()
        });
        assert!(matches!(
            result,
            Err(SupervisorError::Table(TableError::ZeroCapacity))
        ));
    }

    #[test]
    fn test_transport_mismatch_is_rejected_before_fork() {
        let mut sup = supervisor(4);

        let err = sup.spawn_unix::<NeverRuns>(WorkerArgs::new()).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidWorkerType { .. }));

        let err = sup.spawn_tcp::<NeverRuns>(WorkerArgs::new()).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidWorkerType { .. }));

        assert!(sup.table().is_empty());
    }

    #[test]
    fn test_full_table_refuses_before_fork() {
        let mut sup = supervisor(1);
        sup.table()
            .put(&ProcessRecord::new(999_999, "placeholder", TransportKind::Standard))
            .unwrap();

        let err = sup.spawn::<NeverRuns>(WorkerArgs::new()).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Table(TableError::Full { capacity: 1 })
        ));
        assert!(sup.channels.is_empty());
    }

    #[test]
    fn test_kill_untracked_pid_is_false() {
        let mut sup = supervisor(2);
        assert!(!sup.kill(123_456));
        assert!(!sup.kill_with(123_456, Signal::SIGKILL));
    }

    #[test]
    fn test_is_running_requires_running_status() {
        let sup = supervisor(4);
        let mut record = ProcessRecord::new(999_998, "echo", TransportKind::Standard);
        sup.table().put(&record).unwrap();
        assert!(!sup.is_running("echo"));

        record.status = ProcessStatus::Running;
        sup.table().put(&record).unwrap();
        assert!(sup.is_running("echo"));
        assert!(!sup.is_running("logger"));
        assert_eq!(sup.running_processes().len(), 1);
    }

    #[test]
    fn test_release_removes_unix_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"").unwrap();

        let mut sup = supervisor(2);
        let record = ProcessRecord::new(999_997, "echo", TransportKind::Unix)
            .with_metadata("socket_path", path.display().to_string());
        sup.table().put(&record).unwrap();

        sup.release(&record);
        assert!(!path.exists());
        assert!(sup.table().is_empty());
    }

    #[test]
    fn test_invalid_tcp_port_rejected() {
        struct Tcp;
        impl Worker for Tcp {
            const NAME: &'static str = "tcp";
            const TRANSPORT: TransportKind = TransportKind::Tcp;
            fn new(_args: WorkerArgs, _ctx: WorkerContext) -> WorkerResult<Self> {
                Ok(Tcp)
            }
            fn handle(self) -> WorkerResult<()> {
                Ok(())
            }
        }

        let mut sup = supervisor(2);
        let err = sup
            .spawn_tcp::<Tcp>(WorkerArgs::new().with("port", 70_000))
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::InvalidArgument { key: "port", .. }
        ));
        assert!(sup.table().is_empty());
    }
}
