//! Spawn workers by handler name
//!
//! The daemon reads worker declarations as strings, so it needs a way from
//! `("logger", unix)` to `Service<LoggerHandler, UnixTransport>`. Each
//! registered handler stores one monomorphised spawn function per transport.

use super::ProcessSupervisor;
use crate::error::{SupervisorError, SupervisorResult};
use crate::handlers::{EchoHandler, HttpProxyHandler, LoggerHandler, StatusHandler};
use crate::transport::{StandardTransport, TcpTransport, TransportKind, UnixTransport};
use crate::worker::{Handler, Service, WorkerArgs};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What the registry spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedWorker {
    pub pid: i32,
    pub transport: TransportKind,
    /// Set for Unix workers
    pub socket_path: Option<PathBuf>,
    /// Set for TCP workers
    pub port: Option<u16>,
}

type SpawnFn = fn(&mut ProcessSupervisor, WorkerArgs) -> SupervisorResult<SpawnedWorker>;

#[derive(Clone, Copy)]
struct Entry {
    standard: SpawnFn,
    unix: SpawnFn,
    tcp: SpawnFn,
}

#[derive(Clone, Default)]
pub struct WorkerRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl WorkerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing `echo`, `logger`, `http-proxy` and `status`
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register::<EchoHandler>();
        registry.register::<LoggerHandler>();
        registry.register::<HttpProxyHandler>();
        registry.register::<StatusHandler>();
        registry
    }

    /// Make `H` spawnable over every transport, replacing a handler of the
    /// same name
    pub fn register<H: Handler + 'static>(&mut self) {
        self.entries.insert(
            H::NAME,
            Entry {
                standard: spawn_standard::<H>,
                unix: spawn_unix::<H>,
                tcp: spawn_tcp::<H>,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Spawn the handler called `name` over `transport`
    pub fn spawn(
        &self,
        supervisor: &mut ProcessSupervisor,
        name: &str,
        transport: TransportKind,
        args: WorkerArgs,
    ) -> SupervisorResult<SpawnedWorker> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| SupervisorError::InvalidWorkerType {
                worker: name.to_string(),
                reason: format!("no handler registered (known: {})", self.names().join(", ")),
            })?;

        let spawn = match transport {
            TransportKind::Standard => entry.standard,
            TransportKind::Unix => entry.unix,
            TransportKind::Tcp => entry.tcp,
        };
        spawn(supervisor, args)
    }
}

fn spawn_standard<H: Handler + 'static>(
    supervisor: &mut ProcessSupervisor,
    args: WorkerArgs,
) -> SupervisorResult<SpawnedWorker> {
    let pid = supervisor.spawn::<Service<H, StandardTransport>>(args)?;
    Ok(SpawnedWorker {
        pid,
        transport: TransportKind::Standard,
        socket_path: None,
        port: None,
    })
}

fn spawn_unix<H: Handler + 'static>(
    supervisor: &mut ProcessSupervisor,
    args: WorkerArgs,
) -> SupervisorResult<SpawnedWorker> {
    let worker = supervisor.spawn_unix::<Service<H, UnixTransport>>(args)?;
    Ok(SpawnedWorker {
        pid: worker.pid,
        transport: TransportKind::Unix,
        socket_path: Some(worker.socket_path),
        port: None,
    })
}

fn spawn_tcp<H: Handler + 'static>(
    supervisor: &mut ProcessSupervisor,
    args: WorkerArgs,
) -> SupervisorResult<SpawnedWorker> {
    let worker = supervisor.spawn_tcp::<Service<H, TcpTransport>>(args)?;
    Ok(SpawnedWorker {
        pid: worker.pid,
        transport: TransportKind::Tcp,
        socket_path: None,
        port: Some(worker.port),
    })
}
