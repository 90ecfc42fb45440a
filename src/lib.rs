//! Procyard: a process-per-worker supervisor
//!
//! The supervisor forks one OS process per worker and tracks them in a
//! process table shared through memory. Workers serve requests over one of
//! three transports (the fork-time channel, a Unix socket, or TCP) and shut
//! down cooperatively on `SIGTERM`/`SIGINT`.
//!
//! - `supervisor`: spawning, killing, reaping, and the handler registry
//! - `worker`: the `Worker`/`Handler` contracts and the run loop
//! - `transport`: standard, unix and tcp transports
//! - `table`: the cross-process process table
//! - `handlers`: built-in echo, logger, http-proxy and status handlers
//! - `client`: one-shot requests to socket workers

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod handshake;
pub mod logging;
pub mod signal;
pub mod supervisor;
pub mod table;
pub mod transport;
pub mod worker;

pub use config::{SupervisorConfig, WorkerSpec};
pub use error::{SupervisorError, TableError, WorkerError};
pub use supervisor::{ProcessSupervisor, TcpWorker, UnixWorker, WorkerRegistry};
pub use table::{ProcessRecord, ProcessStatus, ProcessTable};
pub use transport::TransportKind;
pub use worker::{Handler, Service, Worker, WorkerArgs};
