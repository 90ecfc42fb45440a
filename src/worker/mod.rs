//! Worker contract and the cooperative run loop
//!
//! A worker type pairs a [`Handler`] (what to do with one request) with a
//! [`Transport`] (how requests arrive). [`Service`] is the generic loop that
//! drives the two inside the forked process:
//!
//! ```text
//! Initialized -> Running -> ShuttingDown -> Terminated
//! ```
//!
//! Each tick polls the transport once, hands at most one request to the
//! handler, replies, then sleeps for the poll interval. A shutdown signal
//! only sets a flag, so the current tick always completes first.

mod args;

pub use args::WorkerArgs;

use crate::channel::WorkerChannel;
use crate::error::{WorkerError, WorkerResult};
use crate::signal::ShutdownFlag;
use crate::table::ProcessTable;
use crate::transport::{Transport, TransportKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// What the run loop does when a handler returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Log, drop the request and keep serving
    #[default]
    Continue,
    /// Stop the loop, clean up and exit non-zero
    Exit,
}

impl fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPolicy::Continue => write!(f, "continue"),
            FaultPolicy::Exit => write!(f, "exit"),
        }
    }
}

impl FromStr for FaultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(FaultPolicy::Continue),
            "exit" => Ok(FaultPolicy::Exit),
            other => Err(format!("unknown fault policy '{}'", other)),
        }
    }
}

/// Run loop tuning shared by every transport
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Sleep between ticks
    pub poll_interval: Duration,
    /// Per-connection read/write timeout on socket transports; `None` blocks
    pub read_timeout: Option<Duration>,
    pub fault_policy: FaultPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            fault_policy: FaultPolicy::Continue,
        }
    }
}

/// Everything a worker receives from its supervisor at fork time
pub struct WorkerContext {
    /// Worker end of the duplex channel
    pub channel: WorkerChannel,
    /// The supervisor's table, shared across the fork
    pub table: ProcessTable,
    pub options: RunOptions,
}

/// Lifecycle of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Initialized,
    Running,
    ShuttingDown,
    Terminated,
}

/// Request processing for one worker type
pub trait Handler: Sized {
    /// Type name used in logs, the registry and the process table
    const NAME: &'static str;

    /// Build the handler from its spawn arguments
    fn init(args: &WorkerArgs, table: &ProcessTable) -> anyhow::Result<Self>;

    /// Turn one request into at most one response
    ///
    /// `Ok(None)` sends nothing back.
    fn process_message(&mut self, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

/// A type the supervisor can fork and run
///
/// `new` runs in the child right after the fork; `handle` runs until a
/// shutdown signal arrives and its result becomes the exit status.
pub trait Worker: Sized {
    const NAME: &'static str;
    const TRANSPORT: TransportKind;

    fn new(args: WorkerArgs, ctx: WorkerContext) -> WorkerResult<Self>;

    fn handle(self) -> WorkerResult<()>;
}

/// The generic worker: a handler served over a transport
pub struct Service<H, T> {
    handler: H,
    args: WorkerArgs,
    channel: Option<WorkerChannel>,
    options: RunOptions,
    shutdown: ShutdownFlag,
    phase: WorkerPhase,
    served: u64,
    _transport: PhantomData<fn() -> T>,
}

impl<H: Handler, T: Transport> Service<H, T> {
    /// Build a service driven by an existing shutdown flag
    pub fn with_shutdown(
        args: WorkerArgs,
        ctx: WorkerContext,
        shutdown: ShutdownFlag,
    ) -> WorkerResult<Self> {
        let handler = H::init(&args, &ctx.table).map_err(WorkerError::Init)?;

        Ok(Self {
            handler,
            args,
            channel: Some(ctx.channel),
            options: ctx.options,
            shutdown,
            phase: WorkerPhase::Initialized,
            served: 0,
            _transport: PhantomData,
        })
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Bind the transport and serve until shutdown is requested
    ///
    /// The transport is closed on every exit path once it was bound.
    pub fn serve(&mut self) -> WorkerResult<()> {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker already served"))?;

        let mut transport = match T::bind(&self.args, channel, &self.options) {
            Ok(transport) => transport,
            Err(e) => {
                self.phase = WorkerPhase::Terminated;
                return Err(e);
            }
        };

        self.phase = WorkerPhase::Running;
        info!(
            worker = H::NAME,
            transport = %T::KIND,
            endpoint = %transport.endpoint(),
            "worker running"
        );

        let result = self.run(&mut transport);

        self.phase = WorkerPhase::ShuttingDown;
        transport.close();
        self.phase = WorkerPhase::Terminated;

        info!(
            worker = H::NAME,
            served = self.served,
            reason = self.shutdown.signal_name(),
            "worker stopped"
        );
        result
    }

    fn run(&mut self, transport: &mut T) -> WorkerResult<()> {
        while !self.shutdown.is_requested() {
            self.tick(transport)?;
            thread::sleep(self.options.poll_interval);
        }
        Ok(())
    }

    fn tick(&mut self, transport: &mut T) -> WorkerResult<()> {
        let incoming = match transport.poll() {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(worker = H::NAME, error = %e, "transport poll failed");
                return Ok(());
            }
        };

        debug!(worker = H::NAME, bytes = incoming.request.len(), "request received");

        let response = match self.handler.process_message(&incoming.request) {
            Ok(response) => {
                self.served += 1;
                response
            }
            Err(e) => match self.options.fault_policy {
                FaultPolicy::Continue => {
                    warn!(worker = H::NAME, error = %format!("{:#}", e), "handler failed, request dropped");
                    None
                }
                FaultPolicy::Exit => {
                    error!(worker = H::NAME, error = %format!("{:#}", e), "handler failed, stopping");
                    return Err(WorkerError::Handler(e));
                }
            },
        };

        if let Err(e) = transport.reply(incoming.peer, response.as_deref()) {
            warn!(worker = H::NAME, error = %e, "failed to write response");
        }
        Ok(())
    }
}

impl<H: Handler, T: Transport> Worker for Service<H, T> {
    const NAME: &'static str = H::NAME;
    const TRANSPORT: TransportKind = T::KIND;

    fn new(args: WorkerArgs, ctx: WorkerContext) -> WorkerResult<Self> {
        let shutdown = ShutdownFlag::install().map_err(WorkerError::Signal)?;
        Self::with_shutdown(args, ctx, shutdown)
    }

    fn handle(mut self) -> WorkerResult<()> {
        self.serve()
    }
}

/// Construct and run `W` in the current process, returning its exit code
pub fn run_worker<W: Worker>(args: WorkerArgs, ctx: WorkerContext) -> i32 {
    let worker = match W::new(args, ctx) {
        Ok(worker) => worker,
        Err(e) => {
            error!(worker = W::NAME, error = %e, "worker failed to start");
            return 1;
        }
    };

    match worker.handle() {
        Ok(()) => 0,
        Err(e) => {
            error!(worker = W::NAME, error = %e, "worker failed");
            1
        }
    }
}
