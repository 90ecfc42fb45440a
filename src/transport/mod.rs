//! Worker transports
//!
//! A transport decides how a worker obtains a request and sends a response.
//! All of them share one contract: poll for at most one request per tick,
//! deliver the full request bytes, write at most one full response.
//!
//! - `standard`: the duplex channel created at fork time
//! - `unix`: a Unix domain socket listener, one connection per tick
//! - `tcp`: a TCP listener, one connection per tick, with the port handshake

mod listener;
mod standard;
mod tcp;
mod unix;

pub use standard::StandardTransport;
pub use tcp::{TcpTransport, DEFAULT_HOST as DEFAULT_TCP_HOST};
pub use unix::{unique_socket_path, UnixTransport};

use crate::channel::WorkerChannel;
use crate::error::WorkerResult;
use crate::worker::{RunOptions, WorkerArgs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;

/// Which IPC mechanism a worker uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Standard,
    Unix,
    Tcp,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Standard,
        TransportKind::Unix,
        TransportKind::Tcp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Standard => "standard",
            TransportKind::Unix => "unix",
            TransportKind::Tcp => "tcp",
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TransportKind::Standard => 1,
            TransportKind::Unix => 2,
            TransportKind::Tcp => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransportKind::Standard),
            2 => Some(TransportKind::Unix),
            3 => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "std" | "channel" => Ok(TransportKind::Standard),
            "unix" => Ok(TransportKind::Unix),
            "tcp" => Ok(TransportKind::Tcp),
            _ => Err(format!(
                "Unknown transport: '{}'. Valid options: standard, unix, tcp",
                s
            )),
        }
    }
}

/// A request taken off a transport, with whatever is needed to answer it
#[derive(Debug)]
pub struct Incoming<P> {
    pub peer: P,
    pub request: Vec<u8>,
}

/// Per-worker I/O strategy used by the run loop
pub trait Transport: Sized {
    const KIND: TransportKind;

    /// Where a response goes: a connection for socket transports, nothing
    /// for the channel
    type Peer;

    /// Acquire the transport's resources before the loop starts
    ///
    /// Failures are fatal to the worker.
    fn bind(args: &WorkerArgs, channel: WorkerChannel, options: &RunOptions) -> WorkerResult<Self>;

    /// Take at most one request, never blocking on the listener
    fn poll(&mut self) -> io::Result<Option<Incoming<Self::Peer>>>;

    /// Answer a request; `None` finishes it without a response
    fn reply(&mut self, peer: Self::Peer, response: Option<&[u8]>) -> io::Result<()>;

    /// Release descriptors and files
    fn close(&mut self);

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}
