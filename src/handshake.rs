//! Ephemeral port handshake
//!
//! A TCP worker asked to listen on port 0 reports the port the OS picked by
//! sending one JSON message, `{"port": 41235}`, over its channel right after
//! `listen`. The supervisor polls the channel until the message arrives, the
//! worker exits, or the handshake timeout passes.

use crate::channel::WorkerChannel;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// The one message of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortHandshake {
    pub port: u16,
}

impl PortHandshake {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let message: PortHandshake = serde_json::from_slice(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if message.port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake reported port 0",
            ));
        }
        Ok(message)
    }
}

/// Worker side: report the bound port
pub fn send_port(channel: &WorkerChannel, port: u16) -> io::Result<()> {
    channel.send(&PortHandshake { port }.encode()?)
}

/// How waiting for a worker's port ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Port(u16),
    /// The worker exited (and was reaped) before reporting a port
    Exited(WaitStatus),
    TimedOut,
}

/// Supervisor side: poll the channel every `poll_interval` for up to `timeout`
///
/// Messages that are not a valid handshake are logged and skipped. When
/// `worker` is given, its exit ends the wait early; the exit status is
/// consumed.
pub fn wait_for_port(
    channel: &WorkerChannel,
    worker: Option<Pid>,
    timeout: Duration,
    poll_interval: Duration,
) -> io::Result<HandshakeOutcome> {
    let deadline = Instant::now() + timeout;

    loop {
        while let Some(message) = channel.try_recv()? {
            match PortHandshake::decode(&message) {
                Ok(handshake) => return Ok(HandshakeOutcome::Port(handshake.port)),
                Err(e) => warn!(error = %e, "ignoring malformed handshake message"),
            }
        }

        if let Some(pid) = worker {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Ok(HandshakeOutcome::Exited(status));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(HandshakeOutcome::TimedOut);
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let bytes = PortHandshake { port: 41235 }.encode().unwrap();
        assert_eq!(bytes, br#"{"port":41235}"#);
        assert_eq!(PortHandshake::decode(&bytes).unwrap().port, 41235);
    }

    #[test]
    fn test_decode_rejects_garbage_and_port_zero() {
        assert!(PortHandshake::decode(b"not json").is_err());
        assert!(PortHandshake::decode(br#"{"port":0}"#).is_err());
        assert!(PortHandshake::decode(br#"{"port":70000}"#).is_err());
    }

    #[test]
    fn test_wait_for_port_receives_report() {
        let (supervisor, worker) = WorkerChannel::pair().unwrap();
        send_port(&worker, 9000).unwrap();

        let port = wait_for_port(&supervisor, None, Duration::from_secs(1), Duration::from_millis(10))
            .unwrap();
        assert_eq!(port, HandshakeOutcome::Port(9000));
    }

    #[test]
    fn test_wait_for_port_skips_malformed_messages() {
        let (supervisor, worker) = WorkerChannel::pair().unwrap();
        worker.send(b"hello").unwrap();
        send_port(&worker, 9001).unwrap();

        let port = wait_for_port(&supervisor, None, Duration::from_secs(1), Duration::from_millis(10))
            .unwrap();
        assert_eq!(port, HandshakeOutcome::Port(9001));
    }

    #[test]
    fn test_wait_for_port_times_out() {
        let (supervisor, _worker) = WorkerChannel::pair().unwrap();
        let started = Instant::now();

        let port = wait_for_port(
            &supervisor,
            None,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .unwrap();

        assert_eq!(port, HandshakeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_port_stops_when_worker_exits() {
        use nix::unistd::{fork, ForkResult};

        let (supervisor, _worker) = WorkerChannel::pair().unwrap();
        let child = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => unsafe { nix::libc::_exit(3) },
            Err(e) => panic!("fork failed: {}", e),
        };

        let started = Instant::now();
        let outcome = wait_for_port(
            &supervisor,
            Some(child),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap();

        assert_eq!(outcome, HandshakeOutcome::Exited(WaitStatus::Exited(child, 3)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
