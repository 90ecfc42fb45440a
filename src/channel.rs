//! Duplex channel created at fork time between the supervisor and a worker
//!
//! A connected `SOCK_DGRAM` Unix socket pair: every `send` is delivered as one
//! message, so no framing is needed. The channel carries Standard-transport
//! requests and responses, and the one-shot port handshake of TCP workers.

use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

/// Largest message read from the channel in one poll
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// One end of a supervisor/worker channel
#[derive(Debug)]
pub struct WorkerChannel {
    socket: UnixDatagram,
}

impl WorkerChannel {
    /// Create both ends: `(supervisor_end, worker_end)`
    pub fn pair() -> io::Result<(WorkerChannel, WorkerChannel)> {
        let (supervisor, worker) = UnixDatagram::pair()?;
        Ok((
            WorkerChannel { socket: supervisor },
            WorkerChannel { socket: worker },
        ))
    }

    /// Send one message to the other end
    pub fn send(&self, payload: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(payload)?;
        if sent != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short channel send: {} of {} bytes", sent, payload.len()),
            ));
        }
        Ok(())
    }

    /// Read one pending message without blocking
    ///
    /// Messages longer than [`MAX_MESSAGE_SIZE`] are truncated.
    pub fn try_recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait up to `timeout` for one message
    pub fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        if timeout.is_zero() {
            return self.try_recv();
        }

        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        match self.socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
