//! Listening sockets and the read-until-close / respond / close exchange
//! shared by the Unix and TCP transports

use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn, SockaddrIn6, UnixAddr,
};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

/// Pending connections the kernel queues between two ticks
pub(crate) const LISTEN_BACKLOG: i32 = 128;

fn backlog() -> io::Result<Backlog> {
    Ok(Backlog::new(LISTEN_BACKLOG)?)
}

/// Bind and listen on a Unix socket path, non-blocking
pub(crate) fn listen_unix(path: &Path) -> io::Result<UnixListener> {
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, backlog()?)?;

    let listener = UnixListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Bind and listen on a TCP address with `SO_REUSEADDR`, non-blocking
pub(crate) fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    match addr {
        SocketAddr::V4(v4) => bind(fd.as_raw_fd(), &SockaddrIn::from(v4))?,
        SocketAddr::V6(v6) => bind(fd.as_raw_fd(), &SockaddrIn6::from(v6))?,
    }
    listen(&fd, backlog()?)?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// An accepted connection
pub(crate) trait Connection: Read + Write {
    /// Switch back to blocking reads bounded by `read_timeout`
    fn prepare(&self, read_timeout: Option<Duration>) -> io::Result<()>;
}

impl Connection for UnixStream {
    fn prepare(&self, read_timeout: Option<Duration>) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(read_timeout)
    }
}

impl Connection for TcpStream {
    fn prepare(&self, read_timeout: Option<Duration>) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(read_timeout)
    }
}

/// Read everything the peer sends until it closes its write side
pub(crate) fn read_request<C: Connection>(
    conn: &mut C,
    read_timeout: Option<Duration>,
) -> io::Result<Vec<u8>> {
    conn.prepare(read_timeout)?;
    let mut request = Vec::new();
    conn.read_to_end(&mut request)?;
    Ok(request)
}

/// Write the whole response; the caller closes the connection by dropping it
pub(crate) fn write_response<C: Connection>(conn: &mut C, response: &[u8]) -> io::Result<()> {
    conn.write_all(response)?;
    conn.flush()
}
