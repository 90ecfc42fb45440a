//! Client side of the Unix and TCP wire contract
//!
//! One request per connection: connect, write the payload, half-close the
//! write side, then read until the worker closes the connection.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Response read timeout used by [`Endpoint::request`]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Where a socket worker listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl Endpoint {
    pub fn tcp(host: &str, port: u16) -> Self {
        Endpoint::Tcp(format!("{}:{}", host, port))
    }

    /// Send one request and return the full response
    pub fn request(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        self.request_with_timeout(payload, Some(DEFAULT_TIMEOUT))
    }

    /// Like [`request`](Self::request); `None` waits for the response forever
    pub fn request_with_timeout(&self, payload: &[u8], timeout: Option<Duration>) -> io::Result<Vec<u8>> {
        let mut response = Vec::new();
        match self {
            Endpoint::Unix(path) => {
                let mut stream = UnixStream::connect(path)?;
                stream.set_read_timeout(timeout)?;
                stream.write_all(payload)?;
                stream.shutdown(Shutdown::Write)?;
                stream.read_to_end(&mut response)?;
            }
            Endpoint::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr.as_str())?;
                stream.set_read_timeout(timeout)?;
                stream.write_all(payload)?;
                stream.shutdown(Shutdown::Write)?;
                stream.read_to_end(&mut response)?;
            }
        }
        Ok(response)
    }

    /// Retry connecting every 10ms until the endpoint accepts or `timeout`
    /// passes
    ///
    /// The readiness connection carries no payload, which workers ignore.
    pub fn wait_ready(&self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let attempt = match self {
                Endpoint::Unix(path) => UnixStream::connect(path).map(drop),
                Endpoint::Tcp(addr) => addr
                    .to_socket_addrs()
                    .and_then(|mut addrs| {
                        addrs
                            .next()
                            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
                    })
                    .and_then(|addr| TcpStream::connect_timeout(&addr, CONNECT_RETRY_INTERVAL))
                    .map(drop),
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} not ready after {:?}: {}", self, timeout, e),
                    ))
                }
                Err(_) => thread::sleep(CONNECT_RETRY_INTERVAL),
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::Unix("/tmp/a.sock".into()).to_string(), "unix:///tmp/a.sock");
        assert_eq!(Endpoint::tcp("127.0.0.1", 80).to_string(), "tcp://127.0.0.1:80");
    }

    #[test]
    fn test_unix_request_half_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).unwrap();
            conn.write_all(b"ack:").unwrap();
            conn.write_all(&request).unwrap();
        });

        let response = Endpoint::Unix(path).request(b"hi").unwrap();
        assert_eq!(response, b"ack:hi");
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).unwrap();
            conn.write_all(&request.to_ascii_uppercase()).unwrap();
        });

        let response = Endpoint::tcp("127.0.0.1", port).request(b"hi").unwrap();
        assert_eq!(response, b"HI");
        server.join().unwrap();
    }

    #[test]
    fn test_wait_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("nobody.sock"));
        let err = endpoint.wait_ready(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_wait_ready_sees_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");
        let listener_path = path.clone();

        let server = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            UnixListener::bind(&listener_path).unwrap()
        });

        Endpoint::Unix(path).wait_ready(Duration::from_secs(2)).unwrap();
        drop(server.join().unwrap());
    }
}
