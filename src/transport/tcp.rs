//! TCP transport
//!
//! Same accept/read/respond/close pattern as the Unix transport, bound to
//! `host:port`. When asked for port 0 the worker reports the port the OS
//! picked to its supervisor before serving anything.

use super::listener::{listen_tcp, read_request, write_response};
use super::{Incoming, Transport, TransportKind};
use crate::channel::WorkerChannel;
use crate::error::{WorkerError, WorkerResult};
use crate::handshake;
use crate::worker::{RunOptions, WorkerArgs};
use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_HOST: &str = "127.0.0.1";

pub struct TcpTransport {
    listener: Option<TcpListener>,
    host: String,
    port: u16,
    read_timeout: Option<Duration>,
    _channel: WorkerChannel,
}

impl TcpTransport {
    /// The bound port, resolved when 0 was requested
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Transport for TcpTransport {
    const KIND: TransportKind = TransportKind::Tcp;
    type Peer = TcpStream;

    fn bind(args: &WorkerArgs, channel: WorkerChannel, options: &RunOptions) -> WorkerResult<Self> {
        let host = args.get_str("host").unwrap_or(DEFAULT_HOST).to_string();
        let requested = args.get_u64("port").unwrap_or(0);

        let bind_error = |source: io::Error| WorkerError::Bind {
            endpoint: format!("{}:{}", host, requested),
            source,
        };

        let requested = u16::try_from(requested).map_err(|_| {
            bind_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "port out of range",
            ))
        })?;

        let addr = (host.as_str(), requested)
            .to_socket_addrs()
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host resolved to no address",
                ))
            })?;

        let listener = listen_tcp(addr).map_err(bind_error)?;
        let port = listener.local_addr().map_err(bind_error)?.port();

        if requested == 0 {
            handshake::send_port(&channel, port).map_err(WorkerError::Handshake)?;
        }

        debug!(host = %host, port, "tcp transport listening");

        Ok(Self {
            listener: Some(listener),
            host,
            port,
            read_timeout: options.read_timeout,
            _channel: channel,
        })
    }

    fn poll(&mut self) -> io::Result<Option<Incoming<TcpStream>>> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };

        let mut conn = match listener.accept() {
            Ok((conn, _addr)) => conn,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        match read_request(&mut conn, self.read_timeout) {
            Ok(request) if request.is_empty() => Ok(None),
            Ok(request) => Ok(Some(Incoming { peer: conn, request })),
            Err(e) => {
                debug!(error = %e, "discarding unreadable request");
                Ok(None)
            }
        }
    }

    fn reply(&mut self, mut peer: TcpStream, response: Option<&[u8]>) -> io::Result<()> {
        if let Some(bytes) = response {
            write_response(&mut peer, bytes)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.listener.take();
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::PortHandshake;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::thread;

    #[test]
    fn test_port_zero_sends_handshake() {
        let (supervisor, worker) = WorkerChannel::pair().unwrap();
        let args = WorkerArgs::new().with("port", 0);
        let transport = TcpTransport::bind(&args, worker, &RunOptions::default()).unwrap();

        let message = supervisor.try_recv().unwrap().expect("handshake message");
        let handshake = PortHandshake::decode(&message).unwrap();
        assert_eq!(handshake.port, transport.port());
        assert!(transport.port() > 0);
    }

    #[test]
    fn test_fixed_port_sends_no_handshake() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let (supervisor, worker) = WorkerChannel::pair().unwrap();
        let args = WorkerArgs::new().with("port", port);
        let transport = TcpTransport::bind(&args, worker, &RunOptions::default()).unwrap();

        assert_eq!(transport.port(), port);
        assert!(supervisor.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_port_out_of_range_is_bind_error() {
        let (_supervisor, worker) = WorkerChannel::pair().unwrap();
        let args = WorkerArgs::new().with("port", 70000);
        let err = TcpTransport::bind(&args, worker, &RunOptions::default()).err().unwrap();
        assert!(matches!(err, WorkerError::Bind { .. }));
    }

    #[test]
    fn test_serves_one_request() {
        let (_supervisor, worker) = WorkerChannel::pair().unwrap();
        let mut transport =
            TcpTransport::bind(&WorkerArgs::new(), worker, &RunOptions::default()).unwrap();
        let port = transport.port();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"ping").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        });

        let incoming = loop {
            if let Some(incoming) = transport.poll().unwrap() {
                break incoming;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(incoming.request, b"ping");
        transport.reply(incoming.peer, Some(b"pong")).unwrap();

        assert_eq!(client.join().unwrap(), b"pong");
        transport.close();
    }
}
