//! Unix domain socket transport

use super::listener::{listen_unix, read_request, write_response};
use super::{Incoming, Transport, TransportKind};
use crate::channel::WorkerChannel;
use crate::error::{WorkerError, WorkerResult};
use crate::worker::{RunOptions, WorkerArgs};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-process counter keeping generated socket names unique
static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a socket path under `dir` that no other worker uses
pub fn unique_socket_path(dir: &Path) -> PathBuf {
    let count = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    dir.join(format!(
        "procyard-{}-{}-{}.sock",
        std::process::id(),
        timestamp,
        count
    ))
}

pub struct UnixTransport {
    listener: Option<UnixListener>,
    socket_path: PathBuf,
    read_timeout: Option<Duration>,
    _channel: WorkerChannel,
}

impl UnixTransport {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Transport for UnixTransport {
    const KIND: TransportKind = TransportKind::Unix;
    type Peer = UnixStream;

    fn bind(args: &WorkerArgs, channel: WorkerChannel, options: &RunOptions) -> WorkerResult<Self> {
        let socket_path = args
            .get_str("socket_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| unique_socket_path(&std::env::temp_dir()));

        let bind_error = |source: io::Error| WorkerError::Bind {
            endpoint: socket_path.display().to_string(),
            source,
        };

        // Remove stale socket if it exists
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(bind_error)?;
        }

        let listener = listen_unix(&socket_path).map_err(bind_error)?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o777)).map_err(bind_error)?;

        debug!(socket_path = %socket_path.display(), "unix transport listening");

        Ok(Self {
            listener: Some(listener),
            socket_path,
            read_timeout: options.read_timeout,
            _channel: channel,
        })
    }

    fn poll(&mut self) -> io::Result<Option<Incoming<UnixStream>>> {
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

    fn reply(&mut self, mut peer: UnixStream, response: Option<&[u8]>) -> io::Result<()> {
        if let Some(bytes) = response {
            write_response(&mut peer, bytes)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.listener.take();

        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(socket_path = %self.socket_path.display(), error = %e, "failed to remove socket file");
            }
        }
    }

    fn endpoint(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    fn bind_in(dir: &Path) -> UnixTransport {
        let (_supervisor, worker) = WorkerChannel::pair().unwrap();
        let args = WorkerArgs::new().with("socket_path", dir.join("w.sock").display().to_string());
        UnixTransport::bind(&args, worker, &RunOptions::default()).unwrap()
    }

    #[test]
    fn test_unique_socket_paths_differ() {
        let dir = Path::new("/tmp");
        assert_ne!(unique_socket_path(dir), unique_socket_path(dir));
    }

    #[test]
    fn test_bind_replaces_stale_file_and_opens_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        fs::write(&path, b"stale").unwrap();

        let transport = bind_in(dir.path());
        let mode = fs::metadata(transport.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn test_bind_failure_is_bind_error() {
        let (_supervisor, worker) = WorkerChannel::pair().unwrap();
        let args = WorkerArgs::new().with("socket_path", "/nonexistent-dir/procyard/w.sock");
        let err = UnixTransport::bind(&args, worker, &RunOptions::default()).err().unwrap();
        assert!(matches!(err, WorkerError::Bind { .. }));
    }

    #[test]
    fn test_one_connection_per_poll() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = bind_in(dir.path());
        let path = transport.socket_path().to_path_buf();

        let clients: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|msg| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut stream = UnixStream::connect(&path).unwrap();
                    stream.write_all(msg.as_bytes()).unwrap();
                    stream.shutdown(std::net::Shutdown::Write).unwrap();
                    let mut reply = String::new();
                    stream.read_to_string(&mut reply).unwrap();
                    reply
                })
            })
            .collect();

        let mut served = Vec::new();
        while served.len() < 2 {
            if let Some(incoming) = transport.poll().unwrap() {
                let reply = format!("got {}", String::from_utf8_lossy(&incoming.request));
                transport.reply(incoming.peer, Some(reply.as_bytes())).unwrap();
                served.push(reply);
            } else {
                thread::sleep(Duration::from_millis(5));
            }
        }

        let mut replies: Vec<String> = clients.into_iter().map(|c| c.join().unwrap()).collect();
        replies.sort();
        assert_eq!(replies, vec!["got a", "got b"]);
    }

    #[test]
    fn test_close_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = bind_in(dir.path());
        let path = transport.socket_path().to_path_buf();
        assert!(path.exists());

        transport.close();
        assert!(!path.exists());
        assert!(transport.poll().unwrap().is_none());
    }
}
