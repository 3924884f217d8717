//! Service transport — TCP or filesystem-backed unix sockets
//!
//! Both services use the transport mode chosen in configuration; the modes
//! are mutually exclusive for a given server. Unix socket paths derive
//! deterministically from the port number so each endpoint has a stable
//! filesystem name that shutdown can remove.
//!
//! Frames on both endpoints are u32-LE-length-prefixed payloads. Connections
//! run with a short read timeout so the service loops can observe their
//! cancellation token inside a blocking receive, not only between frames.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Read timeout inside service receive loops; bounds cancellation latency.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle sleep between accept polls.
pub const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Largest accepted frame payload.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Unix,
}

/// A service endpoint: transport mode plus port number. In unix mode the
/// port only selects the socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub mode: TransportMode,
    pub port: u16,
}

impl Endpoint {
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/skein.sock.{}", self.port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            TransportMode::Tcp => write!(f, "tcp port {}", self.port),
            TransportMode::Unix => write!(f, "unix socket {}", self.socket_path().display()),
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a non-blocking listener. The returned endpoint carries the
    /// actual port, which matters when binding TCP port 0.
    pub fn bind(endpoint: Endpoint) -> io::Result<(Self, Endpoint)> {
        match endpoint.mode {
            TransportMode::Tcp => {
                let listener =
                    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, endpoint.port)))?;
                listener.set_nonblocking(true)?;
                let resolved = Endpoint {
                    port: listener.local_addr()?.port(),
                    ..endpoint
                };
                Ok((Listener::Tcp(listener), resolved))
            }
            TransportMode::Unix => {
                let path = endpoint.socket_path();
                // a stale socket from an unclean exit blocks the bind
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                listener.set_nonblocking(true)?;
                Ok((Listener::Unix(listener), endpoint))
            }
        }
    }

    /// Non-blocking accept; `Ok(None)` when no connection is pending.
    /// Accepted connections are switched to blocking reads with
    /// [`POLL_TIMEOUT`] so receive loops stay cancellable.
    pub fn accept(&self) -> io::Result<Option<Conn>> {
        match self {
            Listener::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    Ok(Some(Conn::Tcp(stream)))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            Listener::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
                    Ok(Some(Conn::Unix(stream)))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}

pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            Conn::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf),
            Conn::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.flush(),
            Conn::Unix(s) => s.flush(),
        }
    }
}

/// True for the error kinds a timed-out blocking read produces.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Remove a unix endpoint's socket file. No-op for TCP.
/// Returns whether a file was actually removed.
pub fn remove_socket_file(endpoint: &Endpoint) -> io::Result<bool> {
    if endpoint.mode != TransportMode::Unix {
        return Ok(false);
    }
    match fs::remove_file(endpoint.socket_path()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// One event from polling a framed connection.
pub enum FrameEvent {
    Frame(Vec<u8>),
    /// Read timed out or a frame is still partial; check the cancel token
    /// and poll again.
    Incomplete,
    Eof,
}

/// Incremental frame reader tolerant of read timeouts mid-frame.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&mut self, conn: &mut Conn) -> io::Result<FrameEvent> {
        // a prior read may have buffered more than one frame
        if let Some(frame) = self.take_frame()? {
            return Ok(FrameEvent::Frame(frame));
        }
        let mut chunk = [0u8; 64 * 1024];
        let n = match conn.read(&mut chunk) {
            Ok(0) => {
                return if self.buf.is_empty() {
                    Ok(FrameEvent::Eof)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    ))
                };
            }
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return Ok(FrameEvent::Incomplete),
            Err(e) => return Err(e),
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(match self.take_frame()? {
            Some(frame) => FrameEvent::Frame(frame),
            None => FrameEvent::Incomplete,
        })
    }

    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buf[0..4].try_into().expect("4-byte slice")) as usize;
        if len > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }
}

pub fn write_frame(conn: &mut Conn, payload: &[u8]) -> io::Result<()> {
    conn.write_all(&(payload.len() as u32).to_le_bytes())?;
    conn.write_all(payload)?;
    conn.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn unix_socket_path_derives_from_port() {
        let ep = Endpoint {
            mode: TransportMode::Unix,
            port: 10103,
        };
        assert_eq!(ep.socket_path(), PathBuf::from("/tmp/skein.sock.10103"));
    }

    #[test]
    fn tcp_remove_socket_file_is_a_noop() {
        let ep = Endpoint {
            mode: TransportMode::Tcp,
            port: 10102,
        };
        assert!(!remove_socket_file(&ep).unwrap());
    }

    #[test]
    fn accept_returns_none_when_idle() {
        let (listener, _) = Listener::bind(Endpoint {
            mode: TransportMode::Tcp,
            port: 0,
        })
        .unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn frame_reader_handles_split_and_coalesced_frames() {
        let (listener, endpoint) = Listener::bind(Endpoint {
            mode: TransportMode::Tcp,
            port: 0,
        })
        .unwrap();

        let port = endpoint.port;
        let writer = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            // frame one, split mid-payload
            stream.write_all(&6u32.to_le_bytes()).unwrap();
            stream.write_all(b"abc").unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(50));
            // rest of frame one plus all of frame two in a single write
            let mut tail = b"def".to_vec();
            tail.extend_from_slice(&2u32.to_le_bytes());
            tail.extend_from_slice(b"xy");
            stream.write_all(&tail).unwrap();
            stream.flush().unwrap();
        });

        let mut conn = loop {
            if let Some(conn) = listener.accept().unwrap() {
                break conn;
            }
            thread::sleep(Duration::from_millis(5));
        };

        let mut frames = FrameReader::new();
        let mut collected = Vec::new();
        while collected.len() < 2 {
            match frames.poll(&mut conn).unwrap() {
                FrameEvent::Frame(f) => collected.push(f),
                FrameEvent::Incomplete => {}
                FrameEvent::Eof => break,
            }
        }
        writer.join().unwrap();
        assert_eq!(collected, vec![b"abcdef".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (listener, endpoint) = Listener::bind(Endpoint {
            mode: TransportMode::Tcp,
            port: 0,
        })
        .unwrap();
        let port = endpoint.port;
        let writer = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(&u32::MAX.to_le_bytes()).unwrap();
            stream.flush().unwrap();
            // hold the socket open until the reader has seen the header
            thread::sleep(Duration::from_millis(200));
        });

        let mut conn = loop {
            if let Some(conn) = listener.accept().unwrap() {
                break conn;
            }
            thread::sleep(Duration::from_millis(5));
        };

        let mut frames = FrameReader::new();
        let err = loop {
            match frames.poll(&mut conn) {
                Ok(FrameEvent::Incomplete) => {}
                Ok(_) => panic!("oversized frame was accepted"),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        writer.join().unwrap();
    }
}
