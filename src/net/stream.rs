//! Blocking socket surface used by the shaper and the HTTP client.
//!
//! `NetStream` is the thin seam over the raw socket primitives: plain
//! TCP is provided here, TLS stays outside the crate and is plugged in
//! through [`Connector`]. The shaper needs two probes beyond plain
//! read/write: how many bytes the kernel already buffered for us, and
//! whether the socket would accept a write right now.

use crate::settings;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, RwLock};

pub trait NetStream: Read + Write + Send {
    /// Whether this stream runs over TLS.
    fn is_ssl(&self) -> bool;

    /// Bytes already queued in the kernel receive buffer.
    fn pending_bytes(&self) -> io::Result<usize>;

    /// Whether a write would be accepted without blocking.
    fn writable(&self) -> io::Result<bool>;

    fn set_recv_buffer(&self, bytes: usize) -> io::Result<()>;

    fn set_send_buffer(&self, bytes: usize) -> io::Result<()>;
}

/// Factory for outbound streams; the embedding client installs one that
/// understands TLS, everything else defaults to [`PlainConnector`].
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16, ssl: bool) -> io::Result<Box<dyn NetStream>>;
}

impl std::fmt::Debug for dyn NetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStream").field("is_ssl", &self.is_ssl()).finish()
    }
}

pub struct TcpNetStream {
    inner: TcpStream,
}

impl TcpNetStream {
    pub fn connect(host: &str, port: u16) -> io::Result<TcpNetStream> {
        // A "host:port" mirror entry overrides the default port.
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };
        let inner = TcpStream::connect(addr)?;
        Ok(TcpNetStream { inner })
    }
}

impl Read for TcpNetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpNetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl NetStream for TcpNetStream {
    fn is_ssl(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn pending_bytes(&self) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        let mut available: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(self.inner.as_raw_fd(), libc::FIONREAD as _, &mut available)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(available.max(0) as usize)
    }

    #[cfg(not(unix))]
    fn pending_bytes(&self) -> io::Result<usize> {
        Ok(0)
    }

    #[cfg(unix)]
    fn writable(&self) -> io::Result<bool> {
        use std::os::fd::AsRawFd;
        let mut pfd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0 && pfd.revents & libc::POLLOUT != 0)
    }

    #[cfg(not(unix))]
    fn writable(&self) -> io::Result<bool> {
        Ok(true)
    }

    fn set_recv_buffer(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_recv_buffer_size(bytes)
    }

    fn set_send_buffer(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.inner).set_send_buffer_size(bytes)
    }
}

pub struct PlainConnector;

impl Connector for PlainConnector {
    fn connect(&self, host: &str, port: u16, ssl: bool) -> io::Result<Box<dyn NetStream>> {
        if ssl {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no TLS connector installed",
            ));
        }
        Ok(Box::new(TcpNetStream::connect(host, port)?))
    }
}

static CONNECTOR: RwLock<Option<Arc<dyn Connector>>> = RwLock::new(None);

/// Install the process-wide stream factory (e.g. one that does TLS).
pub fn set_connector(connector: Arc<dyn Connector>) {
    *CONNECTOR.write().unwrap_or_else(|e| e.into_inner()) = Some(connector);
}

pub fn connect_stream(host: &str, port: u16, ssl: bool) -> io::Result<Box<dyn NetStream>> {
    let installed = CONNECTOR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    match installed {
        Some(connector) => connector.connect(host, port, ssl),
        None => PlainConnector.connect(host, port, ssl),
    }
}

/// Connect a stream meant for downloading and size its receive buffer
/// after the configured download cap, so the kernel cannot buffer far
/// ahead of what the shaper will admit.
pub fn connect_download(host: &str, port: u16, ssl: bool) -> io::Result<Box<dyn NetStream>> {
    let sock = connect_stream(host, port, ssl)?;
    let cap = settings::max_download_speed();
    if cap != -1 && cap < settings::MAX_SPEED_RECV_BUFFER {
        let bytes = if cap == 0 {
            settings::RECV_BUFFER_SHAPED
        } else {
            cap as usize
        };
        if let Err(e) = sock.set_recv_buffer(bytes) {
            tracing::debug!("cannot size receive buffer to {}: {}", bytes, e);
        }
    }
    Ok(sock)
}

/// Restore the default send buffer on a socket the upload shaper shrank.
pub fn set_default_send_buffer(sock: &dyn NetStream) -> io::Result<()> {
    sock.set_send_buffer(settings::DEFAULT_SEND_BUFFER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_stream_probes_work() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            peer.write_all(b"ping").unwrap();
            peer.flush().unwrap();
            // Hold the socket open until the client is done probing.
            let mut sink = [0u8; 4];
            let _ = peer.read(&mut sink);
        });

        let stream = TcpNetStream::connect("127.0.0.1", addr.port()).unwrap();
        assert!(!stream.is_ssl());
        assert!(stream.writable().unwrap());
        stream.set_recv_buffer(64 * 1024).unwrap();
        stream.set_send_buffer(64 * 1024).unwrap();

        // Wait for the kernel to buffer the greeting, then probe it.
        let mut seen = 0;
        for _ in 0..50 {
            seen = stream.pending_bytes().unwrap();
            if seen > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(seen > 0);

        let mut stream = stream;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"done").unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn plain_connector_refuses_tls() {
        let err = PlainConnector.connect("localhost", 443, true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn host_with_port_overrides_default() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let host = format!("127.0.0.1:{}", addr.port());
        // Default port 1 would fail; the embedded port must win.
        let stream = TcpNetStream::connect(&host, 1);
        assert!(stream.is_ok());
    }
}
