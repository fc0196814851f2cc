//! TCP connection wrapper for mio-based I/O.
//!
//! Provides a thin wrapper around [`mio::net::TcpStream`] with non-blocking
//! connect/read/write and integration with mio's polling infrastructure.

use std::io::{self, ErrorKind, Read, Write};

use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking TCP connection.
///
/// Wraps a mio TCP stream and provides methods for establishing the
/// connection and transferring bytes without blocking. The stream is
/// non-blocking; use with mio's [`Poll`] for readiness notification.
///
/// [`Poll`]: mio::Poll
pub struct Connection {
    inner: MioTcpStream,
    /// Set once the connect handshake has been observed complete.
    established: bool,
}

impl Connection {
    /// Starts a non-blocking connect to the given endpoint.
    ///
    /// The connection is usually still in progress when this returns; poll
    /// for writability and call [`try_finish_connect`] to complete it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect cannot be initiated at all
    /// (e.g., no route, address family unsupported).
    ///
    /// [`try_finish_connect`]: Connection::try_finish_connect
    pub fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpStream::connect(endpoint.into())?;
        Ok(Self {
            inner,
            established: false,
        })
    }

    /// Returns the local address of this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Checks whether the in-progress connect has completed.
    ///
    /// Returns `Ok(true)` once the connection is established, `Ok(false)`
    /// while the handshake is still in progress.
    ///
    /// # Errors
    ///
    /// Returns the connect error if the handshake failed.
    pub fn try_finish_connect(&mut self) -> io::Result<bool> {
        if self.established {
            return Ok(true);
        }
        // A failed non-blocking connect surfaces through SO_ERROR.
        if let Some(err) = self.inner.take_error()? {
            return Err(err);
        }
        match self.inner.peer_addr() {
            Ok(_) => {
                self.established = true;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(115) => Ok(false), // EINPROGRESS
            Err(e) => Err(e),
        }
    }

    /// Returns `true` if the connect handshake has been observed complete.
    #[must_use]
    pub const fn is_established(&self) -> bool {
        self.established
    }

    /// Attempts one non-blocking read, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// `Ok(Some(0))` means the peer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inner.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts one non-blocking write, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.inner.write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for Connection {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = Connection::connect(Endpoint::from(addr)).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        // Loopback connects settle quickly; spin briefly.
        let mut established = false;
        for _ in 0..100 {
            if conn.try_finish_connect().unwrap() {
                established = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(established);
        assert!(conn.is_established());
    }

    #[test]
    fn try_read_empty_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = Connection::connect(Endpoint::from(addr)).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        while !conn.try_finish_connect().unwrap() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let mut buf = [0u8; 16];
        assert!(conn.try_read(&mut buf).unwrap().is_none());
    }

    #[test]
    fn read_observes_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = Connection::connect(Endpoint::from(addr)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        while !conn.try_finish_connect().unwrap() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        drop(peer);

        let mut buf = [0u8; 16];
        // EOF may take a moment to propagate through loopback.
        for _ in 0..100 {
            match conn.try_read(&mut buf).unwrap() {
                Some(0) => return,
                Some(_) => panic!("unexpected data"),
                None => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        panic!("never observed EOF");
    }
}
