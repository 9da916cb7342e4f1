//! Byte stream transports carrying an association.
//!
//! The state machine only needs a blocking reader and writer
//! which can also be closed
//! and probed for closure by the peer.
//! [`TcpStream`] is the plain implementation,
//! TLS streams are available with the `sync-tls` feature.
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A connected, bidirectional byte stream to the peer.
pub trait Transport: Read + Write {
    /// Shut down the connection in both directions.
    fn close(&mut self) -> std::io::Result<()>;

    /// Wait at most `timeout` for the peer to close its end.
    ///
    /// Returns `Ok(true)` if the peer has closed the connection
    /// (or the connection is otherwise gone),
    /// `Ok(false)` if nothing happened within the timeout.
    /// Any bytes received in the meantime are discarded.
    fn poll_peer_closed(&mut self, timeout: Duration) -> std::io::Result<bool>;

    /// Set the deadline for blocking reads, `None` meaning no deadline.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

/// Interpret the outcome of one read while waiting for the peer to close.
fn closed_by_peer(read: std::io::Result<usize>) -> std::io::Result<bool> {
    match read {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) => match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(false),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Ok(true),
            _ => Err(e),
        },
    }
}

/// Zero durations are not accepted as socket timeouts.
fn at_least_1ms(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

impl Transport for TcpStream {
    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn poll_peer_closed(&mut self, timeout: Duration) -> std::io::Result<bool> {
        let previous = self.read_timeout()?;
        TcpStream::set_read_timeout(self, Some(at_least_1ms(timeout)))?;
        let mut buf = [0u8; 64];
        let outcome = closed_by_peer(self.read(&mut buf));
        // restoring may fail on a socket which is already gone
        let _ = TcpStream::set_read_timeout(self, previous);
        outcome
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout.map(at_least_1ms))
    }
}

#[cfg(feature = "sync-tls")]
mod tls {
    use super::{at_least_1ms, closed_by_peer, Transport};
    use std::io::Read;
    use std::net::{Shutdown, TcpStream};
    use std::time::Duration;

    /// TLS stream of an association requester.
    pub type ClientTlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;
    /// TLS stream of an association acceptor.
    pub type ServerTlsStream = rustls::StreamOwned<rustls::ServerConnection, TcpStream>;

    macro_rules! impl_tls_transport {
        ($stream: ty) => {
            impl Transport for $stream {
                fn close(&mut self) -> std::io::Result<()> {
                    self.conn.send_close_notify();
                    // flush the alert, the socket goes down regardless
                    let _ = self.conn.complete_io(&mut self.sock);
                    self.sock.shutdown(Shutdown::Both)
                }

                fn poll_peer_closed(&mut self, timeout: Duration) -> std::io::Result<bool> {
                    let previous = self.sock.read_timeout()?;
                    self.sock.set_read_timeout(Some(at_least_1ms(timeout)))?;
                    let mut buf = [0u8; 64];
                    let outcome = closed_by_peer(self.read(&mut buf));
                    let _ = self.sock.set_read_timeout(previous);
                    outcome
                }

                fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
                    self.sock.set_read_timeout(timeout.map(at_least_1ms))
                }
            }
        };
    }

    impl_tls_transport!(ClientTlsStream);
    impl_tls_transport!(ServerTlsStream);
}

#[cfg(feature = "sync-tls")]
pub use tls::{ClientTlsStream, ServerTlsStream};
