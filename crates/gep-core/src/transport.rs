//! Transport abstraction for network I/O.
//!
//! The session engine never touches sockets. Drivers move bytes between a
//! [`Transport`] and the state machines:
//!
//! - **Command channel** (required): a reliable, ordered byte stream carrying
//!   framed commands and responses. TCP in production, Turmoil's TCP in
//!   simulation.
//! - **Data channel** (optional): a connectionless [`DataChannel`] that only
//!   carries data packets for subscriptions that negotiated one. When it is
//!   not running, packets fall back to the command channel.
//!
//! Send failures are sorted by [`classify_fault`] so a reset socket leads to
//! one quiet disconnect instead of a warning per packet.

use std::{
    error::Error,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Abstract transport for reliable, ordered byte streams.
///
/// # Implementations
///
/// - **`TcpTransport`** (host): `tokio::net` listener and streams
/// - **`SimTransport`** (gep-harness): Turmoil's deterministic TCP
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Type of stream for sending data.
    type SendStream: AsyncWrite + Unpin + Send + 'static;

    /// Type of stream for receiving data.
    type RecvStream: AsyncRead + Unpin + Send + 'static;

    /// Accepts an incoming connection, returning its halves and peer address.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the listener is closed or the network
    /// fails.
    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream, SocketAddr)>;

    /// Connects to a remote endpoint, returning send/receive streams.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the remote endpoint is unreachable or
    /// refuses the connection.
    async fn connect(&self, remote: SocketAddr) -> io::Result<(Self::SendStream, Self::RecvStream)>;
}

/// Connectionless channel for data packets.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    /// Send one datagram to `target`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the datagram cannot be sent.
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram into `buf`, returning its length and sender.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the socket fails.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Whether the channel can currently send
    fn is_running(&self) -> bool;
}

/// How a send failure affects the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Socket was aborted or reset; disconnect the client
    Disconnect,
    /// Socket is half-closed; stop sending to this client
    ClientGone,
    /// Anything else; log and carry on
    Warning,
}

const WSAECONNABORTED: i32 = 10053;
const WSAECONNRESET: i32 = 10054;

/// Classify a transport error by walking its `source()` chain.
///
/// The first `io::Error` found in the chain decides.
#[must_use]
pub fn classify_fault(err: &(dyn Error + 'static)) -> FaultClass {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);

    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(io_err.raw_os_error(), Some(WSAECONNABORTED | WSAECONNRESET)) {
                return FaultClass::Disconnect;
            }
            match io_err.kind() {
                io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                    return FaultClass::Disconnect;
                },
                io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => return FaultClass::ClientGone,
                _ => {},
            }
            // An io::Error may wrap the real cause.
            if let Some(inner) = io_err.get_ref() {
                current = Some(inner as &(dyn Error + 'static));
                continue;
            }
        }
        current = err.source();
    }

    FaultClass::Warning
}

/// Single-shot disconnect latch.
///
/// The transport's close callback and a failing send can both decide to
/// disconnect the same client; only the first caller proceeds.
#[derive(Debug, Default)]
pub struct DisconnectGuard {
    fired: AtomicBool,
}

impl DisconnectGuard {
    /// Armed guard
    #[must_use]
    pub const fn new() -> Self {
        Self { fired: AtomicBool::new(false) }
    }

    /// Returns true exactly once.
    pub fn trigger(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    /// Whether the guard already fired
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, sync::Arc, thread};

    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "send failed")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn resets_disconnect() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_fault(&err), FaultClass::Disconnect);

        let err = io::Error::from_raw_os_error(WSAECONNABORTED);
        assert_eq!(classify_fault(&err), FaultClass::Disconnect);
    }

    #[test]
    fn nested_causes_are_found() {
        let err = Wrapped(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert_eq!(classify_fault(&err), FaultClass::Disconnect);

        let inner = io::Error::new(io::ErrorKind::Other, Wrapped(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert_eq!(classify_fault(&inner), FaultClass::ClientGone);
    }

    #[test]
    fn other_errors_warn() {
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_fault(&err), FaultClass::Warning);
        assert_eq!(classify_fault(&Wrapped(io::Error::from(io::ErrorKind::NotConnected))), FaultClass::ClientGone);
    }

    #[test]
    fn guard_fires_once_across_threads() {
        let guard = Arc::new(DisconnectGuard::new());
        let winners: usize = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                thread::spawn(move || guard.trigger())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert!(guard.is_triggered());
    }
}
