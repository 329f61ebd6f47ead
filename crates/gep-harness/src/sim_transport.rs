//! Command and data channels over Turmoil's simulated network.
//!
//! The command channel is a TCP stream; the optional data channel is a UDP
//! socket. Turmoil decides delivery order and timing for both and can drop,
//! delay or partition them.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use gep_core::transport::{DataChannel, Transport};
use tokio::io::{ReadHalf, WriteHalf};
use turmoil::net::{TcpListener, TcpStream, UdpSocket};

/// Command channel transport for a simulated host.
pub struct SimTransport {
    listener: Option<TcpListener>,
}

impl SimTransport {
    /// Binds to the specified address for accepting connections.
    ///
    /// # Errors
    ///
    /// Returns error if the address is already in use or malformed.
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener: Some(listener) })
    }

    /// Transport that only connects out.
    #[must_use]
    pub fn client() -> Self {
        Self { listener: None }
    }
}

#[async_trait]
impl Transport for SimTransport {
    type SendStream = WriteHalf<TcpStream>;
    type RecvStream = ReadHalf<TcpStream>;

    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream, SocketAddr)> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "client transport cannot accept"))?;
        let (stream, peer) = listener.accept().await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv, peer))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let stream = TcpStream::connect(remote).await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }
}

/// Connectionless data channel on a simulated UDP socket.
pub struct SimDataChannel {
    socket: UdpSocket,
    running: AtomicBool,
}

impl SimDataChannel {
    /// Bind the socket.
    ///
    /// # Errors
    ///
    /// Returns error if the address is already in use or malformed.
    pub async fn bind(address: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self { socket, running: AtomicBool::new(true) })
    }

    /// Stop sending; publishers fall back to the command channel.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl DataChannel for SimDataChannel {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
