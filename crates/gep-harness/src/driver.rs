//! Async drivers that move framed bytes between a [`Transport`] and the
//! sans-IO state machines.
//!
//! - [`PublisherHost`] accepts connections, runs one reader and one writer
//!   task per connection, and serializes every state machine call through a
//!   single lock.
//! - [`SubscriberLink`] owns one outbound connection and reconnects after a
//!   restart or a lost socket.
//!
//! Data packets go out on a [`DataChannel`] when the subscriber negotiated a
//! port and the host has a running channel, and on the command channel
//! otherwise.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use gep_core::{
    ConnectionId, ConnectionSecurity, Publisher, PublisherAction, SessionAction, Subscriber, SubscriberAction,
    env::Environment,
    transport::{DataChannel, Transport},
};
use gep_proto::{
    CommandFrame, Measurement, ProtocolError, ResponseFrame, ServerCommand,
    framing::{FrameReader, encode_framed},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};

const READ_CHUNK: usize = 8 * 1024;
const DATAGRAM_SIZE: usize = 64 * 1024;

/// Host-facing events raised by publisher sessions
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A client published measurements back to the publisher
    ClientMeasurements {
        /// Originating connection
        connection_id: ConnectionId,
        /// Decoded measurements
        measurements: Vec<Measurement>,
    },
    /// A client sent a user command that the host should answer
    UserCommand {
        /// Originating connection
        connection_id: ConnectionId,
        /// Command code
        command: ServerCommand,
        /// Raw payload
        payload: Bytes,
    },
    /// A connection closed
    Disconnected {
        /// Closed connection
        connection_id: ConnectionId,
        /// Why it closed
        reason: String,
    },
}

enum Outbound {
    Frame(ResponseFrame),
    Close,
}

fn protocol_io(err: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Frame one encoded wire frame for a stream.
fn framed(encode: impl FnOnce(&mut Vec<u8>) -> Result<(), ProtocolError>) -> io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    encode(&mut frame).map_err(protocol_io)?;
    let mut out = Vec::with_capacity(frame.len() + gep_proto::framing::PREFIX_SIZE);
    encode_framed(&frame, &mut out).map_err(protocol_io)?;
    Ok(out)
}

/// Publisher side of a simulation.
///
/// Cloning is cheap; clones share the publisher and the connection table.
pub struct PublisherHost<E: Environment> {
    env: E,
    publisher: Arc<Mutex<Publisher<E>>>,
    outboxes: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>>,
    peers: Arc<Mutex<HashMap<ConnectionId, SocketAddr>>>,
    data_channel: Option<Arc<dyn DataChannel>>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl<E: Environment> Clone for PublisherHost<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            publisher: Arc::clone(&self.publisher),
            outboxes: Arc::clone(&self.outboxes),
            peers: Arc::clone(&self.peers),
            data_channel: self.data_channel.clone(),
            events: self.events.clone(),
        }
    }
}

impl<E: Environment> PublisherHost<E> {
    /// Host for `publisher`, with the receiver of its host events.
    pub fn new(env: E, publisher: Publisher<E>) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let host = Self {
            env,
            publisher: Arc::new(Mutex::new(publisher)),
            outboxes: Arc::new(Mutex::new(HashMap::new())),
            peers: Arc::new(Mutex::new(HashMap::new())),
            data_channel: None,
            events,
        };
        (host, rx)
    }

    /// Send data packets over `channel` to subscribers that asked for one.
    #[must_use]
    pub fn with_data_channel(mut self, channel: impl DataChannel) -> Self {
        self.data_channel = Some(Arc::new(channel));
        self
    }

    fn publisher(&self) -> MutexGuard<'_, Publisher<E>> {
        // A panic while holding the lock already failed the simulation.
        self.publisher.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.publisher().connection_count()
    }

    /// Accept connections until the transport fails.
    ///
    /// Every connection gets a clone of `security`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when accepting fails.
    pub async fn serve<T: Transport>(&self, transport: T, security: ConnectionSecurity) -> io::Result<()> {
        loop {
            let (send, recv, peer) = transport.accept().await?;
            let id = self.publisher().accept(security.clone());
            tracing::info!(connection_id = %id, %peer, "client connected");

            let (tx, rx) = mpsc::unbounded_channel();
            self.outboxes.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, tx);
            self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, peer);

            let writer = self.clone();
            tokio::spawn(async move { writer.write_loop(id, send, rx).await });
            let reader = self.clone();
            tokio::spawn(async move { reader.read_loop(id, recv).await });
        }
    }

    /// Publish one measurement batch to every subscriber.
    pub fn publish(&self, measurements: &[Measurement]) {
        let actions = self.publisher().publish(measurements, self.env.now());
        self.dispatch(actions);
    }

    /// Notify every connection.
    pub fn notify_all(&self, text: &str) {
        let actions = self.publisher().notify_all(text);
        self.dispatch(actions);
    }

    /// Answer a user command.
    pub fn user_response(&self, id: ConnectionId, command: ServerCommand, payload: Bytes) {
        let result = self.publisher().user_response(id, command, payload);
        match result {
            Ok(actions) => self.dispatch(actions),
            Err(err) => tracing::warn!(connection_id = %id, %err, "user response rejected"),
        }
    }

    /// Drive publisher timers every `period` until the task is dropped.
    pub async fn run_timers(&self, period: Duration) {
        loop {
            self.env.sleep(period).await;
            let actions = self.publisher().tick(self.env.now());
            self.dispatch(actions);
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(&self, id: ConnectionId, mut recv: R) {
        let reason = match self.pump_commands(id, &mut recv).await {
            Ok(()) => "client closed connection".to_string(),
            Err(err) => format!("command channel failed: {err}"),
        };
        let actions = self.publisher().disconnect(id, &reason);
        self.dispatch(actions);
    }

    async fn pump_commands<R: AsyncRead + Unpin>(&self, id: ConnectionId, recv: &mut R) -> io::Result<()> {
        let mut reader = FrameReader::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = recv.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            reader.extend(&buf[..n]);

            while let Some(bytes) = reader.next_frame().map_err(protocol_io)? {
                let frame = CommandFrame::decode(&bytes).map_err(protocol_io)?;
                let result = self.publisher().handle_frame(id, &frame, self.env.now());
                match result {
                    Ok(actions) => self.dispatch(actions),
                    // The session is gone; nothing left to read for.
                    Err(err) => return Err(io::Error::new(io::ErrorKind::NotConnected, err)),
                }
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        &self,
        id: ConnectionId,
        mut send: W,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Frame(frame) => frame,
                Outbound::Close => break,
            };
            let result = match framed(|out| frame.encode(out)) {
                Ok(bytes) => send.write_all(&bytes).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                let actions = self.publisher().handle_send_error(id, &err);
                self.dispatch(actions);
            }
        }
        let _ = send.shutdown().await;
    }

    fn dispatch(&self, actions: Vec<PublisherAction>) {
        for PublisherAction { connection_id, action } in actions {
            match action {
                SessionAction::SendData { data_channel: Some(port), frame }
                    if self.data_channel.as_ref().is_some_and(|channel| channel.is_running()) =>
                {
                    self.send_datagram(connection_id, port, frame);
                },
                SessionAction::SendFrame(frame) | SessionAction::SendData { frame, .. } => {
                    self.enqueue(connection_id, Outbound::Frame(frame));
                },
                SessionAction::Disconnect { reason } => {
                    tracing::info!(%connection_id, %reason, "closing connection");
                    self.enqueue(connection_id, Outbound::Close);
                    self.outboxes.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&connection_id);
                    self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&connection_id);
                    let _ = self.events.send(HostEvent::Disconnected { connection_id, reason });
                },
                SessionAction::ClientMeasurements(measurements) => {
                    let _ = self.events.send(HostEvent::ClientMeasurements { connection_id, measurements });
                },
                SessionAction::UserCommand { command, payload } => {
                    let _ = self.events.send(HostEvent::UserCommand { connection_id, command, payload });
                },
            }
        }
    }

    /// One response frame per datagram, addressed to the client's IP and the
    /// port it asked for.
    fn send_datagram(&self, id: ConnectionId, port: u16, frame: ResponseFrame) {
        let peer = self.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&id).copied();
        let (Some(channel), Some(peer)) = (self.data_channel.clone(), peer) else {
            self.enqueue(id, Outbound::Frame(frame));
            return;
        };
        let target = SocketAddr::new(peer.ip(), port);
        let host = self.clone();
        tokio::spawn(async move {
            let mut datagram = Vec::new();
            let result = match frame.encode(&mut datagram) {
                Ok(()) => channel.send_to(&datagram, target).await.map(drop),
                Err(err) => Err(protocol_io(err)),
            };
            if let Err(err) = result {
                tracing::debug!(connection_id = %id, %target, %err, "data channel send failed");
                let actions = host.publisher().handle_send_error(id, &err);
                host.dispatch(actions);
            }
        });
    }

    fn enqueue(&self, id: ConnectionId, outbound: Outbound) {
        let outboxes = self.outboxes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = outboxes.get(&id) {
            // A closed writer means the connection is already going away.
            let _ = tx.send(outbound);
        }
    }
}

enum Step {
    Read(io::Result<usize>),
    Datagram(io::Result<usize>),
    Tick,
}

async fn recv_datagram(channel: Option<&dyn DataChannel>, buf: &mut [u8]) -> io::Result<usize> {
    match channel {
        Some(channel) => channel.recv_from(buf).await.map(|(n, _)| n),
        None => std::future::pending().await,
    }
}

/// Subscriber side of a simulation: one connection to one publisher.
///
/// Commands produced by the subscriber are written immediately. Everything
/// else is handed to the caller through [`SubscriberLink::next_event`].
pub struct SubscriberLink<E: Environment, T: Transport> {
    env: E,
    subscriber: Subscriber<E>,
    transport: T,
    remote: SocketAddr,
    streams: Option<(T::SendStream, T::RecvStream)>,
    reader: FrameReader,
    data: Option<Arc<dyn DataChannel>>,
    datagram: Vec<u8>,
    ticker: Interval,
    retry_delay: Duration,
    pending: VecDeque<SubscriberAction>,
    connections: usize,
}

impl<E: Environment, T: Transport> SubscriberLink<E, T> {
    /// Link that will connect `subscriber` to `remote`.
    ///
    /// `tick_interval` drives data-loss detection; `retry_delay` is the
    /// pause before every reconnect attempt.
    pub fn new(
        env: E,
        subscriber: Subscriber<E>,
        transport: T,
        remote: SocketAddr,
        tick_interval: Duration,
        retry_delay: Duration,
    ) -> Self {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            env,
            subscriber,
            transport,
            remote,
            streams: None,
            reader: FrameReader::new(),
            data: None,
            datagram: Vec::new(),
            ticker,
            retry_delay,
            pending: VecDeque::new(),
            connections: 0,
        }
    }

    /// Also read data packets from `channel`.
    ///
    /// The subscription settings should carry the channel's port so the
    /// publisher knows where to send.
    #[must_use]
    pub fn with_data_channel(mut self, channel: impl DataChannel) -> Self {
        self.data = Some(Arc::new(channel));
        self.datagram = vec![0u8; DATAGRAM_SIZE];
        self
    }

    /// The wrapped state machine
    pub fn subscriber(&self) -> &Subscriber<E> {
        &self.subscriber
    }

    /// Successful connection attempts so far
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Open the connection and send the connect sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot connect or the connect
    /// sequence cannot be built.
    pub async fn connect(&mut self) -> io::Result<()> {
        let (send, recv) = self.transport.connect(self.remote).await?;
        self.streams = Some((send, recv));
        self.reader = FrameReader::new();
        self.connections += 1;
        tracing::info!(remote = %self.remote, attempt = self.connections, "connected to publisher");

        let actions = self
            .subscriber
            .connect(self.env.now())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.apply(actions).await
    }

    /// Send one command produced by a subscriber helper.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is not connected or the write fails.
    pub async fn send(&mut self, action: SubscriberAction) -> io::Result<()> {
        self.apply(vec![action]).await
    }

    /// Resubscribe with new settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be built or written.
    pub async fn resubscribe(
        &mut self,
        settings: gep_core::SubscriptionSettings,
        flags: gep_proto::DataPacketFlags,
    ) -> io::Result<()> {
        let action = self
            .subscriber
            .resubscribe(settings, flags)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.send(action).await
    }

    /// Next event that is not an outbound command.
    ///
    /// A restart or a lost connection is reported as
    /// [`SubscriberAction::Restart`] after the link reconnected.
    ///
    /// # Errors
    ///
    /// Returns an error only when reconnecting fails.
    pub async fn next_event(&mut self) -> io::Result<SubscriberAction> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let SubscriberAction::Restart { ref reason } = event {
                    tracing::warn!(%reason, "subscriber restarting connection cycle");
                    self.reconnect().await?;
                }
                return Ok(event);
            }

            if self.streams.is_none() {
                self.reconnect().await?;
                continue;
            }
            let Some((_, recv)) = self.streams.as_mut() else {
                continue;
            };

            let mut buf = [0u8; READ_CHUNK];
            let data = self.data.as_deref();
            let step = tokio::select! {
                read = recv.read(&mut buf) => Step::Read(read),
                received = recv_datagram(data, &mut self.datagram) => Step::Datagram(received),
                _ = self.ticker.tick() => Step::Tick,
            };

            let actions = match step {
                Step::Tick => self.subscriber.tick(self.env.now()),
                Step::Datagram(Ok(n)) => match ResponseFrame::decode(&self.datagram[..n]) {
                    Ok(frame) => self.subscriber.handle_response(&frame, self.env.now()),
                    Err(err) => {
                        tracing::warn!(%err, "dropping undecodable datagram");
                        Vec::new()
                    },
                },
                Step::Datagram(Err(err)) => {
                    tracing::warn!(%err, "data channel receive failed");
                    Vec::new()
                },
                Step::Read(Ok(n)) if n > 0 => {
                    self.reader.extend(&buf[..n]);
                    self.drain_frames()
                },
                Step::Read(result) => {
                    let reason = match result {
                        Ok(_) => "publisher closed connection".to_string(),
                        Err(err) => format!("command channel failed: {err}"),
                    };
                    self.subscriber.disconnected();
                    self.streams = None;
                    vec![SubscriberAction::Restart { reason }]
                },
            };
            self.apply(actions).await?;
        }
    }

    fn drain_frames(&mut self) -> Vec<SubscriberAction> {
        let mut actions = Vec::new();
        loop {
            match self.reader.next_frame() {
                Ok(Some(bytes)) => match ResponseFrame::decode(&bytes) {
                    Ok(frame) => actions.extend(self.subscriber.handle_response(&frame, self.env.now())),
                    Err(err) => tracing::warn!(%err, "dropping undecodable response frame"),
                },
                Ok(None) => return actions,
                Err(err) => {
                    // Lost framing; the stream cannot be resynchronized.
                    self.subscriber.disconnected();
                    self.streams = None;
                    actions.push(SubscriberAction::Restart { reason: format!("stream framing lost: {err}") });
                    return actions;
                },
            }
        }
    }

    async fn apply(&mut self, actions: Vec<SubscriberAction>) -> io::Result<()> {
        for action in actions {
            match action {
                SubscriberAction::SendCommand(frame) => {
                    let bytes = framed(|out| frame.encode(out))?;
                    let Some((send, _)) = self.streams.as_mut() else {
                        return Err(io::Error::new(io::ErrorKind::NotConnected, "subscriber link is down"));
                    };
                    if let Err(err) = send.write_all(&bytes).await {
                        self.subscriber.disconnected();
                        self.streams = None;
                        self.pending.push_back(SubscriberAction::Restart {
                            reason: format!("command channel failed: {err}"),
                        });
                        return Ok(());
                    }
                },
                other => self.pending.push_back(other),
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        self.streams = None;
        self.env.sleep(self.retry_delay).await;
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_prefixes_marker_and_length() {
        let frame = CommandFrame::new(ServerCommand::ConfirmBufferBlock, vec![0, 0, 0, 7]);
        let bytes = framed(|out| frame.encode(out)).unwrap();

        assert_eq!(&bytes[..4], &gep_proto::framing::MARKER);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 5);
        assert_eq!(&bytes[8..], &[0x08, 0, 0, 0, 7]);
    }
}
