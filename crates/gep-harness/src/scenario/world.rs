//! World state for scenario execution.
//!
//! The World owns one publisher with a single subscriber connection and the
//! two byte pipes between them. Every frame crosses the pipes in its framed
//! wire form, so scenarios exercise encoding, stream framing and decoding as
//! well as the state machines.
//!
//! Everything the subscriber surfaces is recorded for oracles.

use bytes::Bytes;
use gep_core::{
    ConnectionId, ConnectionSecurity, Environment, Publisher, PublisherAction, Session, SessionAction, Subscriber,
    SubscriberAction,
};
use gep_proto::{
    CommandFrame, Measurement, ResponseFrame,
    framing::{FrameReader, encode_framed},
};

use crate::scenario::clock::ManualEnv;

// Bound on frames moved by one pump; a livelock fails the scenario instead
// of hanging it.
const MAX_PUMP_FRAMES: usize = 100_000;

/// World state: one publisher, one subscriber, and everything observed.
pub struct World {
    env: ManualEnv,
    publisher: Publisher<ManualEnv>,
    subscriber: Subscriber<ManualEnv>,
    security: ConnectionSecurity,
    connection: ConnectionId,
    to_publisher: FrameReader,
    to_subscriber: FrameReader,
    commands_sent: usize,
    responses_sent: usize,
    measurements: Vec<Measurement>,
    buffer_blocks: Vec<(u32, Bytes)>,
    notifications: Vec<String>,
    failures: Vec<String>,
    restarts: Vec<String>,
    client_measurements: Vec<Measurement>,
    publisher_disconnects: usize,
}

impl World {
    pub(crate) fn new(
        env: ManualEnv,
        mut publisher: Publisher<ManualEnv>,
        subscriber: Subscriber<ManualEnv>,
        security: ConnectionSecurity,
    ) -> Self {
        let connection = publisher.accept(security.clone());
        Self {
            env,
            publisher,
            subscriber,
            security,
            connection,
            to_publisher: FrameReader::new(),
            to_subscriber: FrameReader::new(),
            commands_sent: 0,
            responses_sent: 0,
            measurements: Vec::new(),
            buffer_blocks: Vec::new(),
            notifications: Vec::new(),
            failures: Vec::new(),
            restarts: Vec::new(),
            client_measurements: Vec::new(),
            publisher_disconnects: 0,
        }
    }

    /// Scenario clock
    pub fn env(&self) -> &ManualEnv {
        &self.env
    }

    /// The subscriber state machine
    pub fn subscriber(&self) -> &Subscriber<ManualEnv> {
        &self.subscriber
    }

    pub(crate) fn subscriber_mut(&mut self) -> &mut Subscriber<ManualEnv> {
        &mut self.subscriber
    }

    /// The publisher state machine
    pub fn publisher(&self) -> &Publisher<ManualEnv> {
        &self.publisher
    }

    pub(crate) fn publisher_mut(&mut self) -> &mut Publisher<ManualEnv> {
        &mut self.publisher
    }

    /// Current connection id
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Publisher session of the current connection, if still open
    pub fn session(&self) -> Option<&Session<ManualEnv>> {
        self.publisher.session(self.connection)
    }

    /// Commands written by the subscriber
    pub fn commands_sent(&self) -> usize {
        self.commands_sent
    }

    /// Responses written by the publisher
    pub fn responses_sent(&self) -> usize {
        self.responses_sent
    }

    /// Measurements delivered to the subscriber, in delivery order
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Buffer blocks delivered to the subscriber, in delivery order
    pub fn buffer_blocks(&self) -> &[(u32, Bytes)] {
        &self.buffer_blocks
    }

    /// Notifications delivered to the subscriber
    pub fn notifications(&self) -> &[String] {
        &self.notifications
    }

    /// Failure messages the subscriber received
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Reasons of every subscriber restart
    pub fn restarts(&self) -> &[String] {
        &self.restarts
    }

    /// Measurements the subscriber published back
    pub fn client_measurements(&self) -> &[Measurement] {
        &self.client_measurements
    }

    /// Connections the publisher closed
    pub fn publisher_disconnects(&self) -> usize {
        self.publisher_disconnects
    }

    /// Handle subscriber output: commands go on the wire, the rest is
    /// recorded. A restart reconnects on a fresh publisher connection.
    pub(crate) fn route_subscriber(&mut self, actions: Vec<SubscriberAction>) -> Result<(), String> {
        for action in actions {
            match action {
                SubscriberAction::SendCommand(frame) => self.send_command(&frame)?,
                SubscriberAction::Measurements(batch) => self.measurements.extend(batch),
                SubscriberAction::BufferBlock { sequence, data, .. } => self.buffer_blocks.push((sequence, data)),
                SubscriberAction::Notification(text) => self.notifications.push(text),
                SubscriberAction::CommandFailed { message, .. } => self.failures.push(message),
                SubscriberAction::Restart { reason } => {
                    self.restarts.push(reason);
                    self.reconnect()?;
                },
                _ => {},
            }
        }
        Ok(())
    }

    /// Handle publisher output for the current connection.
    pub(crate) fn route_publisher(&mut self, actions: Vec<PublisherAction>) -> Result<(), String> {
        for PublisherAction { connection_id, action } in actions {
            if connection_id != self.connection {
                continue;
            }
            match action {
                SessionAction::SendFrame(frame) | SessionAction::SendData { frame, .. } => {
                    self.send_response(&frame)?;
                },
                SessionAction::Disconnect { .. } => self.publisher_disconnects += 1,
                SessionAction::ClientMeasurements(batch) => self.client_measurements.extend(batch),
                SessionAction::UserCommand { .. } => {},
            }
        }
        Ok(())
    }

    /// Move frames across both pipes until neither side has anything left.
    pub(crate) fn pump(&mut self) -> Result<(), String> {
        for _ in 0..MAX_PUMP_FRAMES {
            if let Some(bytes) = self.to_publisher.next_frame().map_err(|e| format!("command stream: {e}"))? {
                let frame = CommandFrame::decode(&bytes).map_err(|e| format!("command decode: {e}"))?;
                let now = self.env.now();
                match self.publisher.handle_frame(self.connection, &frame, now) {
                    Ok(actions) => self.route_publisher(actions)?,
                    // Command raced a disconnect; the bytes go nowhere.
                    Err(err) => tracing::debug!(%err, "command for closed connection dropped"),
                }
                continue;
            }

            if let Some(bytes) = self.to_subscriber.next_frame().map_err(|e| format!("response stream: {e}"))? {
                let frame = ResponseFrame::decode(&bytes).map_err(|e| format!("response decode: {e}"))?;
                let now = self.env.now();
                let actions = self.subscriber.handle_response(&frame, now);
                self.route_subscriber(actions)?;
                continue;
            }

            return Ok(());
        }
        Err("pump did not settle".to_string())
    }

    fn send_command(&mut self, frame: &CommandFrame) -> Result<(), String> {
        let mut encoded = Vec::new();
        frame.encode(&mut encoded).map_err(|e| format!("command encode: {e}"))?;
        let mut framed = Vec::new();
        encode_framed(&encoded, &mut framed).map_err(|e| format!("command framing: {e}"))?;
        self.to_publisher.extend(&framed);
        self.commands_sent += 1;
        Ok(())
    }

    fn send_response(&mut self, frame: &ResponseFrame) -> Result<(), String> {
        let mut encoded = Vec::new();
        frame.encode(&mut encoded).map_err(|e| format!("response encode: {e}"))?;
        let mut framed = Vec::new();
        encode_framed(&encoded, &mut framed).map_err(|e| format!("response framing: {e}"))?;
        self.to_subscriber.extend(&framed);
        self.responses_sent += 1;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), String> {
        let closed = self.publisher.disconnect(self.connection, "subscriber restarted");
        self.route_publisher(closed)?;

        self.to_publisher = FrameReader::new();
        self.to_subscriber = FrameReader::new();
        self.connection = self.publisher.accept(self.security.clone());

        let now = self.env.now();
        let actions = self.subscriber.connect(now).map_err(|e| format!("reconnect failed: {e}"))?;
        self.route_subscriber(actions)
    }
}
