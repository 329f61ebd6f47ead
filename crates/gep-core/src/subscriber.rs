//! Subscriber-side state machine.
//!
//! The client half of a session: negotiates, authenticates and subscribes on
//! connect, then turns response frames into [`SubscriberAction`]s for the
//! host. Every parse fault is counted in a sliding window, and silence on
//! the data stream is watched by a data-loss monitor. Either one firing
//! yields [`SubscriberAction::Restart`]; the driver reconnects and calls
//! [`Subscriber::connect`] again.

use std::sync::Arc;

use bytes::Bytes;
use gep_proto::{
    BaseTimeOffsets, Command, CommandFrame, CompactContext, DataPacketFlags, Measurement, ProtocolError,
    ResponseFrame, SecurityMode, ServerCommand, ServerResponse, SignalId, SignalIndexCache, TextEncoding, Ticks,
    payloads::{
        AuthenticateRequest, BufferBlock, MetadataRefreshRequest, Notification, SubscribeRequest,
        response::decode_start_time,
    },
};

use crate::{
    auth::build_auth_token,
    buffer_block::BufferBlockReceiver,
    cipher::{CipherKeys, SharedSecret},
    compression::{DEFAULT_DECOMPRESS_LIMIT, DeflateStreamCodec, gzip_decompress},
    config::{SubscriberConfig, SubscriptionSettings},
    data_packet::DataPacketDecoder,
    env::Environment,
    error::{CompressionError, SessionError},
    monitor::{DataLossMonitor, ParseErrorWindow},
    signal_index::{ActiveSignalIndex, decode_cache_payload},
};

/// Subscriber life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// No connection
    Disconnected,
    /// Connect commands sent, waiting for the subscribe reply
    Subscribing,
    /// Publisher confirmed the subscription
    Subscribed,
    /// Subscription dropped on request
    Unsubscribed,
}

/// Actions returned by the subscriber state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberAction {
    /// Write the command to the command channel
    SendCommand(CommandFrame),
    /// Decoded measurements, in packet order
    Measurements(Vec<Measurement>),
    /// Buffer block delivered in sequence order
    BufferBlock {
        /// Block sequence
        sequence: u32,
        /// Signal the block belongs to, if the cache knows its index
        signal_id: Option<SignalId>,
        /// Raw block bytes
        data: Bytes,
    },
    /// A new signal index cache was installed
    SignalIndexCacheUpdated {
        /// Signals the publisher will send
        signals: usize,
        /// Requested signals the publisher refused
        denied: usize,
    },
    /// Catalog snapshot from `MetaDataRefresh`, decompressed
    Metadata(Bytes),
    /// Publisher notification text
    Notification(String),
    /// Timestamp of the first measurement after subscribing
    DataStartTime(Ticks),
    /// Temporal replay finished
    ProcessingComplete(String),
    /// Publisher configuration changed
    ConfigurationChanged,
    /// A command succeeded
    CommandSucceeded {
        /// Command answered
        command: ServerCommand,
        /// Response text
        message: String,
    },
    /// A command failed
    CommandFailed {
        /// Raw code of the command answered
        code: u8,
        /// Response text
        message: String,
    },
    /// Reply to a user command
    UserResponse {
        /// Response code
        response: ServerResponse,
        /// Command answered
        in_reply_to: u8,
        /// Raw payload
        payload: Bytes,
    },
    /// Tear down and reconnect
    Restart {
        /// Why the connection cycle restarts
        reason: String,
    },
}

/// Client side of one publisher connection
pub struct Subscriber<E: Environment> {
    env: E,
    config: SubscriberConfig,
    settings: SubscriptionSettings,
    flags: DataPacketFlags,
    shared_secret: Option<SharedSecret>,
    state: SubscriberState,
    authenticated: bool,
    signal_index: ActiveSignalIndex,
    keys: Option<Arc<CipherKeys>>,
    base_times: Option<BaseTimeOffsets>,
    decoder: DataPacketDecoder,
    buffer_blocks: BufferBlockReceiver,
    data_loss: DataLossMonitor<E::Instant>,
    parse_errors: ParseErrorWindow<E::Instant>,
    resubscribing: bool,
    start_time: Option<Ticks>,
}

impl<E: Environment> std::fmt::Debug for Subscriber<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .field("flags", &self.flags)
            .field("has_keys", &self.keys.is_some())
            .field("base_times", &self.base_times)
            .field("parse_errors", &self.parse_errors.count())
            .finish_non_exhaustive()
    }
}

impl<E: Environment> Subscriber<E> {
    /// Subscriber for `settings`, requesting the delivery described by
    /// `flags` (`COMPACT` and/or `SYNCHRONIZED`).
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the shared secret cannot be derived.
    pub fn new(
        env: E,
        config: SubscriberConfig,
        settings: SubscriptionSettings,
        flags: DataPacketFlags,
    ) -> Result<Self, SessionError> {
        let shared_secret = config.shared_secret.as_deref().map(SharedSecret::derive).transpose()?;
        Ok(Self {
            buffer_blocks: BufferBlockReceiver::new(config.max_pending_buffer_blocks),
            data_loss: DataLossMonitor::new(config.data_loss_interval),
            parse_errors: ParseErrorWindow::new(config.allowed_parsing_exceptions, config.parsing_exception_window),
            env,
            config,
            settings,
            flags: flags & (DataPacketFlags::COMPACT | DataPacketFlags::SYNCHRONIZED),
            shared_secret,
            state: SubscriberState::Disconnected,
            authenticated: false,
            signal_index: ActiveSignalIndex::new(),
            keys: None,
            base_times: None,
            decoder: DataPacketDecoder::new(Box::new(DeflateStreamCodec::new())),
            resubscribing: false,
            start_time: None,
        })
    }

    /// Current state
    pub const fn state(&self) -> SubscriberState {
        self.state
    }

    /// Whether the publisher accepted `Authenticate`
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Text encoding negotiated on connect
    pub const fn encoding(&self) -> TextEncoding {
        self.config.operational_modes.encoding()
    }

    /// Active signal index cache
    pub fn signal_index(&self) -> Option<Arc<SignalIndexCache>> {
        self.signal_index.load()
    }

    /// Installed cipher keys
    pub fn cipher_keys(&self) -> Option<&CipherKeys> {
        self.keys.as_deref()
    }

    /// Start time reported for the current subscription
    pub const fn start_time(&self) -> Option<Ticks> {
        self.start_time
    }

    /// Faults inside the current parse window
    pub fn parse_error_count(&self) -> usize {
        self.parse_errors.count()
    }

    /// Commands that open a session: operational modes, authentication
    /// when the publisher requires a token, then the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if Gateway credentials are missing or a command
    /// cannot be encoded.
    pub fn connect(&mut self, now: E::Instant) -> Result<Vec<SubscriberAction>, SessionError> {
        self.reset_connection_state();

        let modes = self.config.operational_modes;
        let mut actions =
            vec![SubscriberAction::SendCommand(Command::DefineOperationalModes(modes).into_frame(self.encoding())?)];

        if self.config.security_mode == SecurityMode::Gateway {
            let secret = self.shared_secret.as_ref().ok_or(SessionError::InvalidState {
                state: "missing shared secret",
                operation: "authenticate",
            })?;
            let auth_key = self.config.auth_key.as_deref().ok_or(SessionError::InvalidState {
                state: "missing auth key",
                operation: "authenticate",
            })?;
            let token = build_auth_token(&self.env, secret, auth_key, self.encoding())?;
            actions.push(self.command(Command::Authenticate(AuthenticateRequest { token }))?);
        }

        actions.push(self.subscribe_command()?);
        self.state = SubscriberState::Subscribing;
        self.data_loss.arm(now);
        tracing::debug!(modes = modes.to_u32(), security = ?self.config.security_mode, "connecting");
        Ok(actions)
    }

    /// Change the subscription and send it.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be encoded.
    pub fn resubscribe(
        &mut self,
        settings: SubscriptionSettings,
        flags: DataPacketFlags,
    ) -> Result<SubscriberAction, SessionError> {
        self.settings = settings;
        self.flags = flags & (DataPacketFlags::COMPACT | DataPacketFlags::SYNCHRONIZED);
        self.decoder.reset();
        self.buffer_blocks.reset();
        self.start_time = None;
        self.state = SubscriberState::Subscribing;
        self.subscribe_command()
    }

    /// Drop the subscription, keeping the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be encoded.
    pub fn unsubscribe(&mut self) -> Result<SubscriberAction, SessionError> {
        self.state = SubscriberState::Unsubscribed;
        self.data_loss.disarm();
        self.command(Command::Unsubscribe)
    }

    /// Ask the publisher for its catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be encoded.
    pub fn refresh_metadata(&self, filter: Option<String>) -> Result<SubscriberAction, SessionError> {
        self.command(Command::MetaDataRefresh(MetadataRefreshRequest { filter }))
    }

    /// Ask the publisher to rotate cipher keys now.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be encoded.
    pub fn rotate_cipher_keys(&self) -> Result<SubscriberAction, SessionError> {
        self.command(Command::RotateCipherKeys)
    }

    /// Request a new processing interval in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be encoded.
    pub fn update_processing_interval(&self, interval: i32) -> Result<SubscriberAction, SessionError> {
        self.command(Command::UpdateProcessingInterval(interval))
    }

    /// Publish measurements to the publisher.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be encoded.
    pub fn publish_measurements(&self, measurements: Vec<Measurement>) -> Result<SubscriberAction, SessionError> {
        self.command(Command::PublishCommandMeasurements(measurements))
    }

    /// Send a user command.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Rejected`] if `command` is not a user command.
    pub fn user_command(&self, command: ServerCommand, payload: Bytes) -> Result<SubscriberAction, SessionError> {
        if command.user_index().is_none() {
            return Err(SessionError::Rejected { reason: format!("{command:?} is not a user command") });
        }
        self.command(Command::User { command, payload })
    }

    /// Handle one response frame.
    ///
    /// Faults are counted, never returned: once the parse window overflows
    /// the result carries [`SubscriberAction::Restart`].
    pub fn handle_response(&mut self, frame: &ResponseFrame, now: E::Instant) -> Vec<SubscriberAction> {
        if self.state == SubscriberState::Disconnected {
            tracing::debug!(code = frame.header.code(), "response while disconnected");
            return Vec::new();
        }
        match self.process(frame, now) {
            Ok(actions) => actions,
            Err(err) => self.parse_fault(&err, now),
        }
    }

    /// Check the data-loss monitor.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SubscriberAction> {
        match self.data_loss.check(now) {
            Ok(()) => Vec::new(),
            Err(err) => vec![self.restart(&err)],
        }
    }

    /// The connection dropped underneath the subscriber.
    pub fn disconnected(&mut self) {
        self.reset_connection_state();
        self.state = SubscriberState::Disconnected;
    }

    fn process(&mut self, frame: &ResponseFrame, now: E::Instant) -> Result<Vec<SubscriberAction>, SessionError> {
        let code = frame.header.code();
        let response = frame.response().ok_or(ProtocolError::InvalidResponse(code))?;
        let payload = &frame.payload;

        match response {
            ServerResponse::Succeeded => self.handle_succeeded(frame),
            ServerResponse::Failed => {
                let message = self.encoding().decode(payload)?;
                let code = frame.header.in_reply_to_code();
                tracing::warn!(code, reason = %message, "command failed");
                if frame.header.in_reply_to() == Some(ServerCommand::Subscribe) {
                    self.resubscribing = false;
                }
                Ok(vec![SubscriberAction::CommandFailed { code, message }])
            },
            ServerResponse::DataPacket => {
                self.data_loss.record(now);
                self.handle_data_packet(payload)
            },
            ServerResponse::UpdateSignalIndexCache => {
                let cache = decode_cache_payload(payload, self.config.operational_modes, DEFAULT_DECOMPRESS_LIMIT)?;
                let (signals, denied) = (cache.len(), cache.denied().len());
                if denied > 0 {
                    tracing::warn!(denied, "publisher refused requested signals");
                }
                self.signal_index.install(cache);
                self.decoder.reset();
                self.resubscribing = false;
                Ok(vec![SubscriberAction::SignalIndexCacheUpdated { signals, denied }])
            },
            ServerResponse::UpdateBaseTimes => {
                let offsets = BaseTimeOffsets::decode(payload)?;
                tracing::trace!(time_index = offsets.time_index, "base times updated");
                self.base_times = Some(offsets);
                Ok(Vec::new())
            },
            ServerResponse::UpdateCipherKeys => {
                let blob = match &self.shared_secret {
                    Some(secret) => secret.open(payload)?,
                    None => payload.to_vec(),
                };
                let keys = CipherKeys::from_blob(&blob)?;
                tracing::debug!(active = keys.active_index(), "cipher keys updated");
                self.keys = Some(Arc::new(keys));
                Ok(Vec::new())
            },
            ServerResponse::DataStartTime => {
                let start = decode_start_time(payload)?;
                self.start_time = Some(start);
                Ok(vec![SubscriberAction::DataStartTime(start)])
            },
            ServerResponse::ProcessingComplete => {
                Ok(vec![SubscriberAction::ProcessingComplete(self.encoding().decode(payload)?)])
            },
            ServerResponse::BufferBlock => {
                self.data_loss.record(now);
                self.handle_buffer_block(payload, now)
            },
            ServerResponse::Notify => {
                let notification = Notification::decode(payload)?;
                let text = self.encoding().decode(&notification.encoded_text)?;
                Ok(vec![
                    SubscriberAction::Notification(text),
                    self.command(Command::ConfirmNotification(notification.hash))?,
                ])
            },
            ServerResponse::ConfigurationChanged => Ok(vec![SubscriberAction::ConfigurationChanged]),
            ServerResponse::NoOp => Ok(Vec::new()),
            user => Ok(vec![SubscriberAction::UserResponse {
                response: user,
                in_reply_to: frame.header.in_reply_to_code(),
                payload: payload.clone(),
            }]),
        }
    }

    fn handle_succeeded(&mut self, frame: &ResponseFrame) -> Result<Vec<SubscriberAction>, SessionError> {
        let Some(command) = frame.header.in_reply_to() else {
            return Err(ProtocolError::InvalidCommand(frame.header.in_reply_to_code()).into());
        };

        if command == ServerCommand::MetaDataRefresh {
            let catalog = if self.config.operational_modes.gzip_metadata() {
                Bytes::from(gzip_decompress(&frame.payload, DEFAULT_DECOMPRESS_LIMIT)?)
            } else {
                frame.payload.clone()
            };
            return Ok(vec![SubscriberAction::Metadata(catalog)]);
        }

        let message = self.encoding().decode(&frame.payload)?;
        match command {
            ServerCommand::Authenticate => self.authenticated = true,
            ServerCommand::Subscribe => {
                self.state = SubscriberState::Subscribed;
                self.resubscribing = false;
                tracing::info!(summary = %message, "subscribed");
            },
            _ => {},
        }
        Ok(vec![SubscriberAction::CommandSucceeded { command, message }])
    }

    fn handle_data_packet(&mut self, payload: &[u8]) -> Result<Vec<SubscriberAction>, SessionError> {
        let cache = self.signal_index.load();
        let compact = cache.as_deref().map(|cache| CompactContext {
            cache,
            base_times: self.base_times.as_ref(),
            include_time: self.settings.include_time,
            millisecond_resolution: self.settings.use_millisecond_resolution,
        });

        let packet = self.decoder.decode(payload, self.keys.as_deref(), compact)?;
        if packet.measurements.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![SubscriberAction::Measurements(packet.measurements)])
    }

    fn handle_buffer_block(&mut self, payload: &[u8], now: E::Instant) -> Result<Vec<SubscriberAction>, SessionError> {
        let block = BufferBlock::decode(payload)?;
        let receipt = self.buffer_blocks.receive(block);

        // Unconfirmed overflow stays queued at the sender for retransmission.
        let mut actions = Vec::new();
        if !receipt.overflow {
            actions.push(self.command(Command::ConfirmBufferBlock(receipt.confirm))?);
        }
        let cache = self.signal_index.load();
        actions.extend(receipt.delivered.into_iter().map(|block| SubscriberAction::BufferBlock {
            sequence: block.sequence,
            signal_id: cache.as_ref().and_then(|c| c.signal_id(block.runtime_index)),
            data: block.data,
        }));

        if receipt.overflow {
            let err = SessionError::Rejected { reason: format!("buffer block {} too far ahead", receipt.confirm) };
            actions.extend(self.parse_fault(&err, now));
        }
        Ok(actions)
    }

    fn parse_fault(&mut self, err: &SessionError, now: E::Instant) -> Vec<SubscriberAction> {
        tracing::warn!(%err, "failed to process response");
        let mut actions = Vec::new();

        if matches!(err, SessionError::Compression(CompressionError::Desync { .. })) && !self.resubscribing {
            tracing::info!("payload codec desynchronized, resubscribing");
            self.resubscribing = true;
            self.decoder.reset();
            match self.subscribe_command() {
                Ok(action) => actions.push(action),
                Err(err) => tracing::warn!(%err, "failed to encode resubscription"),
            }
        }

        if let Err(overflow) = self.parse_errors.record(now) {
            return vec![self.restart(&overflow)];
        }
        actions
    }

    fn restart(&mut self, err: &SessionError) -> SubscriberAction {
        tracing::warn!(%err, transient = err.is_transient(), "restarting connection cycle");
        self.reset_connection_state();
        self.state = SubscriberState::Disconnected;
        SubscriberAction::Restart { reason: err.to_string() }
    }

    fn reset_connection_state(&mut self) {
        self.authenticated = false;
        self.signal_index.clear();
        self.keys = None;
        self.base_times = None;
        self.decoder.reset();
        self.buffer_blocks.reset();
        self.data_loss.disarm();
        self.parse_errors.reset();
        self.resubscribing = false;
        self.start_time = None;
    }

    fn subscribe_command(&self) -> Result<SubscriberAction, SessionError> {
        self.command(Command::Subscribe(SubscribeRequest {
            flags: self.flags,
            connection_string: self.settings.to_connection_string(),
        }))
    }

    fn command(&self, command: Command) -> Result<SubscriberAction, SessionError> {
        Ok(SubscriberAction::SendCommand(command.into_frame(self.encoding())?))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gep_proto::{OperationalModes, ResponseHeader, payloads::response::encode_start_time};
    use uuid::Uuid;

    use super::*;
    use crate::{
        cipher::{CipherKeyManager, KeyIvPair},
        compression::CompressionEncoder,
        data_packet::DataPacketEncoder,
        env::testing::TestEnv,
    };

    const UTF8: u32 = 0x0000_0200;

    fn config() -> SubscriberConfig {
        SubscriberConfig { operational_modes: OperationalModes::from_u32(UTF8), ..SubscriberConfig::default() }
    }

    fn settings(signals: &[u128]) -> SubscriptionSettings {
        SubscriptionSettings {
            signals: signals.iter().map(|s| Uuid::from_u128(*s)).collect(),
            ..SubscriptionSettings::default()
        }
    }

    fn subscriber(config: SubscriberConfig) -> (TestEnv, Subscriber<TestEnv>) {
        let env = TestEnv::new();
        let subscriber = Subscriber::new(env.clone(), config, settings(&[1, 2]), DataPacketFlags::empty()).unwrap();
        (env, subscriber)
    }

    fn reply(response: ServerResponse, to: ServerCommand, payload: impl Into<Bytes>) -> ResponseFrame {
        ResponseFrame::reply(response, to, payload)
    }

    fn cache_frame(signals: &[u128]) -> ResponseFrame {
        let cache = SignalIndexCache::new(
            Uuid::nil(),
            signals.iter().map(|s| Uuid::from_u128(*s)).collect(),
            vec![Uuid::from_u128(77)],
        )
        .unwrap();
        let mut payload = Vec::new();
        cache.encode(&mut payload);
        reply(ServerResponse::UpdateSignalIndexCache, ServerCommand::Subscribe, payload)
    }

    fn sent_commands(actions: &[SubscriberAction]) -> Vec<ServerCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                SubscriberAction::SendCommand(frame) => frame.command(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_negotiates_then_subscribes() {
        let (env, mut subscriber) = subscriber(config());
        let actions = subscriber.connect(env.now()).unwrap();
        assert_eq!(sent_commands(&actions), vec![ServerCommand::DefineOperationalModes, ServerCommand::Subscribe]);
        assert_eq!(subscriber.state(), SubscriberState::Subscribing);
    }

    #[test]
    fn gateway_connect_authenticates_between() {
        let config = SubscriberConfig {
            security_mode: SecurityMode::Gateway,
            auth_key: Some("station-7".into()),
            shared_secret: Some("correct horse".into()),
            ..config()
        };
        let (env, mut subscriber) = subscriber(config);
        let actions = subscriber.connect(env.now()).unwrap();
        assert_eq!(
            sent_commands(&actions),
            vec![ServerCommand::DefineOperationalModes, ServerCommand::Authenticate, ServerCommand::Subscribe]
        );
    }

    #[test]
    fn gateway_without_credentials_fails_to_connect() {
        let config = SubscriberConfig { security_mode: SecurityMode::Gateway, ..config() };
        let (env, mut subscriber) = subscriber(config);
        assert!(subscriber.connect(env.now()).is_err());
    }

    #[test]
    fn subscribe_reply_installs_cache_and_state() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();

        let actions = subscriber.handle_response(&cache_frame(&[1, 2]), env.now());
        assert_eq!(actions, vec![SubscriberAction::SignalIndexCacheUpdated { signals: 2, denied: 1 }]);

        let actions = subscriber.handle_response(
            &reply(ServerResponse::Succeeded, ServerCommand::Subscribe, &b"Client subscribed"[..]),
            env.now(),
        );
        assert!(matches!(&actions[0], SubscriberAction::CommandSucceeded { command: ServerCommand::Subscribe, .. }));
        assert_eq!(subscriber.state(), SubscriberState::Subscribed);
    }

    #[test]
    fn sealed_compressed_packets_decode() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();
        subscriber.handle_response(&cache_frame(&[1, 2]), env.now());

        let mut manager = CipherKeyManager::new(Duration::from_secs(1));
        let keys = manager.rotate(&env, env.now()).unwrap();
        subscriber.handle_response(
            &reply(ServerResponse::UpdateCipherKeys, ServerCommand::Subscribe, keys.to_blob()),
            env.now(),
        );

        let measurements = vec![Measurement::new(Uuid::from_u128(2), 4.5, Ticks(99))];
        let mut encoder =
            DataPacketEncoder::new(Some(CompressionEncoder::new(Box::new(DeflateStreamCodec::new()))));
        let packets =
            encoder.encode(&measurements, None, &gep_proto::MeasurementFormat::Full, Some(keys.as_ref())).unwrap();

        let actions =
            subscriber.handle_response(&reply(ServerResponse::DataPacket, ServerCommand::Subscribe, packets[0].clone()), env.now());
        assert_eq!(actions, vec![SubscriberAction::Measurements(measurements)]);
    }

    #[test]
    fn desync_resubscribes_once() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();
        subscriber.handle_response(&cache_frame(&[1]), env.now());

        // Compressed packet continuing a stream the decoder never saw
        let packet = vec![DataPacketFlags::COMPRESSED.to_byte(), 0, 0, 0, 0, 0, 5];
        let frame = reply(ServerResponse::DataPacket, ServerCommand::Subscribe, packet);

        let first = subscriber.handle_response(&frame, env.now());
        assert_eq!(sent_commands(&first), vec![ServerCommand::Subscribe]);
        let second = subscriber.handle_response(&frame, env.now());
        assert!(sent_commands(&second).is_empty());
        assert_eq!(subscriber.parse_error_count(), 2);
    }

    #[test]
    fn parse_fault_storm_restarts() {
        let config = SubscriberConfig { allowed_parsing_exceptions: 2, ..config() };
        let (env, mut subscriber) = subscriber(config);
        subscriber.connect(env.now()).unwrap();

        let garbage = ResponseFrame::new(ResponseHeader::from_raw(0x9F, 0x02), Bytes::new());
        assert!(subscriber.handle_response(&garbage, env.now()).is_empty());
        assert!(subscriber.handle_response(&garbage, env.now()).is_empty());
        let actions = subscriber.handle_response(&garbage, env.now());
        assert!(matches!(actions[..], [SubscriberAction::Restart { .. }]));
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
        assert_eq!(subscriber.parse_error_count(), 0);
    }

    #[test]
    fn silence_triggers_restart() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();

        assert!(subscriber.tick(env.at(Duration::from_secs(9))).is_empty());
        let actions = subscriber.tick(env.at(Duration::from_secs(10)));
        assert!(matches!(actions[..], [SubscriberAction::Restart { .. }]));
    }

    #[test]
    fn buffer_blocks_confirm_and_deliver_in_order() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();
        subscriber.handle_response(&cache_frame(&[1, 2]), env.now());

        let block = |sequence: u32| {
            let payload = BufferBlock { sequence, runtime_index: 1, data: Bytes::from(vec![sequence as u8]) }.to_bytes();
            reply(ServerResponse::BufferBlock, ServerCommand::Subscribe, payload)
        };

        let actions = subscriber.handle_response(&block(1), env.now());
        assert_eq!(sent_commands(&actions), vec![ServerCommand::ConfirmBufferBlock]);
        assert_eq!(actions.len(), 1);

        let actions = subscriber.handle_response(&block(0), env.now());
        let delivered: Vec<u32> = actions
            .iter()
            .filter_map(|a| match a {
                SubscriberAction::BufferBlock { sequence, signal_id, .. } => {
                    assert_eq!(*signal_id, Some(Uuid::from_u128(2)));
                    Some(*sequence)
                },
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![0, 1]);
    }

    #[test]
    fn notifications_are_confirmed() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();

        let mut payload = Vec::new();
        Notification { hash: 0xAABB_CCDD, encoded_text: Bytes::from_static(b"hello") }.encode(&mut payload);
        let actions =
            subscriber.handle_response(&reply(ServerResponse::Notify, ServerCommand::Subscribe, payload), env.now());

        assert_eq!(actions[0], SubscriberAction::Notification("hello".into()));
        let SubscriberAction::SendCommand(frame) = &actions[1] else { panic!("expected confirmation") };
        assert_eq!(frame.command(), Some(ServerCommand::ConfirmNotification));
        assert_eq!(&frame.payload[..], &0xAABB_CCDDu32.to_be_bytes());
    }

    #[test]
    fn start_time_and_user_responses_surface() {
        let (env, mut subscriber) = subscriber(config());
        subscriber.connect(env.now()).unwrap();

        let actions = subscriber.handle_response(
            &reply(ServerResponse::DataStartTime, ServerCommand::Subscribe, encode_start_time(Ticks(5))),
            env.now(),
        );
        assert_eq!(actions, vec![SubscriberAction::DataStartTime(Ticks(5))]);
        assert_eq!(subscriber.start_time(), Some(Ticks(5)));

        let actions = subscriber.handle_response(
            &reply(ServerResponse::UserResponse02, ServerCommand::UserCommand02, Bytes::from_static(b"ok")),
            env.now(),
        );
        assert!(matches!(&actions[0], SubscriberAction::UserResponse { response: ServerResponse::UserResponse02, .. }));
    }

    #[test]
    fn cipher_keys_are_opened_with_shared_secret() {
        let config = SubscriberConfig { shared_secret: Some("correct horse".into()), ..config() };
        let (env, mut subscriber) = subscriber(config);
        subscriber.connect(env.now()).unwrap();

        let pair = KeyIvPair::from_parts([3; 32], [4; 12]);
        let keys = CipherKeys::new(0, pair.clone(), pair).unwrap();
        let sealed = SharedSecret::derive("correct horse").unwrap().seal(&env, &keys.to_blob()).unwrap();
        subscriber.handle_response(&reply(ServerResponse::UpdateCipherKeys, ServerCommand::Subscribe, sealed), env.now());
        assert!(subscriber.cipher_keys().is_some());

        let actions = subscriber.handle_response(
            &reply(ServerResponse::UpdateCipherKeys, ServerCommand::Subscribe, keys.to_blob()),
            env.now(),
        );
        assert!(actions.is_empty());
        assert_eq!(subscriber.parse_error_count(), 1);
    }
}
