//! Publisher-side session state machine for one client connection.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods take the current instant as a parameter
//! - Methods return `Vec<SessionAction>` (or a `Result` of one)
//! - The driver executes actions: writes frames, routes data packets,
//!   closes sockets, hands client measurements to the host
//!
//! # State Machine
//!
//! ```text
//! ┌───────────┐ DefineOperationalModes ┌─────────────────────────┐
//! │ Connected │───────────────────────>│ OperationalModesDefined │
//! └───────────┘                        └─────────────────────────┘
//!                                          │ Authenticate   │ (no auth required)
//!                                          ↓                │
//!                                    ┌───────────────┐      │
//!                                    │ Authenticated │      │
//!                                    └───────────────┘      │
//!                                          │ Subscribe      ↓
//!                                          ↓          ┌────────────┐
//!                          ┌──────────────┐ Subscribe │ Subscribed │
//!                          │ Unsubscribed │──────────>│            │
//!                          │              │<──────────│            │
//!                          └──────────────┘Unsubscribe└────────────┘
//!
//!                any state ── disconnect ──> Disconnected (terminal)
//! ```
//!
//! # Dispatch Guard
//!
//! Every inbound frame passes one guard. When the security mode requires
//! authentication, commands other than `Authenticate` and
//! `DefineOperationalModes` are refused until the client authenticated.
//! Handler errors become `Failed` responses; no command closes the
//! connection.

use std::{collections::VecDeque, fmt, sync::Arc};

use bytes::Bytes;
use gep_proto::{
    Command, CommandFrame, Measurement, OperationalModes, ResponseFrame, ResponseHeader, ServerCommand,
    ServerResponse, SignalId, TextEncoding, Ticks,
    payloads::{
        AuthenticateRequest, BufferBlock, MetadataRefreshRequest, Notification, SubscribeRequest,
        response::encode_start_time,
    },
};
use uuid::Uuid;

use crate::{
    auth::verify_auth_token,
    cipher::{CipherKeyManager, CipherKeys, KeyHandle, SharedSecret},
    compression::{CompressionEncoder, DeflateStreamCodec, gzip_compress},
    config::{PublisherConfig, SubscriptionSettings},
    env::{Environment, elapsed},
    error::{CipherError, SessionError},
    signal_index::{build_signal_index_cache, encode_cache_payload},
    subscription::{Subscription, SubscriptionKind},
    transport::{DisconnectGuard, FaultClass, classify_fault},
};

/// Highest operational modes version this engine speaks
pub const SUPPORTED_VERSION: u8 = 1;

/// Opaque connection identifier assigned by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, nothing negotiated yet
    Connected,
    /// Operational modes received
    OperationalModesDefined,
    /// Client proved its identity
    Authenticated,
    /// Subscription active
    Subscribed,
    /// Subscription dropped, socket still open
    Unsubscribed,
    /// Terminal
    Disconnected,
}

impl SessionState {
    const fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::OperationalModesDefined => "operational modes defined",
            Self::Authenticated => "authenticated",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write the frame to the command channel
    SendFrame(ResponseFrame),
    /// Payload delivery; use the data channel when one is negotiated and
    /// running, otherwise the command channel
    SendData {
        /// Client's data channel port, if negotiated
        data_channel: Option<u16>,
        /// Frame to deliver
        frame: ResponseFrame,
    },
    /// Close the connection and drop its state
    Disconnect {
        /// Why the connection is closing
        reason: String,
    },
    /// Measurements the client published with `PublishCommandMeasurements`
    ClientMeasurements(Vec<Measurement>),
    /// User command for the host to answer through the publisher
    UserCommand {
        /// One of `UserCommand00..=UserCommand15`
        command: ServerCommand,
        /// Raw payload
        payload: Bytes,
    },
}

impl SessionAction {
    fn wire_len(&self) -> usize {
        match self {
            Self::SendFrame(frame) | Self::SendData { frame, .. } => frame.encoded_len(),
            _ => 0,
        }
    }
}

/// Decides which signals a subscriber may receive.
///
/// Called at most once per requested signal per subscribe.
pub trait SignalAuthorizer: Send + Sync + fmt::Debug {
    /// Whether `subscriber_id` may receive `signal_id`
    fn is_authorized(&self, subscriber_id: Uuid, signal_id: &SignalId) -> bool;
}

/// Authorizes every signal
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SignalAuthorizer for AllowAll {
    fn is_authorized(&self, _subscriber_id: Uuid, _signal_id: &SignalId) -> bool {
        true
    }
}

/// Supplies the opaque catalog for `MetaDataRefresh`.
pub trait MetadataProvider: Send + Sync + fmt::Debug {
    /// Catalog snapshot for `subscriber_id`, narrowed by `filter`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the client as a `Failed` response.
    fn metadata(&self, subscriber_id: Uuid, filter: Option<&str>) -> Result<Bytes, SessionError>;
}

/// Serves a fixed catalog
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata(pub Bytes);

impl MetadataProvider for StaticMetadata {
    fn metadata(&self, _subscriber_id: Uuid, _filter: Option<&str>) -> Result<Bytes, SessionError> {
        Ok(self.0.clone())
    }
}

/// Policy shared by all sessions of one publisher
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Publisher configuration
    pub config: Arc<PublisherConfig>,
    /// Signal authorization policy
    pub authorizer: Arc<dyn SignalAuthorizer>,
    /// Catalog source
    pub metadata: Arc<dyn MetadataProvider>,
}

impl SessionContext {
    /// Context authorizing every signal and serving an empty catalog
    #[must_use]
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config: Arc::new(config),
            authorizer: Arc::new(AllowAll),
            metadata: Arc::new(StaticMetadata::default()),
        }
    }
}

/// What the transport layer knows about a connection's identity.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSecurity {
    /// Subscriber the connection belongs to
    pub subscriber_id: Uuid,
    /// TLS handshake validated the client certificate
    pub tls_authenticated: bool,
    /// Pre-shared secret (Gateway mode)
    pub shared_secret: Option<SharedSecret>,
    /// Expected auth key inside the Gateway token
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone)]
struct RetainedNotification {
    hash: u32,
    payload: Bytes,
    sent: bool,
}

/// Per-connection publisher session.
pub struct Session<E: Environment> {
    id: ConnectionId,
    env: E,
    context: SessionContext,
    security: ConnectionSecurity,
    state: SessionState,
    authenticated: bool,
    modes: OperationalModes,
    keys: CipherKeyManager<E::Instant>,
    subscription: Option<Subscription<E::Instant>>,
    notifications: VecDeque<RetainedNotification>,
    client_not_found: bool,
    disconnect: DisconnectGuard,
    last_keep_alive: E::Instant,
    bytes_sent: u64,
}

impl<E: Environment> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .field("modes", &self.modes)
            .field("subscription", &self.subscription)
            .field("notifications", &self.notifications.len())
            .field("client_not_found", &self.client_not_found)
            .field("bytes_sent", &self.bytes_sent)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> Session<E> {
    /// Session for a freshly accepted connection.
    ///
    /// Connections under a security mode without authentication, and TLS
    /// connections whose certificate was validated, start authenticated.
    pub fn new(id: ConnectionId, env: E, context: SessionContext, security: ConnectionSecurity) -> Self {
        let now = env.now();
        let authenticated =
            !context.config.security_mode.requires_authentication() || security.tls_authenticated;
        let keys = CipherKeyManager::new(context.config.min_cipher_rotation_spacing);

        Self {
            id,
            env,
            context,
            security,
            state: SessionState::Connected,
            authenticated,
            modes: OperationalModes::default(),
            keys,
            subscription: None,
            notifications: VecDeque::new(),
            client_not_found: false,
            disconnect: DisconnectGuard::new(),
            last_keep_alive: now,
            bytes_sent: 0,
        }
    }

    /// Connection identifier
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the client passed authentication
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Negotiated operational modes
    pub const fn operational_modes(&self) -> OperationalModes {
        self.modes
    }

    /// Text encoding derived from the operational modes
    pub const fn encoding(&self) -> TextEncoding {
        self.modes.encoding()
    }

    /// Active subscription
    pub const fn subscription(&self) -> Option<&Subscription<E::Instant>> {
        self.subscription.as_ref()
    }

    /// Mutable access to the active subscription (frame sink replacement)
    pub fn subscription_mut(&mut self) -> Option<&mut Subscription<E::Instant>> {
        self.subscription.as_mut()
    }

    /// Handle for reading this connection's cipher keys
    pub fn cipher_keys(&self) -> KeyHandle {
        self.keys.handle()
    }

    /// Bytes handed to the transport so far
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Whether sends are suppressed after a half-closed socket
    pub const fn is_client_not_found(&self) -> bool {
        self.client_not_found
    }

    /// Notifications retained until the client confirms them
    pub fn retained_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// Handle one inbound command frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] once the session is
    /// disconnected. Every other failure is answered with `Failed`.
    pub fn handle_frame(
        &mut self,
        frame: &CommandFrame,
        now: E::Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::InvalidState { state: self.state.name(), operation: "handle a command" });
        }

        let Some(command) = frame.command() else {
            let err = SessionError::Protocol(gep_proto::ProtocolError::InvalidCommand(frame.code()));
            tracing::warn!(connection_id = %self.id, code = frame.code(), "unrecognized command");
            let header = ResponseHeader::from_raw(ServerResponse::Failed.to_u8(), frame.code());
            let reply = ResponseFrame::new(header, self.text(&err.to_string()));
            return Ok(self.track(vec![SessionAction::SendFrame(reply)]));
        };

        if self.context.config.security_mode.requires_authentication()
            && !self.authenticated
            && !matches!(command, ServerCommand::Authenticate | ServerCommand::DefineOperationalModes)
        {
            let err = SessionError::NotAuthenticated { command };
            tracing::warn!(connection_id = %self.id, ?command, security_event = true, "command before authentication");
            return Ok(self.track(vec![self.failed(command, &err)]));
        }

        let result = Command::decode(command, &frame.payload, self.encoding())
            .map_err(SessionError::from)
            .and_then(|decoded| self.dispatch(decoded, now));

        let actions = match result {
            Ok(actions) => actions,
            Err(err) => {
                match &err {
                    SessionError::AuthenticationFailed { reason } => {
                        tracing::warn!(connection_id = %self.id, reason, security_event = true, "authentication failed");
                    },
                    err if err.is_security_event() => {
                        tracing::warn!(connection_id = %self.id, ?command, %err, security_event = true, "command refused");
                    },
                    err => tracing::debug!(connection_id = %self.id, ?command, %err, "command failed"),
                }
                vec![self.failed(command, &err)]
            },
        };
        Ok(self.track(actions))
    }

    fn dispatch(&mut self, command: Command, now: E::Instant) -> Result<Vec<SessionAction>, SessionError> {
        match command {
            Command::Authenticate(request) => self.handle_authenticate(&request),
            Command::MetaDataRefresh(request) => self.handle_metadata_refresh(&request),
            Command::Subscribe(request) => self.handle_subscribe(&request, now),
            Command::Unsubscribe => Ok(self.handle_unsubscribe()),
            Command::RotateCipherKeys => self.handle_rotate_cipher_keys(now),
            Command::UpdateProcessingInterval(interval) => self.handle_processing_interval(interval),
            Command::DefineOperationalModes(modes) => Ok(self.handle_operational_modes(modes)),
            Command::ConfirmNotification(hash) => Ok(self.handle_confirm_notification(hash)),
            Command::ConfirmBufferBlock(sequence) => Ok(self.handle_confirm_buffer_block(sequence)),
            Command::PublishCommandMeasurements(measurements) => {
                let message = format!("{} measurements received", measurements.len());
                Ok(vec![
                    SessionAction::ClientMeasurements(measurements),
                    self.succeeded(ServerCommand::PublishCommandMeasurements, &message),
                ])
            },
            Command::User { command, payload } => {
                tracing::debug!(connection_id = %self.id, ?command, len = payload.len(), "user command");
                Ok(vec![SessionAction::UserCommand { command, payload }])
            },
        }
    }

    fn handle_operational_modes(&mut self, modes: OperationalModes) -> Vec<SessionAction> {
        if modes.version() > SUPPORTED_VERSION {
            tracing::warn!(
                connection_id = %self.id,
                version = modes.version(),
                supported = SUPPORTED_VERSION,
                "client requested unsupported protocol version"
            );
        }
        self.modes = modes;
        if self.state == SessionState::Connected {
            self.state = if self.authenticated && self.context.config.security_mode.requires_authentication() {
                SessionState::Authenticated
            } else {
                SessionState::OperationalModesDefined
            };
        }
        tracing::debug!(connection_id = %self.id, modes = modes.to_u32(), encoding = modes.encoding().name(), "operational modes defined");
        Vec::new()
    }

    fn handle_authenticate(&mut self, request: &AuthenticateRequest) -> Result<Vec<SessionAction>, SessionError> {
        let mode = self.context.config.security_mode;
        if !mode.requires_authentication() {
            return Err(SessionError::Rejected {
                reason: "Authenticate command is not supported when security is disabled".to_string(),
            });
        }
        if mode == gep_proto::SecurityMode::Tls {
            return Err(SessionError::Rejected {
                reason: "Authenticate command is not supported in TLS mode".to_string(),
            });
        }

        let secret = self
            .security
            .shared_secret
            .as_ref()
            .ok_or(SessionError::AuthenticationFailed { reason: "no shared secret for subscriber" })?;
        let auth_key = self
            .security
            .auth_key
            .as_deref()
            .ok_or(SessionError::AuthenticationFailed { reason: "no auth key for subscriber" })?;
        verify_auth_token(secret, &request.token, auth_key, self.encoding())?;

        self.authenticated = true;
        if matches!(self.state, SessionState::Connected | SessionState::OperationalModesDefined) {
            self.state = SessionState::Authenticated;
        }
        tracing::info!(connection_id = %self.id, subscriber_id = %self.security.subscriber_id, "client authenticated");

        let mut actions = vec![self.succeeded(ServerCommand::Authenticate, "Client authenticated")];
        actions.extend(self.flush_notifications());
        Ok(actions)
    }

    fn handle_metadata_refresh(
        &mut self,
        request: &MetadataRefreshRequest,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if !self.context.config.allow_metadata_refresh {
            return Err(SessionError::Rejected {
                reason: "Meta-data refresh has been disallowed by the publisher".to_string(),
            });
        }

        let catalog = self
            .context
            .metadata
            .metadata(self.security.subscriber_id, request.filter.as_deref())
            .map_err(|err| SessionError::Rejected { reason: format!("Failed to transfer meta-data: {err}") })?;
        let payload = if self.modes.gzip_metadata() { Bytes::from(gzip_compress(&catalog)?) } else { catalog };

        tracing::debug!(connection_id = %self.id, len = payload.len(), "sending metadata");
        Ok(vec![SessionAction::SendFrame(ResponseFrame::reply(
            ServerResponse::Succeeded,
            ServerCommand::MetaDataRefresh,
            payload,
        ))])
    }

    fn handle_subscribe(
        &mut self,
        request: &SubscribeRequest,
        now: E::Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let config = Arc::clone(&self.context.config);
        let settings = SubscriptionSettings::parse(&request.connection_string)?;

        if request.synchronized() && !config.allow_synchronized_subscription {
            tracing::warn!(connection_id = %self.id, security_event = true, "synchronized subscription denied");
            return Err(SessionError::Rejected {
                reason: "Client request for remotely synchronized data was denied by the publisher".to_string(),
            });
        }

        let compress =
            config.allow_payload_compression && self.modes.contains(OperationalModes::COMPRESS_PAYLOAD_DATA);
        if compress && settings.data_channel.is_some() {
            return Err(SessionError::Rejected {
                reason: "Stateful payload compression cannot be used over a data channel".to_string(),
            });
        }

        let subscriber_id = self.security.subscriber_id;
        let authorizer = Arc::clone(&self.context.authorizer);
        let cache = build_signal_index_cache(subscriber_id, &settings.signals, |signal| {
            authorizer.is_authorized(subscriber_id, signal)
        })?;
        if !cache.denied().is_empty() {
            tracing::warn!(
                connection_id = %self.id,
                %subscriber_id,
                denied = cache.denied().len(),
                "client requested unauthorized signals"
            );
        }
        if let Some(assembly) = &settings.assembly_info {
            tracing::debug!(connection_id = %self.id, assembly, "subscriber assembly");
        }

        let cache_payload = encode_cache_payload(&cache, self.modes)?;
        let compressor = compress.then(|| CompressionEncoder::new(Box::new(DeflateStreamCodec::new())));
        let kind =
            if request.synchronized() { SubscriptionKind::Synchronized } else { SubscriptionKind::Unsynchronized };

        match &mut self.subscription {
            Some(subscription) if subscription.kind() == kind => {
                subscription.update(request.compact(), settings, cache, compressor);
            },
            slot => {
                *slot = Some(Subscription::new(kind, request.compact(), settings, cache, compressor));
            },
        }

        let mut actions = vec![SessionAction::SendFrame(ResponseFrame::reply(
            ServerResponse::UpdateSignalIndexCache,
            ServerCommand::Subscribe,
            cache_payload,
        ))];

        let wall_clock = self.env.wall_clock();
        if let Some(offsets) = self.subscription.as_mut().and_then(|s| s.rotate_base_times(wall_clock)) {
            actions.push(Self::base_times_frame(&offsets));
        }

        if config.encrypt_payload && self.authenticated {
            let keys = match self.keys.rotate(&self.env, now) {
                Ok(keys) => Some(keys),
                Err(CipherError::RotationTooSoon { .. }) => self.keys.current(),
                Err(err) => return Err(err.into()),
            };
            if let Some(keys) = keys {
                actions.push(self.cipher_keys_frame(&keys, ServerCommand::Subscribe)?);
            }
        }

        self.state = SessionState::Subscribed;
        let message = self.subscription.as_ref().map(Subscription::describe).unwrap_or_default();
        tracing::info!(connection_id = %self.id, %subscriber_id, summary = %message, "client subscribed");
        actions.push(self.succeeded(ServerCommand::Subscribe, &message));
        Ok(actions)
    }

    fn handle_unsubscribe(&mut self) -> Vec<SessionAction> {
        if let Some(subscription) = self.subscription.take() {
            subscription.signal_index().clear();
        }
        self.state = SessionState::Unsubscribed;
        tracing::info!(connection_id = %self.id, "client unsubscribed");
        vec![self.succeeded(ServerCommand::Unsubscribe, "Client unsubscribed.")]
    }

    fn handle_rotate_cipher_keys(&mut self, now: E::Instant) -> Result<Vec<SessionAction>, SessionError> {
        if !self.context.config.encrypt_payload {
            return Err(SessionError::Rejected { reason: "Payload encryption is not enabled".to_string() });
        }
        let mut actions = self.rotate_cipher_keys(now)?;
        actions.push(self.succeeded(ServerCommand::RotateCipherKeys, "New cipher keys established."));
        Ok(actions)
    }

    /// Rotate this connection's keys and announce them.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the previous rotation is under the minimum
    /// spacing or key sealing fails.
    pub fn rotate_cipher_keys(&mut self, now: E::Instant) -> Result<Vec<SessionAction>, SessionError> {
        let keys = self.keys.rotate(&self.env, now)?;
        let frame = self.cipher_keys_frame(&keys, ServerCommand::RotateCipherKeys)?;
        Ok(vec![frame])
    }

    /// Whether the publisher's shared rotation timer covers this session.
    pub fn wants_key_rotation(&self) -> bool {
        self.context.config.encrypt_payload
            && self.authenticated
            && self.subscription.is_some()
            && self.state != SessionState::Disconnected
    }

    fn handle_processing_interval(&mut self, interval: i32) -> Result<Vec<SessionAction>, SessionError> {
        let subscription = self
            .subscription
            .as_mut()
            .ok_or(SessionError::NotSubscribed { command: ServerCommand::UpdateProcessingInterval })?;
        subscription.set_processing_interval(interval);
        tracing::debug!(connection_id = %self.id, interval, "processing interval updated");
        let message = format!("New processing interval of {interval} assigned.");
        Ok(vec![self.succeeded(ServerCommand::UpdateProcessingInterval, &message)])
    }

    fn handle_confirm_notification(&mut self, hash: u32) -> Vec<SessionAction> {
        let before = self.notifications.len();
        self.notifications.retain(|n| n.hash != hash);
        if self.notifications.len() == before {
            tracing::debug!(connection_id = %self.id, hash, "confirmation for unknown notification");
        }
        Vec::new()
    }

    fn handle_confirm_buffer_block(&mut self, sequence: u32) -> Vec<SessionAction> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Vec::new();
        };
        let data_channel = subscription.settings().data_channel;
        subscription
            .confirm_buffer_block(sequence)
            .iter()
            .map(|block| Self::buffer_block_action(block, data_channel))
            .collect()
    }

    /// Publish a batch of measurements to this client.
    ///
    /// Unsynchronized subscriptions encode the authorized subset right away
    /// (or hold it for the publish interval); synchronized subscriptions feed
    /// their frame sink and publish from [`Session::tick`].
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, compression or sealing fails.
    pub fn publish(
        &mut self,
        measurements: &[Measurement],
        now: E::Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.client_not_found || self.state != SessionState::Subscribed {
            return Ok(Vec::new());
        }
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(Vec::new());
        };

        let filtered = subscription.filter(measurements);
        if filtered.is_empty() {
            return Ok(Vec::new());
        }

        let actions = match subscription.kind() {
            SubscriptionKind::Synchronized => {
                subscription.push_to_sink(&filtered);
                Vec::new()
            },
            SubscriptionKind::Unsynchronized => match subscription.hold(filtered, now) {
                Some(batch) => self.encode_batch(&batch, None)?,
                None => Vec::new(),
            },
        };
        Ok(self.track(actions))
    }

    fn encode_batch(
        &mut self,
        measurements: &[Measurement],
        frame_timestamp: Option<Ticks>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let keys = self.keys.current();
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(Vec::new());
        };
        let Some(first) = frame_timestamp.or_else(|| measurements.first().map(|m| m.timestamp)) else {
            return Ok(Vec::new());
        };

        let mut actions = Vec::new();
        if let Some(start) = subscription.take_start_time(first) {
            actions.push(SessionAction::SendFrame(ResponseFrame::reply(
                ServerResponse::DataStartTime,
                ServerCommand::Subscribe,
                encode_start_time(start),
            )));
        }

        let data_channel = subscription.settings().data_channel;
        for packet in subscription.encode(measurements, frame_timestamp, keys.as_deref())? {
            actions.push(SessionAction::SendData {
                data_channel,
                frame: ResponseFrame::reply(ServerResponse::DataPacket, ServerCommand::Subscribe, packet),
            });
        }
        Ok(actions)
    }

    /// Send a buffer block for `signal_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotSubscribed`] without a subscription, or a
    /// protocol error if the signal is not in the active cache.
    pub fn publish_buffer_block(
        &mut self,
        signal_id: SignalId,
        data: Bytes,
        now: E::Instant,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let subscription = self
            .subscription
            .as_mut()
            .ok_or(SessionError::NotSubscribed { command: ServerCommand::Subscribe })?;
        let block = subscription.send_buffer_block(signal_id, data, now)?;
        let action = Self::buffer_block_action(&block, subscription.settings().data_channel);
        Ok(self.track(vec![action]))
    }

    /// Drive timers: keep-alive, base-time rotation, buffer block
    /// retransmission, publish-interval flushes and synchronized frames.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SessionAction> {
        if self.state == SessionState::Disconnected || self.client_not_found {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if elapsed(self.last_keep_alive, now) >= self.context.config.keep_alive_interval {
            self.last_keep_alive = now;
            actions.push(SessionAction::SendFrame(ResponseFrame::reply(
                ServerResponse::NoOp,
                ServerCommand::Subscribe,
                Bytes::new(),
            )));
        }

        let wall_clock = self.env.wall_clock();
        let Some(subscription) = self.subscription.as_mut() else {
            return self.track(actions);
        };

        if subscription.base_times_due(wall_clock) {
            if let Some(offsets) = subscription.rotate_base_times(wall_clock) {
                tracing::debug!(connection_id = %self.id, time_index = offsets.time_index, "rotated base times");
                actions.push(Self::base_times_frame(&offsets));
            }
        }

        let data_channel = subscription.settings().data_channel;
        for block in subscription.poll_buffer_blocks(now) {
            actions.push(Self::buffer_block_action(&block, data_channel));
        }

        let held = subscription.flush_held(now);
        let frames = subscription.release_frames(wall_clock);

        let mut encoded = Vec::new();
        if let Some(batch) = held {
            encoded.push(self.encode_batch(&batch, None));
        }
        for frame in frames {
            encoded.push(self.encode_batch(&frame.measurements, Some(frame.timestamp)));
        }
        for result in encoded {
            match result {
                Ok(packets) => actions.extend(packets),
                Err(err) => tracing::warn!(connection_id = %self.id, %err, "failed to encode measurements"),
            }
        }

        self.track(actions)
    }

    /// Queue a notification; it is sent once the client is authenticated and
    /// retained until confirmed. Duplicate texts are ignored.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the text cannot be encoded.
    pub fn notify(&mut self, text: &str) -> Result<Vec<SessionAction>, SessionError> {
        let encoded_text = Bytes::from(self.encoding().encode(text)?);
        let hash = twox_hash::XxHash32::oneshot(0, &encoded_text);
        if self.notifications.iter().any(|n| n.hash == hash) {
            return Ok(Vec::new());
        }

        let retention = self.context.config.notification_retention;
        if retention > 0 && self.notifications.len() >= retention {
            if let Some(dropped) = self.notifications.pop_front() {
                tracing::warn!(connection_id = %self.id, hash = dropped.hash, "dropping unconfirmed notification");
            }
        }

        let mut payload = Vec::with_capacity(4 + encoded_text.len());
        Notification { hash, encoded_text }.encode(&mut payload);
        self.notifications.push_back(RetainedNotification { hash, payload: payload.into(), sent: false });

        if !self.authenticated {
            tracing::debug!(connection_id = %self.id, hash, "queued notification until authenticated");
            return Ok(Vec::new());
        }
        let actions = self.flush_notifications();
        Ok(self.track(actions))
    }

    fn flush_notifications(&mut self) -> Vec<SessionAction> {
        self.notifications
            .iter_mut()
            .filter(|n| !n.sent)
            .map(|n| {
                n.sent = true;
                SessionAction::SendFrame(ResponseFrame::reply(
                    ServerResponse::Notify,
                    ServerCommand::Subscribe,
                    n.payload.clone(),
                ))
            })
            .collect()
    }

    /// Tell the client the publisher's configuration changed.
    pub fn configuration_changed(&mut self) -> Vec<SessionAction> {
        if !self.authenticated || self.state == SessionState::Disconnected {
            return Vec::new();
        }
        let frame =
            ResponseFrame::reply(ServerResponse::ConfigurationChanged, ServerCommand::Subscribe, Bytes::new());
        self.track(vec![SessionAction::SendFrame(frame)])
    }

    /// Announce the end of a temporal replay.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the text cannot be encoded.
    pub fn processing_complete(&mut self, text: &str) -> Result<Vec<SessionAction>, SessionError> {
        let payload = self.encoding().encode(text)?;
        let frame = ResponseFrame::reply(ServerResponse::ProcessingComplete, ServerCommand::Subscribe, payload);
        Ok(self.track(vec![SessionAction::SendFrame(frame)]))
    }

    /// Answer a user command.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Rejected`] if `command` is not a user command.
    pub fn user_response(
        &mut self,
        command: ServerCommand,
        payload: Bytes,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let response = command.user_response().ok_or_else(|| SessionError::Rejected {
            reason: format!("{command:?} is not a user command"),
        })?;
        Ok(self.track(vec![SessionAction::SendFrame(ResponseFrame::reply(response, command, payload))]))
    }

    /// React to a failed send on this connection.
    pub fn handle_send_error(&mut self, err: &(dyn std::error::Error + 'static)) -> Vec<SessionAction> {
        match classify_fault(err) {
            FaultClass::Disconnect => self.disconnect(&format!("connection lost: {err}")),
            FaultClass::ClientGone => {
                if !self.client_not_found {
                    tracing::warn!(connection_id = %self.id, %err, "client no longer reachable, suppressing sends");
                }
                self.client_not_found = true;
                Vec::new()
            },
            FaultClass::Warning => {
                tracing::warn!(connection_id = %self.id, %err, "send failed");
                Vec::new()
            },
        }
    }

    /// Tear the session down. Only the first call has any effect.
    pub fn disconnect(&mut self, reason: &str) -> Vec<SessionAction> {
        if !self.disconnect.trigger() {
            return Vec::new();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.signal_index().clear();
        }
        self.keys.clear();
        self.notifications.clear();
        self.state = SessionState::Disconnected;
        tracing::info!(connection_id = %self.id, reason, "client disconnected");
        vec![SessionAction::Disconnect { reason: reason.to_string() }]
    }

    fn cipher_keys_frame(
        &self,
        keys: &CipherKeys,
        in_reply_to: ServerCommand,
    ) -> Result<SessionAction, SessionError> {
        let blob = keys.to_blob();
        let payload = match &self.security.shared_secret {
            Some(secret) => secret.seal(&self.env, &blob)?,
            None => blob,
        };
        Ok(SessionAction::SendFrame(ResponseFrame::reply(ServerResponse::UpdateCipherKeys, in_reply_to, payload)))
    }

    fn base_times_frame(offsets: &gep_proto::BaseTimeOffsets) -> SessionAction {
        let mut payload = Vec::with_capacity(gep_proto::BaseTimeOffsets::SIZE);
        offsets.encode(&mut payload);
        SessionAction::SendFrame(ResponseFrame::reply(ServerResponse::UpdateBaseTimes, ServerCommand::Subscribe, payload))
    }

    fn buffer_block_action(block: &BufferBlock, data_channel: Option<u16>) -> SessionAction {
        SessionAction::SendData {
            data_channel,
            frame: ResponseFrame::reply(ServerResponse::BufferBlock, ServerCommand::Subscribe, block.to_bytes()),
        }
    }

    fn succeeded(&self, command: ServerCommand, message: &str) -> SessionAction {
        SessionAction::SendFrame(ResponseFrame::reply(ServerResponse::Succeeded, command, self.text(message)))
    }

    fn failed(&self, command: ServerCommand, err: &SessionError) -> SessionAction {
        SessionAction::SendFrame(ResponseFrame::reply(ServerResponse::Failed, command, self.text(&err.to_string())))
    }

    /// Response text in the session's encoding, raw UTF-8 if unrepresentable.
    fn text(&self, message: &str) -> Bytes {
        self.encoding()
            .encode(message)
            .map_or_else(|_| Bytes::copy_from_slice(message.as_bytes()), Bytes::from)
    }

    fn track(&mut self, actions: Vec<SessionAction>) -> Vec<SessionAction> {
        self.bytes_sent += actions.iter().map(SessionAction::wire_len).sum::<usize>() as u64;
        actions
    }
}
