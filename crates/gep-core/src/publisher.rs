//! Publisher fan-out engine.
//!
//! Owns every [`Session`] of one publisher. Inbound frames are routed to
//! their session, measurement batches fan out to every subscribed session,
//! and one shared timer rotates cipher keys for all connections with
//! encrypted subscriptions.
//!
//! Sessions own disjoint state, so fan-out order between connections is not
//! significant. Actions for one connection keep the order the session
//! produced them in.

use std::collections::BTreeMap;

use bytes::Bytes;
use gep_proto::{CommandFrame, Measurement, ServerCommand, SignalId};

use crate::{
    env::{Environment, elapsed},
    error::{CipherError, SessionError},
    session::{ConnectionId, ConnectionSecurity, Session, SessionAction, SessionContext},
};

/// A session action tagged with its connection
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherAction {
    /// Connection the action belongs to
    pub connection_id: ConnectionId,
    /// What to do
    pub action: SessionAction,
}

/// All sessions of one publisher
pub struct Publisher<E: Environment> {
    env: E,
    context: SessionContext,
    sessions: BTreeMap<ConnectionId, Session<E>>,
    next_id: u64,
    last_key_rotation: E::Instant,
}

impl<E: Environment> std::fmt::Debug for Publisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("sessions", &self.sessions.len())
            .field("next_id", &self.next_id)
            .field("config", &self.context.config)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> Publisher<E> {
    /// Publisher with no connections
    pub fn new(env: E, context: SessionContext) -> Self {
        let last_key_rotation = env.now();
        Self { env, context, sessions: BTreeMap::new(), next_id: 1, last_key_rotation }
    }

    /// Register an accepted connection.
    pub fn accept(&mut self, security: ConnectionSecurity) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        tracing::info!(connection_id = %id, subscriber_id = %security.subscriber_id, "client connected");
        self.sessions.insert(id, Session::new(id, self.env.clone(), self.context.clone(), security));
        id
    }

    /// Session for `id`
    pub fn session(&self, id: ConnectionId) -> Option<&Session<E>> {
        self.sessions.get(&id)
    }

    /// Mutable session for `id`
    pub fn session_mut(&mut self, id: ConnectionId) -> Option<&mut Session<E>> {
        self.sessions.get_mut(&id)
    }

    /// Live connections
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live connection ids, ascending
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    /// Route one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] for an unknown connection.
    pub fn handle_frame(
        &mut self,
        id: ConnectionId,
        frame: &CommandFrame,
        now: E::Instant,
    ) -> Result<Vec<PublisherAction>, SessionError> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::InvalidState {
            state: "unknown connection",
            operation: "handle a command",
        })?;
        let actions = session.handle_frame(frame, now)?;
        Ok(self.tag(id, actions))
    }

    /// Fan a measurement batch out to every subscribed connection.
    ///
    /// A connection whose encoding fails is skipped and logged; the others
    /// still receive the batch.
    pub fn publish(&mut self, measurements: &[Measurement], now: E::Instant) -> Vec<PublisherAction> {
        let mut out = Vec::new();
        for (id, session) in &mut self.sessions {
            match session.publish(measurements, now) {
                Ok(actions) => out.extend(actions.into_iter().map(|action| PublisherAction { connection_id: *id, action })),
                Err(err) => tracing::warn!(connection_id = %id, %err, "failed to publish to client"),
            }
        }
        out
    }

    /// Send a buffer block to one connection.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown connection, a missing subscription
    /// or an unmapped signal.
    pub fn publish_buffer_block(
        &mut self,
        id: ConnectionId,
        signal_id: SignalId,
        data: Bytes,
        now: E::Instant,
    ) -> Result<Vec<PublisherAction>, SessionError> {
        let actions = self.session_or_err(id, "publish a buffer block")?.publish_buffer_block(signal_id, data, now)?;
        Ok(self.tag(id, actions))
    }

    /// Drive every session's timers and the shared key rotation.
    pub fn tick(&mut self, now: E::Instant) -> Vec<PublisherAction> {
        let rotate = elapsed(self.last_key_rotation, now) >= self.context.config.cipher_key_rotation_period;
        if rotate {
            self.last_key_rotation = now;
        }

        let mut out = Vec::new();
        for (id, session) in &mut self.sessions {
            let mut actions = session.tick(now);
            if rotate && session.wants_key_rotation() {
                match session.rotate_cipher_keys(now) {
                    Ok(rotated) => actions.extend(rotated),
                    Err(SessionError::Cipher(CipherError::RotationTooSoon { .. })) => {
                        tracing::debug!(connection_id = %id, "skipping timed rotation, keys are fresh");
                    },
                    Err(err) => tracing::warn!(connection_id = %id, %err, "timed key rotation failed"),
                }
            }
            out.extend(actions.into_iter().map(|action| PublisherAction { connection_id: *id, action }));
        }
        out
    }

    /// Send a notification to every connection.
    pub fn notify_all(&mut self, text: &str) -> Vec<PublisherAction> {
        let mut out = Vec::new();
        for (id, session) in &mut self.sessions {
            match session.notify(text) {
                Ok(actions) => out.extend(actions.into_iter().map(|action| PublisherAction { connection_id: *id, action })),
                Err(err) => tracing::warn!(connection_id = %id, %err, "failed to queue notification"),
            }
        }
        out
    }

    /// Broadcast `ConfigurationChanged`.
    pub fn configuration_changed(&mut self) -> Vec<PublisherAction> {
        let mut out = Vec::new();
        for (id, session) in &mut self.sessions {
            out.extend(session.configuration_changed().into_iter().map(|action| PublisherAction { connection_id: *id, action }));
        }
        out
    }

    /// Tell one connection its temporal replay finished.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown connection or unencodable text.
    pub fn processing_complete(&mut self, id: ConnectionId, text: &str) -> Result<Vec<PublisherAction>, SessionError> {
        let actions = self.session_or_err(id, "complete processing")?.processing_complete(text)?;
        Ok(self.tag(id, actions))
    }

    /// Answer a user command on one connection.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown connection or a non-user command.
    pub fn user_response(
        &mut self,
        id: ConnectionId,
        command: ServerCommand,
        payload: Bytes,
    ) -> Result<Vec<PublisherAction>, SessionError> {
        let actions = self.session_or_err(id, "send a user response")?.user_response(command, payload)?;
        Ok(self.tag(id, actions))
    }

    /// React to a failed send on `id`.
    pub fn handle_send_error(&mut self, id: ConnectionId, err: &(dyn std::error::Error + 'static)) -> Vec<PublisherAction> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        let actions = session.handle_send_error(err);
        self.tag(id, actions)
    }

    /// Disconnect `id`. Safe to call repeatedly and for unknown ids.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str) -> Vec<PublisherAction> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        let actions = session.disconnect(reason);
        self.tag(id, actions)
    }

    fn session_or_err(&mut self, id: ConnectionId, operation: &'static str) -> Result<&mut Session<E>, SessionError> {
        self.sessions.get_mut(&id).ok_or(SessionError::InvalidState { state: "unknown connection", operation })
    }

    /// Tag actions with `id`, dropping the session once it disconnected.
    fn tag(&mut self, id: ConnectionId, actions: Vec<SessionAction>) -> Vec<PublisherAction> {
        if actions.iter().any(|a| matches!(a, SessionAction::Disconnect { .. })) {
            self.sessions.remove(&id);
        }
        actions.into_iter().map(|action| PublisherAction { connection_id: id, action }).collect()
    }
}
