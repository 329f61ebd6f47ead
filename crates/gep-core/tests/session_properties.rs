//! Property-based tests for the publisher session.
//!
//! These tests use proptest to verify invariants hold for all inputs:
//! - Nothing but `Authenticate` and `DefineOperationalModes` runs before a
//!   Gateway client authenticates
//! - Cipher rotations closer than the minimum spacing are refused
//! - Operational modes select the response text encoding
//! - Keep-alives follow the configured interval

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use gep_core::{
    ConnectionId, ConnectionSecurity, PublisherConfig, Session, SessionAction, SessionContext, SessionState,
    env::Environment,
};
use gep_proto::{
    Command, CommandFrame, DataPacketFlags, OperationalModes, ResponseFrame, SecurityMode, ServerCommand,
    ServerResponse, TextEncoding, Ticks, payloads::SubscribeRequest,
};
use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

const UTF8: u32 = 0x0000_0200;

// Manually clocked environment: `now()` is the origin, tests pass explicit
// instants.
#[derive(Clone)]
struct TestEnv {
    origin: Instant,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl TestEnv {
    fn new() -> Self {
        Self { origin: Instant::now(), rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(11))) }
    }

    fn at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        self.origin
    }

    fn wall_clock(&self) -> Ticks {
        Ticks(638_000_000_000_000_000)
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }
}

fn session(config: PublisherConfig) -> (TestEnv, Session<TestEnv>) {
    let env = TestEnv::new();
    let session =
        Session::new(ConnectionId(1), env.clone(), SessionContext::new(config), ConnectionSecurity::default());
    (env, session)
}

fn frame(command: &Command) -> CommandFrame {
    command.into_frame(TextEncoding::Utf8).unwrap()
}

fn responses(actions: &[SessionAction]) -> Vec<&ResponseFrame> {
    actions
        .iter()
        .filter_map(|a| match a {
            SessionAction::SendFrame(frame) | SessionAction::SendData { frame, .. } => Some(frame),
            _ => None,
        })
        .collect()
}

fn subscribed(config: PublisherConfig) -> (TestEnv, Session<TestEnv>) {
    let (env, mut session) = session(config);
    let modes = Command::DefineOperationalModes(OperationalModes::from_u32(UTF8));
    session.handle_frame(&frame(&modes), env.now()).unwrap();
    let subscribe = Command::Subscribe(SubscribeRequest {
        flags: DataPacketFlags::empty(),
        connection_string: "inputMeasurementKeys={00000000-0000-0000-0000-000000000001}".to_string(),
    });
    session.handle_frame(&frame(&subscribe), env.now()).unwrap();
    assert_eq!(session.state(), SessionState::Subscribed);
    (env, session)
}

// Strategy for commands that require authentication
fn guarded_command() -> impl Strategy<Value = ServerCommand> {
    prop_oneof![
        Just(ServerCommand::MetaDataRefresh),
        Just(ServerCommand::Subscribe),
        Just(ServerCommand::Unsubscribe),
        Just(ServerCommand::RotateCipherKeys),
        Just(ServerCommand::UpdateProcessingInterval),
        Just(ServerCommand::ConfirmNotification),
        Just(ServerCommand::ConfirmBufferBlock),
        Just(ServerCommand::PublishCommandMeasurements),
        (0xD0u8..=0xDF).prop_map(|code| ServerCommand::from_u8(code).unwrap()),
    ]
}

#[test]
fn prop_gateway_guard_refuses_before_authentication() {
    proptest!(|(command in guarded_command(), payload in prop::collection::vec(any::<u8>(), 0..64))| {
        let config = PublisherConfig { security_mode: SecurityMode::Gateway, ..PublisherConfig::default() };
        let (env, mut session) = session(config);

        let actions = session.handle_frame(&CommandFrame::new(command, payload), env.now()).unwrap();
        let frames = responses(&actions);

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].response(), Some(ServerResponse::Failed));
        prop_assert_eq!(frames[0].header.in_reply_to(), Some(command));
        prop_assert!(!session.is_authenticated());
        prop_assert_eq!(session.state(), SessionState::Connected);
    });
}

#[test]
fn prop_rotation_within_spacing_is_refused() {
    proptest!(|(gap_ms in 0u64..1000)| {
        let config = PublisherConfig { encrypt_payload: true, ..PublisherConfig::default() };
        let (env, mut session) = subscribed(config);
        let rotate = frame(&Command::RotateCipherKeys);

        // Subscribe seeded the keys at the origin.
        let first = session.handle_frame(&rotate, env.at(Duration::from_secs(5))).unwrap();
        let second = session.handle_frame(&rotate, env.at(Duration::from_secs(5) + Duration::from_millis(gap_ms))).unwrap();

        let first: Vec<_> = responses(&first).iter().filter_map(|f| f.response()).collect();
        prop_assert_eq!(first, vec![ServerResponse::UpdateCipherKeys, ServerResponse::Succeeded]);

        let second = responses(&second);
        prop_assert_eq!(second.len(), 1);
        prop_assert_eq!(second[0].response(), Some(ServerResponse::Failed));
        prop_assert_eq!(
            std::str::from_utf8(&second[0].payload).unwrap(),
            "Cipher key rotation skipped, keys were already rotated within last second."
        );
    });
}

#[test]
fn rotation_after_spacing_succeeds_and_flips_keys() {
    let config = PublisherConfig { encrypt_payload: true, ..PublisherConfig::default() };
    let (env, mut session) = subscribed(config);
    let keys = session.cipher_keys();
    let before = keys.load_full().unwrap().active_index();

    let rotate = frame(&Command::RotateCipherKeys);
    session.handle_frame(&rotate, env.at(Duration::from_secs(1))).unwrap();
    let after = keys.load_full().unwrap().active_index();
    assert_ne!(before, after);

    session.handle_frame(&rotate, env.at(Duration::from_secs(2))).unwrap();
    assert_eq!(keys.load_full().unwrap().active_index(), before);
}

#[test]
fn rotation_without_encryption_fails() {
    let (env, mut session) = subscribed(PublisherConfig::default());
    let actions = session.handle_frame(&frame(&Command::RotateCipherKeys), env.at(Duration::from_secs(3))).unwrap();
    let frames = responses(&actions);
    assert_eq!(frames[0].response(), Some(ServerResponse::Failed));
    assert_eq!(std::str::from_utf8(&frames[0].payload).unwrap(), "Payload encryption is not enabled");
}

#[test]
fn prop_modes_select_response_encoding() {
    proptest!(|(encoding_bits in prop_oneof![Just(0u32), Just(0x100), Just(0x200), Just(0x300)])| {
        let (env, mut session) = session(PublisherConfig::default());
        let modes = OperationalModes::from_u32(encoding_bits);
        session.handle_frame(&frame(&Command::DefineOperationalModes(modes)), env.now()).unwrap();
        prop_assert_eq!(session.encoding(), modes.encoding());

        let actions = session.handle_frame(&frame(&Command::Unsubscribe), env.now()).unwrap();
        let reply = responses(&actions)[0];
        prop_assert_eq!(session.encoding().decode(&reply.payload).unwrap(), "Client unsubscribed.");
    });
}

#[test]
fn utf8_modes_negotiate_utf8() {
    let (env, mut session) = session(PublisherConfig::default());
    assert_eq!(session.encoding(), TextEncoding::Utf16Le);

    let modes = Command::DefineOperationalModes(OperationalModes::from_u32(UTF8));
    let actions = session.handle_frame(&frame(&modes), env.now()).unwrap();
    assert!(actions.is_empty());
    assert_eq!(session.encoding(), TextEncoding::Utf8);
    assert_eq!(session.state(), SessionState::OperationalModesDefined);
}

#[test]
fn prop_keep_alive_follows_interval() {
    proptest!(|(interval_ms in 100u64..10_000, steps in 1usize..20)| {
        let config =
            PublisherConfig { keep_alive_interval: Duration::from_millis(interval_ms), ..PublisherConfig::default() };
        let (env, mut session) = session(config);

        let mut keep_alives = 0;
        for step in 1..=steps {
            let now = env.at(Duration::from_millis(interval_ms * step as u64));
            let actions = session.tick(now);
            keep_alives += responses(&actions).iter().filter(|f| f.response() == Some(ServerResponse::NoOp)).count();
        }
        prop_assert_eq!(keep_alives, steps);
    });
}

#[test]
fn disconnected_session_refuses_frames() {
    let (env, mut session) = subscribed(PublisherConfig::default());
    let actions = session.disconnect("test over");
    assert!(matches!(actions[..], [SessionAction::Disconnect { .. }]));
    assert!(session.handle_frame(&frame(&Command::Unsubscribe), env.now()).is_err());
    assert!(session.tick(env.at(Duration::from_secs(60))).is_empty());
}
