//! Scenario tests: publisher and subscriber over in-memory framed pipes,
//! checked by oracles.

use std::time::Duration;

use gep_core::{
    ConnectionSecurity, PublisherConfig, SubscriberConfig, SubscriberState, SubscriptionSettings,
    cipher::SharedSecret,
};
use gep_harness::{
    scenario::{Scenario, oracle},
    sim_env::SIM_EPOCH,
};
use gep_proto::{DataPacketFlags, Measurement, OperationalModes, SecurityMode, SignalId, Ticks};
use uuid::Uuid;

fn signal(n: u128) -> SignalId {
    Uuid::from_u128(n)
}

fn settings(signals: &[u128]) -> SubscriptionSettings {
    SubscriptionSettings { signals: signals.iter().copied().map(signal).collect(), ..SubscriptionSettings::default() }
}

/// Twelve samples across signals 1..=4, stamped near the scenario epoch
fn batch(round: i64) -> Vec<Measurement> {
    (0..12i64)
        .map(|i| {
            let id = signal(u128::try_from(i % 4).unwrap() + 1);
            Measurement::new(id, (round * 100 + i) as f64, Ticks(SIM_EPOCH.0 + round * 1_000_000 + i))
        })
        .collect()
}

#[test]
fn measurements_reach_subscriber() {
    Scenario::new()
        .with_subscription(settings(&[1, 2, 3, 4]), DataPacketFlags::COMPACT)
        .publish(batch(0))
        .publish(batch(1))
        .oracle(oracle::all_of(vec![oracle::subscribed(), oracle::received(24), oracle::no_restarts()]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn unrequested_signals_never_arrive() {
    Scenario::new()
        .with_subscription(settings(&[2, 4]), DataPacketFlags::empty())
        .publish(batch(0))
        .oracle(oracle::all_of(vec![oracle::received(6), oracle::only_signals(vec![signal(2), signal(4)])]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn compressed_encrypted_stream_survives_key_rotation() {
    let config = SubscriberConfig {
        operational_modes: OperationalModes::from_u32(0x0000_0200) | OperationalModes::COMPRESS_PAYLOAD_DATA,
        ..SubscriberConfig::default()
    };

    Scenario::new()
        .with_publisher_config(PublisherConfig { encrypt_payload: true, ..PublisherConfig::default() })
        .with_subscriber_config(config)
        .with_subscription(settings(&[1, 2, 3, 4]), DataPacketFlags::COMPACT)
        .publish(batch(0))
        // Keep data flowing so the subscriber never sees a gap.
        .advance(Duration::from_secs(9))
        .publish(batch(1))
        .advance(Duration::from_secs(9))
        .publish(batch(2))
        .advance(Duration::from_secs(9))
        .publish(batch(3))
        .advance(Duration::from_secs(9))
        .publish(batch(4))
        .advance(Duration::from_secs(9))
        .publish(batch(5))
        .advance(Duration::from_secs(9))
        .publish(batch(6))
        .advance(Duration::from_secs(9))
        .publish(batch(7))
        .oracle(oracle::all_of(vec![
            oracle::no_restarts(),
            oracle::received(96),
            Box::new(|world| {
                let keys = world.subscriber().cipher_keys().ok_or("no cipher keys installed")?;
                // 63 s of virtual time crossed the 60 s rotation period once.
                if keys.active_index() == 1 { Ok(()) } else { Err("keys never rotated".to_string()) }
            }),
        ]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn silence_restarts_and_reconnects() {
    Scenario::new()
        .with_subscription(settings(&[1]), DataPacketFlags::COMPACT)
        .advance(Duration::from_secs(11))
        .publish(batch(0))
        .oracle(oracle::all_of(vec![
            oracle::subscribed(),
            oracle::received(3),
            Box::new(|world| {
                if world.restarts().len() != 1 {
                    return Err(format!("expected one restart, saw {:?}", world.restarts()));
                }
                if world.publisher_disconnects() != 1 {
                    return Err(format!("old connection not closed: {}", world.publisher_disconnects()));
                }
                if world.publisher().connection_count() != 1 {
                    return Err(format!("{} live connections", world.publisher().connection_count()));
                }
                Ok(())
            }),
        ]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn buffer_blocks_are_confirmed() {
    Scenario::new()
        .with_subscription(settings(&[1, 2]), DataPacketFlags::COMPACT)
        .buffer_block(signal(1), b"first".to_vec())
        .buffer_block(signal(2), b"second".to_vec())
        .oracle(oracle::all_of(vec![
            oracle::buffer_blocks_settled(),
            Box::new(|world| {
                let got: Vec<_> = world.buffer_blocks().iter().map(|(seq, data)| (*seq, data.to_vec())).collect();
                if got == vec![(0, b"first".to_vec()), (1, b"second".to_vec())] {
                    Ok(())
                } else {
                    Err(format!("unexpected buffer blocks {got:?}"))
                }
            }),
        ]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn notifications_are_delivered_once() {
    Scenario::new()
        .notify("maintenance at noon")
        .advance(Duration::from_secs(1))
        .oracle(Box::new(|world| {
            if world.notifications() == ["maintenance at noon".to_string()] {
                Ok(())
            } else {
                Err(format!("notifications: {:?}", world.notifications()))
            }
        }))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn gateway_subscriber_with_wrong_key_stays_out() {
    let publisher = PublisherConfig { security_mode: SecurityMode::Gateway, ..PublisherConfig::default() };
    let security = ConnectionSecurity {
        shared_secret: Some(SharedSecret::derive("correct horse").unwrap()),
        auth_key: Some("station-7".to_string()),
        ..ConnectionSecurity::default()
    };
    let subscriber = SubscriberConfig {
        security_mode: SecurityMode::Gateway,
        auth_key: Some("station-9".to_string()),
        shared_secret: Some("correct horse".to_string()),
        ..SubscriberConfig::default()
    };

    Scenario::new()
        .with_publisher_config(publisher)
        .with_security(security)
        .with_subscriber_config(subscriber)
        .with_subscription(settings(&[1]), DataPacketFlags::COMPACT)
        .publish(batch(0))
        .oracle(oracle::all_of(vec![
            oracle::received(0),
            Box::new(|world| {
                if world.subscriber().state() != SubscriberState::Subscribing {
                    return Err(format!("subscriber is {:?}", world.subscriber().state()));
                }
                if world.failures().len() != 2 {
                    return Err(format!("expected two failures, got {:?}", world.failures()));
                }
                Ok(())
            }),
        ]))
        .run()
        .expect("scenario should succeed");
}

#[test]
fn resubscribe_narrows_the_stream() {
    Scenario::new()
        .with_subscription(settings(&[1, 2, 3, 4]), DataPacketFlags::COMPACT)
        .publish(batch(0))
        .resubscribe(settings(&[3]), DataPacketFlags::COMPACT)
        .publish(batch(1))
        .oracle(oracle::all_of(vec![
            oracle::subscribed(),
            oracle::received(15),
            Box::new(|world| {
                let tail = &world.measurements()[12..];
                if tail.iter().all(|m| m.signal_id == signal(3)) {
                    Ok(())
                } else {
                    Err("resubscribe did not narrow the stream".to_string())
                }
            }),
        ]))
        .run()
        .expect("scenario should succeed");
}
