//! Determinism tests.
//!
//! Verifies that scenarios and Turmoil simulations produce identical results
//! across multiple runs with the same seeds.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use gep_core::{
    ConnectionSecurity, Publisher, PublisherConfig, SessionContext, Subscriber, SubscriberAction, SubscriberConfig,
    SubscriptionSettings, env::Environment,
};
use gep_harness::{PublisherHost, SimEnv, SimTransport, SubscriberLink, scenario::Scenario, sim_env::SIM_EPOCH};
use gep_proto::{DataPacketFlags, Measurement, OperationalModes, Ticks};
use uuid::Uuid;

/// Captured outcome of a scenario run
#[derive(Debug, Clone, PartialEq)]
struct ScenarioOutcome {
    measurements: Vec<Measurement>,
    commands_sent: usize,
    responses_sent: usize,
    bytes_sent: u64,
}

fn encrypted_scenario(seed: u64) -> ScenarioOutcome {
    let captured = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);

    let signals: Vec<_> = (1..=3u128).map(Uuid::from_u128).collect();
    let batch: Vec<_> = signals
        .iter()
        .enumerate()
        .map(|(i, id)| Measurement::new(*id, i as f64 + 0.25, Ticks(SIM_EPOCH.0 + 5_000)))
        .collect();
    let config = SubscriberConfig {
        operational_modes: OperationalModes::from_u32(0x0000_0200) | OperationalModes::COMPRESS_PAYLOAD_DATA,
        ..SubscriberConfig::default()
    };

    Scenario::new()
        .with_seed(seed)
        .with_publisher_config(PublisherConfig { encrypt_payload: true, ..PublisherConfig::default() })
        .with_subscriber_config(config)
        .with_subscription(SubscriptionSettings { signals, ..SubscriptionSettings::default() }, DataPacketFlags::COMPACT)
        .publish(batch.clone())
        .advance(Duration::from_secs(3))
        .publish(batch)
        .oracle(Box::new(move |world| {
            *sink.lock().unwrap() = Some(ScenarioOutcome {
                measurements: world.measurements().to_vec(),
                commands_sent: world.commands_sent(),
                responses_sent: world.responses_sent(),
                bytes_sent: world.session().map_or(0, |s| s.bytes_sent()),
            });
            Ok(())
        }))
        .run()
        .expect("scenario should succeed");

    let outcome = captured.lock().unwrap().clone().expect("oracle should have captured state");
    outcome
}

#[test]
fn scenario_determinism_encrypted_stream() {
    let first = encrypted_scenario(42);
    assert_eq!(first.measurements.len(), 6);

    for run in 1..10 {
        assert_eq!(encrypted_scenario(42), first, "run {run} produced different results than run 0");
    }
}

/// Run a Turmoil simulation and return what the subscriber received.
fn simulated_stream(seed: u64) -> Vec<(u128, Ticks)> {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(20)).rng_seed(seed).build();

    sim.host("publisher", move || async move {
        let env = SimEnv::with_seed(seed);
        let publisher = Publisher::new(env.clone(), SessionContext::new(PublisherConfig::default()));
        let (host, _events) = PublisherHost::new(env.clone(), publisher);

        let transport = SimTransport::bind("0.0.0.0:7165").await?;
        let server = host.clone();
        tokio::spawn(async move { server.serve(transport, ConnectionSecurity::default()).await });

        loop {
            env.sleep(Duration::from_millis(50)).await;
            let now = env.wall_clock();
            host.publish(&[Measurement::new(Uuid::from_u128(1), 1.0, now)]);
        }
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    sim.client("subscriber", async move {
        let env = SimEnv::with_seed(seed + 1);
        env.sleep(Duration::from_millis(10)).await;

        let settings = SubscriptionSettings { signals: vec![Uuid::from_u128(1)], ..SubscriptionSettings::default() };
        let subscriber = Subscriber::new(env.clone(), SubscriberConfig::default(), settings, DataPacketFlags::COMPACT)?;
        let remote = SocketAddr::new(turmoil::lookup("publisher"), 7165);
        let mut link = SubscriberLink::new(
            env,
            subscriber,
            SimTransport::client(),
            remote,
            Duration::from_millis(250),
            Duration::from_secs(1),
        );
        link.connect().await?;

        while sink.lock().unwrap().len() < 25 {
            if let SubscriberAction::Measurements(batch) = link.next_event().await? {
                sink.lock().unwrap().extend(batch.iter().map(|m| (m.signal_id.as_u128(), m.timestamp)));
            }
        }
        Ok(())
    });

    sim.run().expect("simulation failed");
    let stream = received.lock().unwrap().clone();
    stream
}

#[test]
fn simulation_determinism_same_seed() {
    let first = simulated_stream(7);
    assert!(first.len() >= 25);
    assert!(first.windows(2).all(|w| w[0].1 < w[1].1), "timestamps must increase");

    for run in 1..5 {
        assert_eq!(simulated_stream(7), first, "run {run} diverged");
    }
}
