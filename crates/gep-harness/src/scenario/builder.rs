//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern.

use std::time::Duration;

use bytes::Bytes;
use gep_core::{
    ConnectionSecurity, Environment, Publisher, PublisherConfig, SessionContext, Subscriber, SubscriberConfig,
    SubscriptionSettings,
};
use gep_proto::{DataPacketFlags, Measurement, SignalId};

use crate::scenario::{OracleFn, World, clock::ManualEnv};

/// One scripted step, run after the subscriber connected.
enum Step {
    Publish(Vec<Measurement>),
    BufferBlock(SignalId, Bytes),
    Notify(String),
    Advance(Duration),
    Resubscribe(SubscriptionSettings, DataPacketFlags),
}

/// Scenario builder.
///
/// Configure both ends, script the steps, then add an oracle.
pub struct Scenario {
    seed: u64,
    context: SessionContext,
    security: ConnectionSecurity,
    subscriber_config: SubscriberConfig,
    settings: SubscriptionSettings,
    flags: DataPacketFlags,
    steps: Vec<Step>,
}

impl Scenario {
    /// Create a new scenario with default configuration.
    pub fn new() -> Self {
        Self {
            seed: 0,
            context: SessionContext::new(PublisherConfig::default()),
            security: ConnectionSecurity::default(),
            subscriber_config: SubscriberConfig::default(),
            settings: SubscriptionSettings::default(),
            flags: DataPacketFlags::COMPACT,
            steps: Vec::new(),
        }
    }

    /// Seed for the shared RNG.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Configure the publisher.
    pub fn with_publisher_config(mut self, config: PublisherConfig) -> Self {
        self.context.config = std::sync::Arc::new(config);
        self
    }

    /// Replace the whole publisher context (authorizer, metadata).
    pub fn with_context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    /// Identity the transport reports for the connection.
    pub fn with_security(mut self, security: ConnectionSecurity) -> Self {
        self.security = security;
        self
    }

    /// Configure the subscriber.
    pub fn with_subscriber_config(mut self, config: SubscriberConfig) -> Self {
        self.subscriber_config = config;
        self
    }

    /// Subscription requested on connect.
    pub fn with_subscription(mut self, settings: SubscriptionSettings, flags: DataPacketFlags) -> Self {
        self.settings = settings;
        self.flags = flags;
        self
    }

    /// Publish one measurement batch.
    pub fn publish(mut self, measurements: Vec<Measurement>) -> Self {
        self.steps.push(Step::Publish(measurements));
        self
    }

    /// Send a buffer block.
    pub fn buffer_block(mut self, signal_id: SignalId, data: impl Into<Bytes>) -> Self {
        self.steps.push(Step::BufferBlock(signal_id, data.into()));
        self
    }

    /// Broadcast a notification.
    pub fn notify(mut self, text: impl Into<String>) -> Self {
        self.steps.push(Step::Notify(text.into()));
        self
    }

    /// Advance both clocks, then tick the publisher and the subscriber.
    pub fn advance(mut self, by: Duration) -> Self {
        self.steps.push(Step::Advance(by));
        self
    }

    /// Resubscribe with new settings.
    pub fn resubscribe(mut self, settings: SubscriptionSettings, flags: DataPacketFlags) -> Self {
        self.steps.push(Step::Resubscribe(settings, flags));
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Connects the subscriber, lets the connect sequence settle, runs every
    /// step in order with the pipes drained after each, and finally invokes
    /// the oracle.
    pub fn run(self) -> Result<(), String> {
        let Scenario { seed, context, security, subscriber_config, settings, flags, steps } = self.scenario;

        let env = ManualEnv::with_seed(seed);
        let publisher = Publisher::new(env.clone(), context);
        let subscriber = Subscriber::new(env.clone(), subscriber_config, settings, flags)
            .map_err(|e| format!("subscriber rejected its configuration: {e}"))?;
        let mut world = World::new(env.clone(), publisher, subscriber, security);

        let actions = world.subscriber_mut().connect(env.now()).map_err(|e| format!("connect failed: {e}"))?;
        world.route_subscriber(actions)?;
        world.pump()?;

        for step in steps {
            Self::execute(&mut world, &env, step)?;
            world.pump()?;
        }

        (self.oracle)(&world)
    }

    fn execute(world: &mut World, env: &ManualEnv, step: Step) -> Result<(), String> {
        let now = env.now();
        match step {
            Step::Publish(batch) => {
                let actions = world.publisher_mut().publish(&batch, now);
                world.route_publisher(actions)
            },
            Step::BufferBlock(signal_id, data) => {
                let id = world.connection();
                let actions = world
                    .publisher_mut()
                    .publish_buffer_block(id, signal_id, data, now)
                    .map_err(|e| format!("buffer block rejected: {e}"))?;
                world.route_publisher(actions)
            },
            Step::Notify(text) => {
                let actions = world.publisher_mut().notify_all(&text);
                world.route_publisher(actions)
            },
            Step::Advance(by) => {
                env.advance(by);
                let now = env.now();
                let actions = world.publisher_mut().tick(now);
                world.route_publisher(actions)?;
                let actions = world.subscriber_mut().tick(now);
                world.route_subscriber(actions)
            },
            Step::Resubscribe(settings, flags) => {
                let action = world
                    .subscriber_mut()
                    .resubscribe(settings, flags)
                    .map_err(|e| format!("resubscribe failed: {e}"))?;
                world.route_subscriber(vec![action])
            },
        }
    }
}
