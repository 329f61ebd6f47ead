//! Per-connection subscription state.
//!
//! A [`Subscription`] owns everything a publisher needs to turn a batch of
//! measurements into data packets for one client: the active signal index
//! cache, base times for compact timestamps, the packet encoder (codec and
//! nonce counter), the buffer block sender and, for synchronized
//! subscriptions, the frame sink.
//!
//! # Invariants
//!
//! - **Filter**: only measurements whose signal has a runtime index in the
//!   active cache are ever encoded
//! - **Start Time**: `DataStartTime` is reported once per subscribe, before
//!   the first data packet

use std::{ops::Sub, time::Duration};

use bytes::Bytes;
use gep_proto::{
    BaseTimeOffsets, CompactContext, Measurement, MeasurementFormat, ProtocolError, SignalId,
    SignalIndexCache, Ticks, payloads::BufferBlock,
};

use crate::{
    alignment::{AlignedFrame, FrameSink, LagTimeAligner},
    buffer_block::BufferBlockSender,
    cipher::CipherKeys,
    compression::CompressionEncoder,
    config::SubscriptionSettings,
    data_packet::DataPacketEncoder,
    env::elapsed,
    error::SessionError,
    signal_index::ActiveSignalIndex,
};

/// Base-time interval for tick offsets
pub const TICK_BASE_TIME_INTERVAL: Duration = Duration::from_secs(420);

/// Base-time interval for millisecond offsets
pub const MILLISECOND_BASE_TIME_INTERVAL: Duration = Duration::from_secs(60);

/// How measurements are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Measurements are published as they arrive
    Unsynchronized,
    /// Measurements are aligned into frames before publishing
    Synchronized,
}

impl SubscriptionKind {
    fn label(self) -> &'static str {
        match self {
            Self::Unsynchronized => "unsynchronized",
            Self::Synchronized => "synchronized",
        }
    }
}

/// Rotating pair of base times for compact timestamps.
#[derive(Debug, Clone)]
pub struct BaseTimeState {
    offsets: Option<BaseTimeOffsets>,
    interval: Ticks,
    next_rotation: Ticks,
}

impl BaseTimeState {
    /// Unrotated state; the interval depends on the offset resolution
    #[must_use]
    pub fn new(millisecond_resolution: bool) -> Self {
        let interval =
            if millisecond_resolution { MILLISECOND_BASE_TIME_INTERVAL } else { TICK_BASE_TIME_INTERVAL };
        Self { offsets: None, interval: Ticks::from_duration(interval), next_rotation: Ticks(0) }
    }

    /// Current offsets, if rotated at least once
    #[must_use]
    pub const fn offsets(&self) -> Option<&BaseTimeOffsets> {
        self.offsets.as_ref()
    }

    /// Whether the next rotation is due at wall-clock `now`
    #[must_use]
    pub fn is_due(&self, now: Ticks) -> bool {
        self.offsets.is_none() || now >= self.next_rotation
    }

    /// Rotate at wall-clock `now`.
    ///
    /// The first rotation fills both slots; later rotations switch to the
    /// slot prepared last time and push the retired slot one interval ahead.
    pub fn rotate(&mut self, now: Ticks) -> BaseTimeOffsets {
        let ahead = Ticks(now.0.saturating_add(self.interval.0));
        let offsets = match self.offsets {
            None => BaseTimeOffsets { time_index: 0, base: [now, ahead] },
            Some(mut offsets) => {
                let retired = offsets.time_index;
                offsets.time_index ^= 1;
                offsets.base[retired] = ahead;
                offsets
            },
        };
        self.offsets = Some(offsets);
        self.next_rotation = ahead;
        offsets
    }
}

/// One client's subscription
pub struct Subscription<I> {
    kind: SubscriptionKind,
    compact: bool,
    settings: SubscriptionSettings,
    signal_index: ActiveSignalIndex,
    base_times: Option<BaseTimeState>,
    encoder: DataPacketEncoder,
    buffer_blocks: BufferBlockSender<I>,
    frame_sink: Option<Box<dyn FrameSink>>,
    processing_interval: i32,
    start_time_sent: bool,
    held: Vec<Measurement>,
    last_publish: Option<I>,
}

impl<I> std::fmt::Debug for Subscription<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("compact", &self.compact)
            .field("signals", &self.signal_index.load().map_or(0, |cache| cache.len()))
            .field("compressed", &self.encoder.is_compressed())
            .field("processing_interval", &self.processing_interval)
            .finish_non_exhaustive()
    }
}

impl<I> Subscription<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// New subscription using `cache`.
    ///
    /// Synchronized subscriptions get a [`LagTimeAligner`] with the
    /// configured lag time unless replaced with [`Self::set_frame_sink`].
    #[must_use]
    pub fn new(
        kind: SubscriptionKind,
        compact: bool,
        settings: SubscriptionSettings,
        cache: SignalIndexCache,
        compressor: Option<CompressionEncoder>,
    ) -> Self {
        let signal_index = ActiveSignalIndex::new();
        signal_index.install(cache);

        let frame_sink: Option<Box<dyn FrameSink>> = match kind {
            SubscriptionKind::Synchronized => Some(Box::new(LagTimeAligner::new(settings.lag_time))),
            SubscriptionKind::Unsynchronized => None,
        };

        Self {
            kind,
            compact,
            base_times: Self::base_times_for(kind, compact, &settings),
            buffer_blocks: BufferBlockSender::new(settings.buffer_block_retransmission_timeout),
            processing_interval: settings.processing_interval,
            settings,
            signal_index,
            encoder: DataPacketEncoder::new(compressor),
            frame_sink,
            start_time_sent: false,
            held: Vec::new(),
            last_publish: None,
        }
    }

    fn base_times_for(
        kind: SubscriptionKind,
        compact: bool,
        settings: &SubscriptionSettings,
    ) -> Option<BaseTimeState> {
        (compact && settings.include_time && kind == SubscriptionKind::Unsynchronized)
            .then(|| BaseTimeState::new(settings.use_millisecond_resolution))
    }

    /// Replace the settings and cache of a same-kind subscription.
    ///
    /// The cache is swapped atomically; readers holding the previous one
    /// finish with it. Codec state restarts and `DataStartTime` is sent
    /// again.
    pub fn update(
        &mut self,
        compact: bool,
        settings: SubscriptionSettings,
        cache: SignalIndexCache,
        compressor: Option<CompressionEncoder>,
    ) {
        self.signal_index.install(cache);
        self.compact = compact;
        self.base_times = Self::base_times_for(self.kind, compact, &settings);
        self.encoder = DataPacketEncoder::new(compressor);
        self.processing_interval = settings.processing_interval;
        if let Some(sink) = &mut self.frame_sink {
            if settings.lag_time != self.settings.lag_time {
                *sink = Box::new(LagTimeAligner::new(settings.lag_time));
            }
        }
        self.settings = settings;
        self.start_time_sent = false;
        self.held.clear();
        self.last_publish = None;
    }

    /// Delivery kind
    #[must_use]
    pub const fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Whether measurements use the compact format
    #[must_use]
    pub const fn is_compact(&self) -> bool {
        self.compact
    }

    /// Parsed subscribe settings
    #[must_use]
    pub const fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// Handle to the active signal index cache
    #[must_use]
    pub const fn signal_index(&self) -> &ActiveSignalIndex {
        &self.signal_index
    }

    /// Requested processing interval in milliseconds (-1 = default)
    #[must_use]
    pub const fn processing_interval(&self) -> i32 {
        self.processing_interval
    }

    /// Change the processing interval.
    pub fn set_processing_interval(&mut self, interval: i32) {
        self.processing_interval = interval;
    }

    /// Replace the frame sink of a synchronized subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] for unsynchronized
    /// subscriptions.
    pub fn set_frame_sink(&mut self, sink: Box<dyn FrameSink>) -> Result<(), SessionError> {
        match &mut self.frame_sink {
            Some(current) => {
                *current = sink;
                Ok(())
            },
            None => Err(SessionError::InvalidState { state: "unsynchronized", operation: "set a frame sink" }),
        }
    }

    /// Human-readable description used in the subscribe response
    #[must_use]
    pub fn describe(&self) -> String {
        let signals = self.signal_index.load().map_or(0, |cache| cache.len());
        format!(
            "Client subscribed as {} {} with {signals} signals.",
            if self.compact { "compact" } else { "non-compact" },
            self.kind.label(),
        )
    }

    /// Measurements this subscription may receive, in input order.
    #[must_use]
    pub fn filter(&self, measurements: &[Measurement]) -> Vec<Measurement> {
        let Some(cache) = self.signal_index.load() else {
            return Vec::new();
        };
        measurements
            .iter()
            .filter(|m| cache.contains(&m.signal_id))
            .filter(|m| !(self.settings.request_nan_value_filter && m.value.is_nan()))
            .copied()
            .collect()
    }

    /// Whether base times are due for rotation at wall-clock `now`
    #[must_use]
    pub fn base_times_due(&self, now: Ticks) -> bool {
        self.base_times.as_ref().is_some_and(|state| state.is_due(now))
    }

    /// Rotate base times, if this subscription uses them.
    pub fn rotate_base_times(&mut self, now: Ticks) -> Option<BaseTimeOffsets> {
        self.base_times.as_mut().map(|state| state.rotate(now))
    }

    /// Take the start time to report, once per subscribe.
    pub fn take_start_time(&mut self, first: Ticks) -> Option<Ticks> {
        if self.start_time_sent {
            return None;
        }
        self.start_time_sent = true;
        Some(first)
    }

    /// Whether the publish interval holds measurements back at `now`.
    ///
    /// Held measurements are flushed by [`Self::take_held`].
    pub fn hold(&mut self, measurements: Vec<Measurement>, now: I) -> Option<Vec<Measurement>> {
        let Some(interval) = self.settings.publish_interval else {
            return Some(measurements);
        };
        self.held.extend(measurements);
        self.take_held(interval, now)
    }

    /// Flush held measurements when the publish interval elapsed.
    pub fn flush_held(&mut self, now: I) -> Option<Vec<Measurement>> {
        let interval = self.settings.publish_interval?;
        if self.held.is_empty() {
            return None;
        }
        self.take_held(interval, now)
    }

    fn take_held(&mut self, interval: Duration, now: I) -> Option<Vec<Measurement>> {
        let due = self.last_publish.is_none_or(|last| elapsed(last, now) >= interval);
        if !due {
            return None;
        }
        self.last_publish = Some(now);
        Some(std::mem::take(&mut self.held))
    }

    /// Feed a synchronized subscription's sink.
    pub fn push_to_sink(&mut self, measurements: &[Measurement]) {
        if let Some(sink) = &mut self.frame_sink {
            for measurement in measurements {
                sink.push(*measurement);
            }
        }
    }

    /// Frames the sink releases at wall-clock `now`
    pub fn release_frames(&mut self, now: Ticks) -> Vec<AlignedFrame> {
        self.frame_sink.as_mut().map(|sink| sink.release(now)).unwrap_or_default()
    }

    /// Encode measurements into data packet payloads.
    ///
    /// `frame_timestamp` marks a synchronized frame.
    ///
    /// # Errors
    ///
    /// Returns an error if no cache is installed, or if encoding,
    /// compression or sealing fails.
    pub fn encode(
        &mut self,
        measurements: &[Measurement],
        frame_timestamp: Option<Ticks>,
        keys: Option<&CipherKeys>,
    ) -> Result<Vec<Bytes>, SessionError> {
        let cache = self.signal_index.load().ok_or(SessionError::InvalidState {
            state: "unsubscribed",
            operation: "encode measurements",
        })?;

        let format = if self.compact {
            MeasurementFormat::Compact(CompactContext {
                cache: &cache,
                base_times: self.base_times.as_ref().and_then(BaseTimeState::offsets),
                include_time: self.settings.include_time && frame_timestamp.is_none(),
                millisecond_resolution: self.settings.use_millisecond_resolution,
            })
        } else {
            MeasurementFormat::Full
        };

        self.encoder.encode(measurements, frame_timestamp, &format, keys)
    }

    /// Queue a buffer block for `signal_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnmappedSignal`] if the signal is not in the
    /// active cache.
    pub fn send_buffer_block(&mut self, signal_id: SignalId, data: Bytes, now: I) -> Result<BufferBlock, SessionError> {
        let index = self
            .signal_index
            .load()
            .and_then(|cache| cache.index_of(&signal_id))
            .ok_or(ProtocolError::UnmappedSignal(signal_id))?;
        Ok(self.buffer_blocks.send(index, data, now))
    }

    /// Apply a buffer block confirmation; returns blocks to resend now.
    pub fn confirm_buffer_block(&mut self, sequence: u32) -> Vec<BufferBlock> {
        self.buffer_blocks.confirm(sequence)
    }

    /// Blocks whose retransmission timer expired at `now`
    pub fn poll_buffer_blocks(&mut self, now: I) -> Vec<BufferBlock> {
        self.buffer_blocks.poll_retransmit(now)
    }

    /// Buffer blocks awaiting confirmation
    #[must_use]
    pub fn unconfirmed_buffer_blocks(&self) -> usize {
        self.buffer_blocks.unconfirmed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use uuid::Uuid;

    use super::*;

    fn cache(ids: &[u128]) -> SignalIndexCache {
        SignalIndexCache::new(Uuid::nil(), ids.iter().map(|id| Uuid::from_u128(*id)).collect(), Vec::new())
            .unwrap()
    }

    fn unsynchronized(settings: SubscriptionSettings) -> Subscription<Instant> {
        Subscription::new(SubscriptionKind::Unsynchronized, true, settings, cache(&[1, 2]), None)
    }

    #[test]
    fn base_times_rotate_into_prepared_slot() {
        let mut state = BaseTimeState::new(false);
        let interval = Ticks::from_duration(TICK_BASE_TIME_INTERVAL).0;

        assert!(state.is_due(Ticks(1_000)));
        let first = state.rotate(Ticks(1_000));
        assert_eq!(first, BaseTimeOffsets { time_index: 0, base: [Ticks(1_000), Ticks(1_000 + interval)] });
        assert!(!state.is_due(Ticks(1_000 + interval - 1)));

        let now = 1_000 + interval;
        let second = state.rotate(Ticks(now));
        assert_eq!(second.time_index, 1);
        assert_eq!(second.base, [Ticks(now + interval), Ticks(1_000 + interval)]);
    }

    #[test]
    fn millisecond_resolution_rotates_every_minute() {
        let mut state = BaseTimeState::new(true);
        state.rotate(Ticks(0));
        assert!(state.is_due(Ticks(60 * Ticks::PER_SECOND)));
        assert!(!state.is_due(Ticks(59 * Ticks::PER_SECOND)));
    }

    #[test]
    fn filter_keeps_authorized_signals_in_order() {
        let subscription = unsynchronized(SubscriptionSettings::default());
        let input = [
            Measurement::new(Uuid::from_u128(2), 1.0, Ticks(1)),
            Measurement::new(Uuid::from_u128(3), 2.0, Ticks(1)),
            Measurement::new(Uuid::from_u128(1), 3.0, Ticks(1)),
        ];
        let kept = subscription.filter(&input);
        assert_eq!(kept, vec![input[0], input[2]]);
    }

    #[test]
    fn nan_filter_is_opt_in() {
        let input = [Measurement::new(Uuid::from_u128(1), f64::NAN, Ticks(1))];
        assert_eq!(unsynchronized(SubscriptionSettings::default()).filter(&input).len(), 1);

        let settings = SubscriptionSettings { request_nan_value_filter: true, ..SubscriptionSettings::default() };
        assert!(unsynchronized(settings).filter(&input).is_empty());
    }

    #[test]
    fn start_time_once_per_subscribe() {
        let mut subscription = unsynchronized(SubscriptionSettings::default());
        assert_eq!(subscription.take_start_time(Ticks(5)), Some(Ticks(5)));
        assert_eq!(subscription.take_start_time(Ticks(6)), None);

        subscription.update(true, SubscriptionSettings::default(), cache(&[1]), None);
        assert_eq!(subscription.take_start_time(Ticks(7)), Some(Ticks(7)));
    }

    #[test]
    fn publish_interval_holds_measurements() {
        let start = Instant::now();
        let settings =
            SubscriptionSettings { publish_interval: Some(Duration::from_secs(1)), ..SubscriptionSettings::default() };
        let mut subscription = unsynchronized(settings);
        let m = Measurement::new(Uuid::from_u128(1), 1.0, Ticks(1));

        assert_eq!(subscription.hold(vec![m], start).map(|b| b.len()), Some(1));
        assert_eq!(subscription.hold(vec![m, m], start + Duration::from_millis(100)), None);
        assert_eq!(subscription.flush_held(start + Duration::from_millis(500)), None);
        assert_eq!(subscription.flush_held(start + Duration::from_secs(1)).map(|b| b.len()), Some(2));
        assert_eq!(subscription.flush_held(start + Duration::from_secs(3)), None);
    }

    #[test]
    fn synchronized_subscriptions_have_no_base_times() {
        let subscription: Subscription<Instant> = Subscription::new(
            SubscriptionKind::Synchronized,
            true,
            SubscriptionSettings::default(),
            cache(&[1]),
            None,
        );
        assert!(!subscription.base_times_due(Ticks(1)));
        assert_eq!(subscription.describe(), "Client subscribed as compact synchronized with 1 signals.");
    }

    #[test]
    fn buffer_blocks_need_a_mapped_signal() {
        let start = Instant::now();
        let mut subscription = unsynchronized(SubscriptionSettings::default());
        let block = subscription.send_buffer_block(Uuid::from_u128(2), Bytes::from_static(b"x"), start).unwrap();
        assert_eq!((block.sequence, block.runtime_index), (0, 1));

        let err = subscription.send_buffer_block(Uuid::from_u128(9), Bytes::new(), start).unwrap_err();
        assert_eq!(err, SessionError::Protocol(ProtocolError::UnmappedSignal(Uuid::from_u128(9))));
    }

    #[test]
    fn frame_sink_only_for_synchronized() {
        let mut subscription = unsynchronized(SubscriptionSettings::default());
        let err = subscription.set_frame_sink(Box::new(LagTimeAligner::new(Duration::ZERO))).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }
}
