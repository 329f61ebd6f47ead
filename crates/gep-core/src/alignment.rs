//! Time alignment for synchronized subscriptions.
//!
//! A synchronized subscription hands measurements to a [`FrameSink`] in
//! arrival order and publishes whatever frames the sink releases, one
//! synchronized data packet per frame. The sink decides when a frame is
//! complete; [`LagTimeAligner`] simply waits a fixed lag.

use std::collections::BTreeMap;

use gep_proto::{Measurement, Ticks};

/// Measurements sharing one timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFrame {
    /// Frame timestamp
    pub timestamp: Ticks,
    /// Measurements in arrival order
    pub measurements: Vec<Measurement>,
}

/// Pluggable frame concentrator
pub trait FrameSink: Send + std::fmt::Debug {
    /// Accept one measurement in arrival order.
    fn push(&mut self, measurement: Measurement);

    /// Frames ready at wall-clock time `now`, oldest first.
    fn release(&mut self, now: Ticks) -> Vec<AlignedFrame>;
}

/// Groups by timestamp and releases frames older than `lag`.
///
/// Measurements for a frame that was already released are dropped.
#[derive(Debug, Clone)]
pub struct LagTimeAligner {
    lag: Ticks,
    frames: BTreeMap<Ticks, Vec<Measurement>>,
    released_through: Option<Ticks>,
    late: u64,
}

impl LagTimeAligner {
    /// Aligner holding frames for `lag`
    #[must_use]
    pub fn new(lag: std::time::Duration) -> Self {
        Self { lag: Ticks::from_duration(lag), frames: BTreeMap::new(), released_through: None, late: 0 }
    }

    /// Measurements dropped for arriving after their frame was released
    #[must_use]
    pub const fn late_measurements(&self) -> u64 {
        self.late
    }

    /// Frames still waiting
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSink for LagTimeAligner {
    fn push(&mut self, measurement: Measurement) {
        if self.released_through.is_some_and(|through| measurement.timestamp <= through) {
            self.late += 1;
            tracing::trace!(timestamp = measurement.timestamp.0, "dropping late measurement");
            return;
        }
        self.frames.entry(measurement.timestamp).or_default().push(measurement);
    }

    fn release(&mut self, now: Ticks) -> Vec<AlignedFrame> {
        let cutoff = Ticks(now.0.saturating_sub(self.lag.0));
        let keep = self.frames.split_off(&Ticks(cutoff.0.saturating_add(1)));
        let ready = std::mem::replace(&mut self.frames, keep);

        if let Some((&last, _)) = ready.last_key_value() {
            self.released_through = Some(last);
        }
        ready.into_iter().map(|(timestamp, measurements)| AlignedFrame { timestamp, measurements }).collect()
    }
}
