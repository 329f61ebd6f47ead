//! Reliable, ordered delivery of buffer blocks.
//!
//! Buffer blocks are raw payloads that bypass the measurement codecs. They
//! travel as `BufferBlock` responses and the subscriber confirms each one.
//!
//! # Sender
//!
//! [`BufferBlockSender`] numbers blocks from 0 and keeps every unconfirmed
//! block at position `sequence - first_unconfirmed`. Confirming the head
//! trims the leading confirmed slots. Confirming a later block means earlier
//! ones were probably lost, so they are resent at once. A timer resends all
//! unconfirmed blocks when nothing was sent for the retransmission timeout.
//!
//! # Receiver
//!
//! [`BufferBlockReceiver`] confirms every arrival, delivers in sequence
//! order exactly once, and parks early arrivals in a bounded pending list
//! until the gap before them closes.
//!
//! # Invariants
//!
//! - Delivery order at the receiver equals sequence order.
//! - No sequence is delivered twice.
//! - Pending memory is bounded by `max_pending` slots; blocks further ahead
//!   are dropped (and reported) so the sender's timer resends them later.

use std::{collections::VecDeque, ops::Sub, time::Duration};

use bytes::Bytes;
use gep_proto::payloads::BufferBlock;

use crate::env::elapsed;

/// Default receiver pending-list bound
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Send side of one subscription's buffer block stream
#[derive(Debug)]
pub struct BufferBlockSender<I> {
    next_sequence: u32,
    first_unconfirmed: u32,
    unconfirmed: VecDeque<Option<BufferBlock>>,
    retransmit_timeout: Duration,
    last_send: Option<I>,
}

impl<I> BufferBlockSender<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Sender starting at sequence 0
    #[must_use]
    pub fn new(retransmit_timeout: Duration) -> Self {
        Self {
            next_sequence: 0,
            first_unconfirmed: 0,
            unconfirmed: VecDeque::new(),
            retransmit_timeout,
            last_send: None,
        }
    }

    /// Sequence the next block will carry
    #[must_use]
    pub const fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Number of blocks awaiting confirmation
    #[must_use]
    pub fn unconfirmed(&self) -> usize {
        self.unconfirmed.iter().flatten().count()
    }

    /// Number and retain a new block. The caller sends the returned block.
    pub fn send(&mut self, runtime_index: u16, data: Bytes, now: I) -> BufferBlock {
        let block = BufferBlock { sequence: self.next_sequence, runtime_index, data };
        self.unconfirmed.push_back(Some(block.clone()));
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.last_send = Some(now);
        block
    }

    /// Record a confirmation, returning blocks to resend.
    ///
    /// Stale and repeated confirmations are ignored.
    pub fn confirm(&mut self, sequence: u32) -> Vec<BufferBlock> {
        let offset = sequence.wrapping_sub(self.first_unconfirmed) as usize;
        let Some(slot) = self.unconfirmed.get_mut(offset) else {
            tracing::trace!(sequence, "ignoring confirmation outside the unconfirmed window");
            return Vec::new();
        };
        if slot.take().is_none() {
            return Vec::new();
        }

        if offset == 0 {
            while matches!(self.unconfirmed.front(), Some(None)) {
                self.unconfirmed.pop_front();
                self.first_unconfirmed = self.first_unconfirmed.wrapping_add(1);
            }
            return Vec::new();
        }

        let resend: Vec<_> = self.unconfirmed.iter().take(offset).flatten().cloned().collect();
        if !resend.is_empty() {
            tracing::debug!(sequence, count = resend.len(), "resending blocks skipped by confirmation");
        }
        resend
    }

    /// Resend everything unconfirmed if the retransmission timeout elapsed
    /// since the last send.
    pub fn poll_retransmit(&mut self, now: I) -> Vec<BufferBlock> {
        let Some(last) = self.last_send else {
            return Vec::new();
        };
        if elapsed(last, now) < self.retransmit_timeout {
            return Vec::new();
        }

        let resend: Vec<_> = self.unconfirmed.iter().flatten().cloned().collect();
        if !resend.is_empty() {
            self.last_send = Some(now);
            tracing::debug!(count = resend.len(), "buffer block retransmission timer fired");
        }
        resend
    }
}

/// Outcome of one arrival at the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Sequence to confirm (always the arriving block's)
    pub confirm: u32,
    /// Blocks now deliverable, in order
    pub delivered: Vec<BufferBlock>,
    /// Block was dropped because it was too far ahead
    pub overflow: bool,
}

/// Receive side of one subscription's buffer block stream
#[derive(Debug)]
pub struct BufferBlockReceiver {
    expected: u32,
    pending: VecDeque<Option<BufferBlock>>,
    max_pending: usize,
}

impl BufferBlockReceiver {
    /// Receiver expecting sequence 0
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self { expected: 0, pending: VecDeque::new(), max_pending: max_pending.max(1) }
    }

    /// Next sequence to deliver
    #[must_use]
    pub const fn expected(&self) -> u32 {
        self.expected
    }

    /// Blocks parked behind a gap
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.iter().flatten().count()
    }

    /// Start over at sequence 0 (new subscription).
    pub fn reset(&mut self) {
        self.expected = 0;
        self.pending.clear();
    }

    /// Accept one arrival.
    pub fn receive(&mut self, block: BufferBlock) -> Receipt {
        let confirm = block.sequence;
        #[allow(clippy::cast_possible_wrap)]
        let distance = block.sequence.wrapping_sub(self.expected) as i32;

        if distance < 0 {
            tracing::trace!(sequence = confirm, expected = self.expected, "discarding duplicate buffer block");
            return Receipt { confirm, delivered: Vec::new(), overflow: false };
        }

        #[allow(clippy::cast_sign_loss)]
        let offset = distance as usize;
        if offset >= self.max_pending {
            tracing::warn!(sequence = confirm, expected = self.expected, "buffer block too far ahead, dropping");
            return Receipt { confirm, delivered: Vec::new(), overflow: true };
        }

        if offset > 0 {
            if self.pending.len() <= offset {
                self.pending.resize(offset + 1, None);
            }
            if self.pending[offset].is_none() {
                self.pending[offset] = Some(block);
            }
            return Receipt { confirm, delivered: Vec::new(), overflow: false };
        }

        self.pending.pop_front();
        let mut delivered = vec![block];
        self.expected = self.expected.wrapping_add(1);

        while let Some(Some(_)) = self.pending.front() {
            if let Some(Some(next)) = self.pending.pop_front() {
                delivered.push(next);
                self.expected = self.expected.wrapping_add(1);
            }
        }

        Receipt { confirm, delivered, overflow: false }
    }
}

impl Default for BufferBlockReceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
