//! Signal index cache: dense 16-bit runtime indices for signal identifiers.
//!
//! Wire layout (before optional GZip):
//!
//! ```text
//! [subscriber_id:16][count: u32 BE]
//! count  x [runtime_index: u16 BE][signal_id:16]
//! [denied_count: u32 BE]
//! denied x [signal_id:16]
//! ```

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::{
    SignalId,
    errors::{ProtocolError, Result},
};

/// Immutable mapping between signal identifiers and runtime indices
///
/// # Invariants
///
/// - Indices are dense: the signal at position `i` has runtime index `i`.
/// - Every allowed signal appears once; the nil identifier never appears.
/// - Denied signals have no index.
///
/// A cache is never patched. Resubscription builds a new one and swaps it in
/// whole.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalIndexCache {
    subscriber_id: Uuid,
    signals: Vec<SignalId>,
    indices: HashMap<SignalId, u16>,
    denied: Vec<SignalId>,
}

impl SignalIndexCache {
    /// Largest number of indexed signals (runtime indices are `u16`)
    pub const MAX_SIGNALS: usize = u16::MAX as usize + 1;

    /// Create a cache from already-filtered parts.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateSignal`] for a repeated or nil
    /// identifier and [`ProtocolError::LengthOutOfRange`] for more than
    /// [`SignalIndexCache::MAX_SIGNALS`] signals.
    pub fn new(subscriber_id: Uuid, signals: Vec<SignalId>, denied: Vec<SignalId>) -> Result<Self> {
        if signals.len() > Self::MAX_SIGNALS {
            return Err(ProtocolError::LengthOutOfRange {
                context: "signal index cache",
                length: signals.len(),
                min: 0,
                max: Self::MAX_SIGNALS,
            });
        }

        let mut indices = HashMap::with_capacity(signals.len());
        for (position, id) in signals.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let index = position as u16;
            if id.is_nil() || indices.insert(*id, index).is_some() {
                return Err(ProtocolError::DuplicateSignal(*id));
            }
        }

        Ok(Self { subscriber_id, signals, indices, denied })
    }

    /// Subscriber the cache was built for
    #[must_use]
    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    /// Runtime index of `signal_id`
    #[must_use]
    pub fn index_of(&self, signal_id: &SignalId) -> Option<u16> {
        self.indices.get(signal_id).copied()
    }

    /// Signal identifier for `index`
    #[must_use]
    pub fn signal_id(&self, index: u16) -> Option<SignalId> {
        self.signals.get(usize::from(index)).copied()
    }

    /// Whether `signal_id` is authorized in this cache
    #[must_use]
    pub fn contains(&self, signal_id: &SignalId) -> bool {
        self.indices.contains_key(signal_id)
    }

    /// Authorized signals in runtime-index order
    #[must_use]
    pub fn signals(&self) -> &[SignalId] {
        &self.signals
    }

    /// Requested signals that were not authorized
    #[must_use]
    pub fn denied(&self) -> &[SignalId] {
        &self.denied
    }

    /// Number of indexed signals
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether no signal is indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Serialize into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.subscriber_id.as_bytes());

        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(self.signals.len() as u32);
        for (position, id) in self.signals.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            dst.put_u16(position as u16);
            dst.put_slice(id.as_bytes());
        }

        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(self.denied.len() as u32);
        for id in &self.denied {
            dst.put_slice(id.as_bytes());
        }
    }

    /// Parse a serialized cache.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated input, non-dense indices or duplicate
    /// signals.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let subscriber_id = take_uuid(&mut src)?;

        let count = take_u32(&mut src)? as usize;
        if count > Self::MAX_SIGNALS {
            return Err(ProtocolError::LengthOutOfRange {
                context: "signal index cache",
                length: count,
                min: 0,
                max: Self::MAX_SIGNALS,
            });
        }
        ensure_remaining(src, count * 18)?;

        let mut signals = Vec::with_capacity(count);
        for position in 0..count {
            let index = src.get_u16();
            if usize::from(index) != position {
                return Err(ProtocolError::NonDenseIndex { position, actual: index });
            }
            signals.push(take_uuid(&mut src)?);
        }

        let denied_count = take_u32(&mut src)? as usize;
        ensure_remaining(src, denied_count.saturating_mul(16))?;
        let denied = (0..denied_count).map(|_| take_uuid(&mut src)).collect::<Result<_>>()?;

        Self::new(subscriber_id, signals, denied)
    }
}

fn ensure_remaining(src: &[u8], needed: usize) -> Result<()> {
    if src.len() < needed {
        return Err(ProtocolError::PayloadTooShort {
            context: "signal index cache",
            expected: needed,
            actual: src.len(),
        });
    }
    Ok(())
}

fn take_u32(src: &mut &[u8]) -> Result<u32> {
    ensure_remaining(src, 4)?;
    Ok(src.get_u32())
}

fn take_uuid(src: &mut &[u8]) -> Result<Uuid> {
    ensure_remaining(src, 16)?;
    let mut id = [0u8; 16];
    src.copy_to_slice(&mut id);
    Ok(Uuid::from_bytes(id))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn lookups_are_bidirectional() {
        let cache = SignalIndexCache::new(id(99), vec![id(5), id(7)], vec![id(6)]).unwrap();

        assert_eq!(cache.index_of(&id(5)), Some(0));
        assert_eq!(cache.index_of(&id(7)), Some(1));
        assert_eq!(cache.index_of(&id(6)), None);
        assert_eq!(cache.signal_id(1), Some(id(7)));
        assert_eq!(cache.signal_id(2), None);
        assert_eq!(cache.denied(), &[id(6)]);
    }

    #[test]
    fn layout() {
        let cache = SignalIndexCache::new(Uuid::nil(), vec![id(1)], vec![id(2)]).unwrap();
        let mut buf = Vec::new();
        cache.encode(&mut buf);

        assert_eq!(buf.len(), 16 + 4 + 18 + 4 + 16);
        assert_eq!(&buf[16..20], &[0, 0, 0, 1]);
        assert_eq!(&buf[20..22], &[0, 0]);
        assert_eq!(&buf[38..42], &[0, 0, 0, 1]);
    }

    #[test]
    fn duplicates_and_nil_are_rejected() {
        assert_eq!(
            SignalIndexCache::new(id(1), vec![id(2), id(2)], vec![]),
            Err(ProtocolError::DuplicateSignal(id(2)))
        );
        assert_eq!(
            SignalIndexCache::new(id(1), vec![Uuid::nil()], vec![]),
            Err(ProtocolError::DuplicateSignal(Uuid::nil()))
        );
    }

    #[test]
    fn sparse_indices_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(id(1).as_bytes());
        buf.put_u32(1);
        buf.put_u16(4);
        buf.extend_from_slice(id(2).as_bytes());
        buf.put_u32(0);

        assert_eq!(
            SignalIndexCache::decode(&buf),
            Err(ProtocolError::NonDenseIndex { position: 0, actual: 4 })
        );
    }

    #[test]
    fn huge_count_does_not_allocate() {
        let mut buf = Vec::new();
        buf.extend_from_slice(id(1).as_bytes());
        buf.put_u32(60_000);

        assert!(matches!(
            SignalIndexCache::decode(&buf),
            Err(ProtocolError::PayloadTooShort { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_restores_cache(ids in prop::collection::hash_set(1u128.., 0..40), denied in prop::collection::vec(any::<u128>(), 0..5)) {
            let signals: Vec<_> = ids.into_iter().map(Uuid::from_u128).collect();
            let denied: Vec<_> = denied.into_iter().map(Uuid::from_u128).collect();
            let cache = SignalIndexCache::new(id(42), signals, denied).unwrap();

            let mut buf = Vec::new();
            cache.encode(&mut buf);
            prop_assert_eq!(SignalIndexCache::decode(&buf).unwrap(), cache);
        }
    }
}
