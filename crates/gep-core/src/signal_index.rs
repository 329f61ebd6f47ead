//! Building, publishing and shipping signal index caches.
//!
//! The wire form and the lookup structure live in
//! [`gep_proto::SignalIndexCache`]. This module adds what needs policy or
//! state:
//!
//! - [`build_signal_index_cache`] filters a request through an
//!   authorization predicate.
//! - [`ActiveSignalIndex`] is the atomically swapped "current cache" shared
//!   by the encode and decode paths.
//! - [`encode_cache_payload`] / [`decode_cache_payload`] apply GZip when the
//!   operational modes ask for it.

use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwapOption;
use gep_proto::{OperationalModes, ProtocolError, SignalId, SignalIndexCache};
use uuid::Uuid;

use crate::{
    compression::{gzip_compress, gzip_decompress},
    error::SessionError,
};

/// Build the cache for one subscription request.
///
/// Requested identifiers are visited in order. Each distinct identifier is
/// passed to `authorize` exactly once: allowed identifiers get the next
/// dense index, the rest land in the denied list. Nil identifiers are
/// skipped entirely and requests beyond
/// [`SignalIndexCache::MAX_SIGNALS`] allowed identifiers are denied.
///
/// # Errors
///
/// Only fails if the resulting cache violates its own invariants, which the
/// filtering above rules out.
pub fn build_signal_index_cache<F>(
    subscriber_id: Uuid,
    requested: &[SignalId],
    mut authorize: F,
) -> Result<SignalIndexCache, ProtocolError>
where
    F: FnMut(&SignalId) -> bool,
{
    let mut seen = HashSet::with_capacity(requested.len());
    let mut allowed = Vec::new();
    let mut denied = Vec::new();

    for signal in requested {
        if signal.is_nil() {
            tracing::debug!(%subscriber_id, "ignoring nil signal identifier");
            continue;
        }
        if !seen.insert(*signal) {
            continue;
        }

        if authorize(signal) && allowed.len() < SignalIndexCache::MAX_SIGNALS {
            allowed.push(*signal);
        } else {
            denied.push(*signal);
        }
    }

    SignalIndexCache::new(subscriber_id, allowed, denied)
}

/// Atomically replaceable reference to the current cache.
///
/// Writers replace the whole cache; readers take one load and keep using
/// that snapshot for the packet they are working on.
#[derive(Debug, Clone, Default)]
pub struct ActiveSignalIndex {
    slot: Arc<ArcSwapOption<SignalIndexCache>>,
}

impl ActiveSignalIndex {
    /// Empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache, returning the previous one.
    pub fn install(&self, cache: SignalIndexCache) -> Option<Arc<SignalIndexCache>> {
        self.slot.swap(Some(Arc::new(cache)))
    }

    /// Current cache
    #[must_use]
    pub fn load(&self) -> Option<Arc<SignalIndexCache>> {
        self.slot.load_full()
    }

    /// Remove the cache.
    pub fn clear(&self) {
        self.slot.store(None);
    }
}

/// Serialize a cache for `UpdateSignalIndexCache`.
///
/// # Errors
///
/// Returns a compression error if GZip fails.
pub fn encode_cache_payload(cache: &SignalIndexCache, modes: OperationalModes) -> Result<Vec<u8>, SessionError> {
    let mut raw = Vec::with_capacity(24 + cache.len() * 18 + cache.denied().len() * 16);
    cache.encode(&mut raw);

    if modes.gzip_signal_index_cache() {
        Ok(gzip_compress(&raw)?)
    } else {
        Ok(raw)
    }
}

/// Parse an `UpdateSignalIndexCache` payload.
///
/// # Errors
///
/// Returns a compression error for a bad GZip wrapper or a protocol error for
/// a malformed cache.
pub fn decode_cache_payload(payload: &[u8], modes: OperationalModes, limit: usize) -> Result<SignalIndexCache, SessionError> {
    if modes.gzip_signal_index_cache() {
        let raw = gzip_decompress(payload, limit)?;
        Ok(SignalIndexCache::decode(&raw)?)
    } else {
        Ok(SignalIndexCache::decode(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use gep_proto::CompressionModes;

    use super::*;
    use crate::compression::DEFAULT_DECOMPRESS_LIMIT;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn denied_signals_get_no_index() {
        let cache = build_signal_index_cache(id(99), &[id(1), id(2), id(3), id(4)], |s| s.as_u128() % 2 == 1).unwrap();

        assert_eq!(cache.signals(), &[id(1), id(3)]);
        assert_eq!(cache.index_of(&id(3)), Some(1));
        assert_eq!(cache.denied(), &[id(2), id(4)]);
        assert_eq!(cache.index_of(&id(2)), None);
    }

    #[test]
    fn predicate_called_once_per_identifier() {
        let mut calls = Vec::new();
        let cache = build_signal_index_cache(id(99), &[id(1), id(2), id(1), id(0), id(2)], |s| {
            calls.push(*s);
            true
        })
        .unwrap();

        assert_eq!(calls, vec![id(1), id(2)]);
        assert_eq!(cache.signals(), &[id(1), id(2)]);
        assert!(cache.denied().is_empty());
    }

    #[test]
    fn active_index_swaps_whole_caches() {
        let active = ActiveSignalIndex::new();
        assert!(active.load().is_none());

        let first = build_signal_index_cache(id(9), &[id(1)], |_| true).unwrap();
        assert!(active.install(first).is_none());
        let reader = active.load().unwrap();

        let second = build_signal_index_cache(id(9), &[id(2), id(3)], |_| true).unwrap();
        let previous = active.install(second).unwrap();

        assert_eq!(previous.signals(), &[id(1)]);
        assert_eq!(reader.signals(), &[id(1)]);
        assert_eq!(active.load().unwrap().len(), 2);

        active.clear();
        assert!(active.load().is_none());
    }

    #[test]
    fn payload_honors_gzip_modes() {
        let cache = build_signal_index_cache(id(9), &(1..50).map(id).collect::<Vec<_>>(), |_| true).unwrap();

        let plain = OperationalModes::empty();
        let gzip = (OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE).with_compression(CompressionModes::GZIP);

        let raw = encode_cache_payload(&cache, plain).unwrap();
        let packed = encode_cache_payload(&cache, gzip).unwrap();
        assert_ne!(raw, packed);
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);

        assert_eq!(decode_cache_payload(&raw, plain, DEFAULT_DECOMPRESS_LIMIT).unwrap(), cache);
        assert_eq!(decode_cache_payload(&packed, gzip, DEFAULT_DECOMPRESS_LIMIT).unwrap(), cache);
        assert!(decode_cache_payload(&raw, gzip, DEFAULT_DECOMPRESS_LIMIT).is_err());
    }
}
