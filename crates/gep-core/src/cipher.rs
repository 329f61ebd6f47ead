//! Payload cipher keys and shared-secret sealing.
//!
//! Data packets are sealed with AES-256-GCM under one of two key/IV
//! generations ("even" = 0, "odd" = 1). The packet's `CIPHER_INDEX` flag names
//! the generation, so a peer that has not yet received the latest rotation
//! can still open packets sealed after it.
//!
//! # Invariants
//!
//! - **Two-Generation Overlap**: a rotation overwrites the active bucket with
//!   fresh material and flips to the other bucket, whose key the peer already
//!   holds. Frames sealed after rotation `k + 1` therefore open with the key
//!   set announced at rotation `k`, even while the newer announcement is
//!   still in flight.
//!
//! - **Atomic Snapshots**: [`CipherKeys`] is immutable. The manager publishes
//!   a new snapshot through [`ArcSwapOption`], so the fan-out path sees either
//!   the old pair of generations or the new one, never a mix.
//!
//! - **Spacing**: rotations closer together than the configured minimum fail
//!   with [`CipherError::RotationTooSoon`] and leave the keys unchanged.
//!
//! # Security
//!
//! - Key material is zeroized on drop and redacted from `Debug`.
//! - Sealed packets carry a 64-bit counter; the nonce is the generation's IV
//!   XORed with that counter, so nonces never repeat under one key as long as
//!   the sender never reuses a counter.

use std::{fmt, ops::Sub, sync::Arc, time::Duration};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use arc_swap::ArcSwapOption;
use bytes::{Buf, BufMut};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    env::{Environment, elapsed},
    error::CipherError,
};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes
pub const IV_SIZE: usize = 12;

/// GCM tag size in bytes
pub const TAG_SIZE: usize = 16;

const COUNTER_SIZE: usize = 8;

/// One key/IV generation
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyIvPair {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl KeyIvPair {
    /// Fresh random material from the environment's entropy source.
    #[must_use]
    pub fn generate(env: &impl Environment) -> Self {
        let mut pair = Self { key: [0; KEY_SIZE], iv: [0; IV_SIZE] };
        env.random_bytes(&mut pair.key);
        env.random_bytes(&mut pair.iv);
        pair
    }

    /// Build from explicit material.
    #[must_use]
    pub const fn from_parts(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }

    fn nonce(&self, counter: u64) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (byte, mask) in nonce[IV_SIZE - COUNTER_SIZE..].iter_mut().zip(counter.to_be_bytes()) {
            *byte ^= mask;
        }
        nonce
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::MalformedKeys("key length"))
    }
}

impl fmt::Debug for KeyIvPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyIvPair(<redacted>)")
    }
}

/// Immutable snapshot of both key generations and the active index
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKeys {
    active: usize,
    sets: [KeyIvPair; 2],
}

impl CipherKeys {
    /// Snapshot from explicit generations.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedKeys`] if `active` is not 0 or 1.
    pub fn new(active: usize, even: KeyIvPair, odd: KeyIvPair) -> Result<Self, CipherError> {
        if active > 1 {
            return Err(CipherError::MalformedKeys("active index"));
        }
        Ok(Self { active, sets: [even, odd] })
    }

    /// Generation new packets are sealed under
    #[must_use]
    pub const fn active_index(&self) -> usize {
        self.active
    }

    /// Seal `plaintext` under the active generation.
    ///
    /// Output: `[counter: u64 BE][ciphertext || tag]`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Seal`] if the AEAD rejects the input.
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.seal_with(self.active, counter, plaintext)
    }

    /// Seal `plaintext` under generation `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedKeys`] for an index other than 0 or 1,
    /// or [`CipherError::Seal`].
    pub fn seal_with(&self, index: usize, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let pair = self.sets.get(index).ok_or(CipherError::MalformedKeys("cipher index"))?;
        let nonce = pair.nonce(counter);
        let sealed = pair.aead()?.encrypt(Nonce::from_slice(&nonce), plaintext).map_err(|_| CipherError::Seal)?;

        let mut out = Vec::with_capacity(COUNTER_SIZE + sealed.len());
        out.put_u64(counter);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a packet sealed under generation `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Open`] if the input is truncated or fails
    /// authentication.
    pub fn open(&self, index: usize, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let pair = self.sets.get(index).ok_or(CipherError::MalformedKeys("cipher index"))?;
        if sealed.len() < COUNTER_SIZE + TAG_SIZE {
            return Err(CipherError::Open);
        }

        let mut src = sealed;
        let counter = src.get_u64();
        let nonce = pair.nonce(counter);
        pair.aead()?.decrypt(Nonce::from_slice(&nonce), src).map_err(|_| CipherError::Open)
    }

    /// Serialize as `[active:1]` then, per generation,
    /// `[key_len: u32 BE][key][iv_len: u32 BE][iv]`.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * (8 + KEY_SIZE + IV_SIZE));
        #[allow(clippy::cast_possible_truncation)]
        out.put_u8(self.active as u8);
        for pair in &self.sets {
            out.put_u32(KEY_SIZE as u32);
            out.put_slice(&pair.key);
            out.put_u32(IV_SIZE as u32);
            out.put_slice(&pair.iv);
        }
        out
    }

    /// Parse a blob written by [`CipherKeys::to_blob`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedKeys`] on truncation, a bad active
    /// index, or key/IV lengths other than 32/12.
    pub fn from_blob(mut src: &[u8]) -> Result<Self, CipherError> {
        if src.is_empty() {
            return Err(CipherError::MalformedKeys("empty"));
        }
        let active = usize::from(src.get_u8());

        let even = take_pair(&mut src)?;
        let odd = take_pair(&mut src)?;
        Self::new(active, even, odd)
    }
}

impl fmt::Debug for CipherKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKeys").field("active", &self.active).finish_non_exhaustive()
    }
}

fn take_pair(src: &mut &[u8]) -> Result<KeyIvPair, CipherError> {
    let key = take_sized::<KEY_SIZE>(src, "key")?;
    let iv = take_sized::<IV_SIZE>(src, "iv")?;
    Ok(KeyIvPair { key, iv })
}

fn take_sized<const N: usize>(src: &mut &[u8], what: &'static str) -> Result<[u8; N], CipherError> {
    if src.len() < 4 {
        return Err(CipherError::MalformedKeys(what));
    }
    let len = src.get_u32() as usize;
    if len != N || src.len() < N {
        return Err(CipherError::MalformedKeys(what));
    }
    let mut out = [0u8; N];
    src.copy_to_slice(&mut out);
    Ok(out)
}

/// Shared handle readers use to load the current keys
pub type KeyHandle = Arc<ArcSwapOption<CipherKeys>>;

/// Owns rotation of one connection's payload keys.
///
/// Generic over the environment's instant type so the spacing check runs
/// against virtual time in tests.
#[derive(Debug)]
pub struct CipherKeyManager<I> {
    current: KeyHandle,
    last_rotation: Option<I>,
    min_spacing: Duration,
}

impl<I> CipherKeyManager<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Manager with no keys yet
    #[must_use]
    pub fn new(min_spacing: Duration) -> Self {
        Self { current: Arc::new(ArcSwapOption::empty()), last_rotation: None, min_spacing }
    }

    /// Handle for concurrent readers
    #[must_use]
    pub fn handle(&self) -> KeyHandle {
        Arc::clone(&self.current)
    }

    /// Current snapshot, `None` before the first rotation
    #[must_use]
    pub fn current(&self) -> Option<Arc<CipherKeys>> {
        self.current.load_full()
    }

    /// Time of the last successful rotation
    #[must_use]
    pub const fn last_rotation(&self) -> Option<I> {
        self.last_rotation
    }

    /// Rotate to a fresh generation.
    ///
    /// The first rotation seeds both buckets with the same material and makes
    /// the even bucket active. Later rotations overwrite the active bucket
    /// and flip to the other one.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::RotationTooSoon`] if the previous rotation is
    /// closer than the minimum spacing. Keys are unchanged in that case.
    pub fn rotate<E>(&mut self, env: &E, now: I) -> Result<Arc<CipherKeys>, CipherError>
    where
        E: Environment<Instant = I>,
    {
        if let Some(last) = self.last_rotation {
            let since = elapsed(last, now);
            if since < self.min_spacing {
                return Err(CipherError::RotationTooSoon { elapsed: since });
            }
        }

        let fresh = KeyIvPair::generate(env);
        let next = match self.current.load_full() {
            None => CipherKeys { active: 0, sets: [fresh.clone(), fresh] },
            Some(keys) => {
                let outgoing = keys.active;
                let mut sets = keys.sets.clone();
                sets[outgoing] = fresh;
                CipherKeys { active: 1 - outgoing, sets }
            },
        };

        let next = Arc::new(next);
        self.current.store(Some(Arc::clone(&next)));
        self.last_rotation = Some(now);

        tracing::debug!(active = next.active, "rotated cipher keys");
        Ok(next)
    }

    /// Drop all keys (connection teardown).
    pub fn clear(&mut self) {
        self.current.store(None);
        self.last_rotation = None;
    }
}

/// AES-256-GCM key derived from a pre-shared secret.
///
/// Seals authentication tokens and the `UpdateCipherKeys` blob.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    key: [u8; KEY_SIZE],
}

impl SharedSecret {
    const INFO: &'static [u8] = b"gep shared secret v1";

    /// Derive the sealing key with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::MalformedKeys`] if derivation fails.
    pub fn derive(secret: &str) -> Result<Self, CipherError> {
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(Self::INFO, &mut key).map_err(|_| CipherError::MalformedKeys("derived key length"))?;
        Ok(Self { key })
    }

    /// Seal with a random nonce: `[nonce: 12][ciphertext || tag]`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Seal`] if the AEAD rejects the input.
    pub fn seal(&self, env: &impl Environment, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; IV_SIZE];
        env.random_bytes(&mut nonce);

        let sealed = self.aead()?.encrypt(Nonce::from_slice(&nonce), plaintext).map_err(|_| CipherError::Seal)?;
        let mut out = Vec::with_capacity(IV_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open output of [`SharedSecret::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Open`] on truncation or authentication failure.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < IV_SIZE + TAG_SIZE {
            return Err(CipherError::Open);
        }
        let (nonce, body) = sealed.split_at(IV_SIZE);
        self.aead()?.decrypt(Nonce::from_slice(nonce), body).map_err(|_| CipherError::Open)
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::MalformedKeys("key length"))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}
