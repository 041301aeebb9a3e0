//! Anti-replay cache for handshake fingerprints.
//!
//! [`StableBloomFilter`] keeps two Bloom filter generations of equal size.
//! New fingerprints go into the current generation; once it holds
//! `max_size` entries the older generation is cleared and becomes the new
//! current one.
//!
//! ```text
//!  insert --> [ current  (<= max_size) ]   membership = current OR previous
//!             [ previous (== max_size) ]
//!
//!  current full:  previous := current, current := cleared previous
//! ```
//!
//! The most recent `max_size` fingerprints are always remembered, older ones
//! are forgotten a whole generation at a time, and memory stays fixed. Each
//! generation is sized for half the target error rate so a query against
//! both stays within it.

use crate::{ProxyError, Result};
use std::f64::consts::LN_2;
use std::sync::Mutex;

/// Largest generation the filter will allocate, in bits (1 GiB).
pub const MAX_GENERATION_BITS: u64 = 8 << 30;

/// Replay detector.
pub trait AntiReplayCache: Send + Sync {
    /// Record `fingerprint` and report whether it was seen before.
    fn seen_before(&self, fingerprint: &[u8]) -> bool;
}

/// Anti-replay disabled: nothing is ever a replay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl AntiReplayCache for NoopCache {
    fn seen_before(&self, _fingerprint: &[u8]) -> bool {
        false
    }
}

#[derive(Debug)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }
}

#[derive(Debug)]
struct Generations {
    current: BitSet,
    previous: BitSet,
    current_len: usize,
}

/// Fixed-memory Bloom filter with generational aging.
pub struct StableBloomFilter {
    state: Mutex<Generations>,
    hash_a: ahash::RandomState,
    hash_b: ahash::RandomState,
    bits: usize,
    hashes: usize,
    max_size: usize,
}

impl StableBloomFilter {
    /// Filter remembering at least the last `max_size` fingerprints with a
    /// false-positive rate of at most `error_rate`.
    ///
    /// # Errors
    /// `ProxyError::Config` if `max_size` is zero, `error_rate` is not in
    /// `(0, 1)`, or one generation would exceed [`MAX_GENERATION_BITS`].
    pub fn new(max_size: usize, error_rate: f64) -> Result<Self> {
        if max_size == 0 {
            return Err(ProxyError::Config(
                "anti-replay max size must be positive".to_string(),
            ));
        }
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(ProxyError::Config(format!(
                "anti-replay error rate must be in (0, 1), got {error_rate}"
            )));
        }

        let (bits, hashes) = optimal_params(max_size, error_rate / 2.0).ok_or_else(|| {
            ProxyError::Config(format!(
                "anti-replay filter for {max_size} entries at error rate {error_rate} \
                 exceeds {} MiB per generation",
                MAX_GENERATION_BITS / 8 / 1024 / 1024
            ))
        })?;
        Ok(Self {
            state: Mutex::new(Generations {
                current: BitSet::new(bits),
                previous: BitSet::new(bits),
                current_len: 0,
            }),
            hash_a: ahash::RandomState::new(),
            hash_b: ahash::RandomState::new(),
            bits,
            hashes,
            max_size,
        })
    }

    /// Bits per generation.
    pub fn bits_per_generation(&self) -> usize {
        self.bits
    }

    /// Hash functions per entry.
    pub fn hash_count(&self) -> usize {
        self.hashes
    }

    /// Membership test without recording.
    pub fn contains(&self, fingerprint: &[u8]) -> bool {
        let indices = self.indices(fingerprint);
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        all_set(&state.current, &indices) || all_set(&state.previous, &indices)
    }

    fn indices(&self, fingerprint: &[u8]) -> Vec<usize> {
        let h1 = self.hash_a.hash_one(fingerprint);
        let h2 = self.hash_b.hash_one(fingerprint) | 1;
        let m = self.bits as u64;
        (0..self.hashes as u64)
            .map(|i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
            .collect()
    }
}

impl AntiReplayCache for StableBloomFilter {
    fn seen_before(&self, fingerprint: &[u8]) -> bool {
        let indices = self.indices(fingerprint);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let in_current = all_set(&state.current, &indices);
        let seen = in_current || all_set(&state.previous, &indices);

        if !in_current {
            for &bit in &indices {
                state.current.set(bit);
            }
            state.current_len += 1;

            if state.current_len >= self.max_size {
                let Generations {
                    current, previous, ..
                } = &mut *state;
                std::mem::swap(current, previous);
                current.clear();
                state.current_len = 0;
            }
        }

        seen
    }
}

impl std::fmt::Debug for StableBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableBloomFilter")
            .field("bits", &self.bits)
            .field("hashes", &self.hashes)
            .field("max_size", &self.max_size)
            .finish()
    }
}

fn all_set(set: &BitSet, indices: &[usize]) -> bool {
    indices.iter().all(|&bit| set.get(bit))
}

/// Bit count and hash count for `n` entries at false-positive rate `p`, or
/// `None` past [`MAX_GENERATION_BITS`].
fn optimal_params(n: usize, p: f64) -> Option<(usize, usize)> {
    let n = n as f64;
    let bits = (-n * p.ln() / (LN_2 * LN_2)).ceil().max(64.0);
    if !bits.is_finite() || bits > MAX_GENERATION_BITS as f64 || bits > usize::MAX as f64 {
        return None;
    }
    let hashes = ((bits / n) * LN_2).round().clamp(1.0, 32.0);
    Some((bits as usize, hashes as usize))
}
