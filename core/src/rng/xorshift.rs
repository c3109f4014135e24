//! xorshift64* random number generator
//!
//! Fast, deterministic PRNG with 64-bit state. Same seed, same sequence:
//! retry schedules under a fixed seed are exactly reproducible, which keeps
//! backoff timing testable.

use serde::{Deserialize, Serialize};

/// Deterministic jitter source for retry backoff.
///
/// # Example
/// ```
/// use payment_orchestration_core::rng::JitterRng;
///
/// let mut rng = JitterRng::new(12345);
/// let ms = rng.jitter_ms(1_000); // [0, 1000)
/// assert!(ms < 1_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterRng {
    /// Internal state (64-bit)
    state: u64,
}

impl JitterRng {
    /// Create a new RNG with the given seed.
    ///
    /// A zero seed is mapped to 1 (xorshift requirement).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Generate the next random u64 value.
    pub fn next(&mut self) -> u64 {
        // xorshift64* algorithm
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Random jitter in milliseconds, uniform over `[0, bound_ms)`.
    ///
    /// A zero bound returns zero (no jitter configured).
    pub fn jitter_ms(&mut self, bound_ms: u64) -> u64 {
        if bound_ms == 0 {
            return 0;
        }
        self.next() % bound_ms
    }

    /// Current state, for checkpointing and replay.
    pub fn state(&self) -> u64 {
        self.state
    }
}
