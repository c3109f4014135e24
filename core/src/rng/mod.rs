//! Deterministic random number generation
//!
//! Uses the xorshift64* algorithm. The only consumer in this crate is retry
//! jitter, but the rule is global: all randomness MUST go through this
//! module so that a seeded run replays identically.

mod xorshift;

pub use xorshift::JitterRng;
