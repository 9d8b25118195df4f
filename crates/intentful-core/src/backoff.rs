// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry backoff with jitter.
//!
//! The delay before retry `attempt` is
//! `min(exponent^attempt + entropy, max_backoff)` seconds, where a kind may
//! override the exponent and `entropy` is a random jitter.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::Kind;

/// Jitter bounds selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyMode {
    /// Short jitter for local development and tests.
    Debug,
    /// Wide jitter spreading retries of many entities apart.
    Production,
}

impl EntropyMode {
    /// Jitter range, in whole seconds.
    pub fn bounds(&self) -> RangeInclusive<u64> {
        match self {
            Self::Debug => 1..=2,
            Self::Production => 10..=20,
        }
    }
}

/// Jitter added to each backoff delay.
#[derive(Debug, Clone)]
pub enum EntropySource {
    /// Random jitter within the mode's bounds.
    Random {
        /// Bounds selector.
        mode: EntropyMode,
        /// Random source.
        rng: StdRng,
    },
    /// Always the same jitter.
    Fixed(Duration),
}

impl EntropySource {
    /// Random jitter seeded from the OS.
    pub fn random(mode: EntropyMode) -> Self {
        Self::Random {
            mode,
            rng: StdRng::from_entropy(),
        }
    }

    /// Random jitter from a fixed seed; the sequence is reproducible.
    pub fn seeded(mode: EntropyMode, seed: u64) -> Self {
        Self::Random {
            mode,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Constant jitter.
    pub fn fixed(entropy: Duration) -> Self {
        Self::Fixed(entropy)
    }

    /// Next jitter value.
    ///
    /// With a kind `diff_delay` the jitter is that delay plus 1 to 10 seconds,
    /// whatever the mode.
    pub fn next(&mut self, diff_delay: Option<u64>) -> Duration {
        match self {
            Self::Fixed(entropy) => *entropy,
            Self::Random { mode, rng } => {
                let secs = match diff_delay {
                    Some(delay) => delay.saturating_add(rng.gen_range(1..=10)),
                    None => rng.gen_range(mode.bounds()),
                };
                Duration::from_secs(secs)
            }
        }
    }
}

/// Backoff delay before retry `attempt`.
///
/// `kind_exponent` replaces `base_exponent` when set. The result never
/// exceeds `max_backoff`.
pub fn backoff(
    attempt: u32,
    base_exponent: f64,
    max_backoff: Duration,
    entropy: Duration,
    kind_exponent: Option<f64>,
) -> Duration {
    let exponent = kind_exponent.unwrap_or(base_exponent);
    let power = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = exponent.powi(power) + entropy.as_secs_f64();
    let max = max_backoff.as_secs_f64();

    if raw.is_finite() && raw >= 0.0 {
        Duration::from_secs_f64(raw.min(max))
    } else {
        max_backoff
    }
}

/// Engine-wide backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Default exponent.
    pub retry_exponent: f64,
    /// Upper bound of any delay.
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retry_exponent: 2.0,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` of an entity of `kind`.
    pub fn delay(&self, attempt: u32, kind: &Kind, entropy: &mut EntropySource) -> Duration {
        backoff(
            attempt,
            self.retry_exponent,
            self.max_backoff,
            entropy.next(kind.diff_delay),
            kind.diff_retry_exponent,
        )
    }
}
