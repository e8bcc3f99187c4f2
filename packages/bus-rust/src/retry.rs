//! Retry policies.
//!
//! A [`RetryPolicy`] answers two questions for a failed delivery attempt:
//! should it be retried, and how long to wait first. Policies are plain
//! values with no per-delivery state; the attempt counter lives in a
//! [`RetryContext`] owned by the delivery. One policy can therefore be
//! shared by every concurrent delivery of an endpoint.

use std::collections::HashSet;
use std::time::Duration;

use courier_core::{ErrorKind, Errors};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryContext
// ---------------------------------------------------------------------------

/// Attempt counter for one delivery sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryContext {
    attempt: u32,
}

impl RetryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-based index of the current attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Moves to the next attempt and returns its index.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Interchangeable retry strategies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RetryPolicy {
    /// Never retry.
    #[default]
    None,
    /// Retry without waiting.
    Immediate { max_retries: u32 },
    /// Retry after a fixed interval.
    Interval { max_retries: u32, interval_ms: u64 },
    /// Wait `initial + increment * attempt`.
    Incremental {
        max_retries: u32,
        initial_ms: u64,
        increment_ms: u64,
    },
    /// Wait `min(initial * 2^attempt, max_interval)`, perturbed by
    /// `± jitter_factor` of that value.
    Exponential {
        max_retries: u32,
        initial_ms: u64,
        max_interval_ms: u64,
        jitter_factor: f64,
    },
    /// Retry only when at least one observed error kind is listed.
    Filtered {
        base: Box<RetryPolicy>,
        kinds: HashSet<ErrorKind>,
    },
    /// Retry only when no observed error kind is listed.
    Excluded {
        base: Box<RetryPolicy>,
        kinds: HashSet<ErrorKind>,
    },
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RetryPolicy {
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::Immediate { max_retries }
    }

    #[must_use]
    pub fn interval(max_retries: u32, interval: Duration) -> Self {
        Self::Interval {
            max_retries,
            interval_ms: millis(interval),
        }
    }

    #[must_use]
    pub fn incremental(max_retries: u32, initial: Duration, increment: Duration) -> Self {
        Self::Incremental {
            max_retries,
            initial_ms: millis(initial),
            increment_ms: millis(increment),
        }
    }

    #[must_use]
    pub fn exponential(
        max_retries: u32,
        initial: Duration,
        max_interval: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self::Exponential {
            max_retries,
            initial_ms: millis(initial),
            max_interval_ms: millis(max_interval),
            jitter_factor,
        }
    }

    /// Restricts this policy to errors of the given kinds.
    #[must_use]
    pub fn filtered(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self::Filtered {
            base: Box::new(self),
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Disables this policy for errors of the given kinds.
    #[must_use]
    pub fn excluded(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self::Excluded {
            base: Box::new(self),
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Retry budget, not counting the initial attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Immediate { max_retries }
            | Self::Interval { max_retries, .. }
            | Self::Incremental { max_retries, .. }
            | Self::Exponential { max_retries, .. } => *max_retries,
            Self::Filtered { base, .. } | Self::Excluded { base, .. } => base.max_retries(),
        }
    }

    /// Whether the attempt described by `ctx`, which failed with `errors`,
    /// should be retried.
    #[must_use]
    pub fn should_retry(&self, ctx: &RetryContext, errors: &Errors) -> bool {
        match self {
            Self::None => false,
            Self::Immediate { max_retries }
            | Self::Interval { max_retries, .. }
            | Self::Incremental { max_retries, .. }
            | Self::Exponential { max_retries, .. } => ctx.attempt < *max_retries,
            Self::Filtered { base, kinds } => {
                errors.kinds().any(|k| kinds.contains(&k)) && base.should_retry(ctx, errors)
            }
            Self::Excluded { base, kinds } => {
                !errors.kinds().any(|k| kinds.contains(&k)) && base.should_retry(ctx, errors)
            }
        }
    }

    /// Whether the retry budget has been used up.
    ///
    /// A policy without retries is never "exhausted": its failures are
    /// reported as-is rather than as retry exhaustion.
    #[must_use]
    pub fn is_exhausted(&self, ctx: &RetryContext) -> bool {
        let max = self.max_retries();
        max > 0 && ctx.attempt >= max
    }

    /// Wait before the retry following the attempt described by `ctx`.
    #[must_use]
    pub fn delay(&self, ctx: &RetryContext) -> Duration {
        match self {
            Self::None | Self::Immediate { .. } => Duration::ZERO,
            Self::Interval { interval_ms, .. } => Duration::from_millis(*interval_ms),
            Self::Incremental {
                initial_ms,
                increment_ms,
                ..
            } => Duration::from_millis(
                increment_ms
                    .saturating_mul(u64::from(ctx.attempt))
                    .saturating_add(*initial_ms),
            ),
            Self::Exponential {
                initial_ms,
                max_interval_ms,
                jitter_factor,
                ..
            } => {
                let base = exponential_base(*initial_ms, *max_interval_ms, ctx.attempt);
                apply_jitter(base, *jitter_factor)
            }
            Self::Filtered { base, .. } | Self::Excluded { base, .. } => base.delay(ctx),
        }
    }
}

/// `min(initial * 2^attempt, max_interval)` in milliseconds, saturating.
fn exponential_base(initial_ms: u64, max_interval_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    initial_ms.saturating_mul(factor).min(max_interval_ms)
}

#[allow(clippy::cast_precision_loss)]
fn apply_jitter(base_ms: u64, jitter_factor: f64) -> Duration {
    let jitter = if jitter_factor.is_finite() {
        jitter_factor.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if jitter == 0.0 || base_ms == 0 {
        return Duration::from_millis(base_ms);
    }
    let base = base_ms as f64;
    let spread = base * jitter;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((base + offset).max(0.0) / 1000.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
