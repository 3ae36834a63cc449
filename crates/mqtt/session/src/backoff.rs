//! Exponential backoff for connection retries.
//!
//! When an attempt is not confirmed, the session waits an increasing amount of
//! time before trying again:
//!
//! ```text
//! delay[n] = min(cap, base * 2^(n-1))      n >= 1
//! ```
//!
//! With `base = 100ms` and `cap = 1s`:
//! - Attempt 1: 100ms
//! - Attempt 2: 200ms
//! - Attempt 3: 400ms
//! - Attempt 4: 800ms
//! - Attempt 5+: 1s (capped)
//!
//! With jitter enabled the delay is drawn uniformly from `[0, delay[n]]` ("full
//! jitter"), so many clients dropped by the same broker do not retry in lockstep.
//!
//! Inputs are permissive: attempt `0` counts as attempt `1`, and a zero base or
//! zero cap yields an immediate retry.

use std::time::Duration;

use rand::Rng;

use crate::options::SessionOptions;

/// Computes the delay before retry `attempt`, in milliseconds.
///
/// Uses the thread-local RNG when `use_jitter` is set. The result never
/// exceeds `cap_ms`.
///
/// # Examples
/// ```ignore
/// assert_eq!(compute_delay(100, 3, 10_000, false), 400);
/// assert!(compute_delay(100, 3, 10_000, true) <= 400);
/// ```
pub fn compute_delay(base_delay_ms: u64, attempt: u32, cap_ms: u64, use_jitter: bool) -> u64 {
    compute_delay_with(
        &mut rand::thread_rng(),
        base_delay_ms,
        attempt,
        cap_ms,
        use_jitter,
    )
}

/// Same as [`compute_delay`] with an explicit random source.
pub fn compute_delay_with<R: Rng + ?Sized>(
    rng: &mut R,
    base_delay_ms: u64,
    attempt: u32,
    cap_ms: u64,
    use_jitter: bool,
) -> u64 {
    let delay = exponential_delay(base_delay_ms, attempt, cap_ms);
    if use_jitter && delay > 0 {
        rng.gen_range(0..=delay)
    } else {
        delay
    }
}

fn exponential_delay(base_delay_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    if base_delay_ms == 0 || cap_ms == 0 {
        return 0;
    }

    let exponent = attempt.max(1) - 1;
    // 2^64 and beyond saturate, the cap takes over anyway
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_delay_ms.saturating_mul(factor).min(cap_ms)
}

/// Retry policy of one session, derived from its option snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    base_delay: Duration,

    /// Upper bound for any single delay.
    max_delay: Duration,

    /// Draw the delay uniformly from `[0, delay]`.
    jitter: bool,
}

impl Backoff {
    /// Creates a policy with explicit parameters.
    ///
    /// # Arguments
    /// - `base_delay`: delay before the first retry
    /// - `max_delay`: cap applied to every delay
    /// - `jitter`: enable full jitter
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Reads `backoff_time`, `max_backoff_time` and `jitter` from the options.
    pub fn from_options(options: &SessionOptions) -> Self {
        Self::new(
            Duration::from_millis(options.backoff_time),
            Duration::from_millis(options.max_backoff_time),
            options.jitter,
        )
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_for_with(&mut rand::thread_rng(), attempt)
    }

    pub fn delay_for_with<R: Rng + ?Sized>(&self, rng: &mut R, attempt: u32) -> Duration {
        Duration::from_millis(compute_delay_with(
            rng,
            saturating_millis(self.base_delay),
            attempt,
            saturating_millis(self.max_delay),
            self.jitter,
        ))
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }
}

impl Default for Backoff {
    /// Mirrors [`SessionOptions::default`]: 1s base, 30s cap, no jitter.
    fn default() -> Self {
        Self::from_options(&SessionOptions::default())
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
