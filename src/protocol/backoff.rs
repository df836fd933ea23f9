//! Backoff policy for update and get-hash failures.
//!
//! Two independent tracks exist per manager: one for update cycles and one
//! for get-hash requests. Both share the same shape:
//!
//! | consecutive errors | interval |
//! |--------------------|----------|
//! | 0 (success)        | poll interval, unmodified |
//! | 1                  | 60 seconds |
//! | n >= 2             | `[30min, 60min] * 2^(n-2)`, fuzzed, capped at 8 hours |
//!
//! The fuzz value is fixed for the lifetime of a manager so repeated calls
//! are deterministic.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use listupdate_core::protocol::BackoffPolicy;
//!
//! let mut policy = BackoffPolicy::new(0.5);
//! let poll = Duration::from_secs(1800);
//!
//! assert_eq!(policy.next_interval(true, poll), Duration::from_secs(60));
//! assert_eq!(policy.next_interval(false, poll), poll);
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

use super::constants::{
    BACKOFF_WINDOW_MAX, BACKOFF_WINDOW_MIN, FIRST_RETRY_INTERVAL, MAX_BACKOFF_INTERVAL,
};

/// Exponent at which the window is far past the ceiling; keeps the shift in range.
const MAX_MULTIPLIER_EXPONENT: u32 = 16;

/// Error-count driven interval calculator.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    error_count: u32,
    fuzz: f64,
}

impl BackoffPolicy {
    /// Creates a policy with a fixed fuzz value.
    ///
    /// `fuzz` is clamped into `[0, 1)`; NaN is treated as 0.
    #[must_use]
    pub fn new(fuzz: f64) -> Self {
        Self {
            error_count: 0,
            fuzz: normalize_fuzz(fuzz),
        }
    }

    /// Number of consecutive errors since the last success.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// The fuzz value used to pick a point inside each backoff window.
    #[must_use]
    pub fn fuzz(&self) -> f64 {
        self.fuzz
    }

    /// Records the outcome of an attempt and returns how long to wait before the next one.
    ///
    /// On success the counter resets and `base_interval` is returned as-is.
    #[instrument(level = "debug", skip(self), fields(error_count = self.error_count))]
    pub fn next_interval(&mut self, had_error: bool, base_interval: Duration) -> Duration {
        if !had_error {
            self.error_count = 0;
            return base_interval;
        }

        self.error_count = self.error_count.saturating_add(1);
        let interval = self.error_interval();
        debug!(
            error_count = self.error_count,
            interval_secs = interval.as_secs(),
            "backing off"
        );
        interval
    }

    fn error_interval(&self) -> Duration {
        if self.error_count <= 1 {
            return FIRST_RETRY_INTERVAL;
        }

        let exponent = (self.error_count - 2).min(MAX_MULTIPLIER_EXPONENT);
        let multiplier = 1u32 << exponent;
        let low = BACKOFF_WINDOW_MIN
            .saturating_mul(multiplier)
            .min(MAX_BACKOFF_INTERVAL);
        let high = BACKOFF_WINDOW_MAX
            .saturating_mul(multiplier)
            .min(MAX_BACKOFF_INTERVAL);

        let interval = low + (high - low).mul_f64(self.fuzz);
        interval.min(MAX_BACKOFF_INTERVAL)
    }
}

fn normalize_fuzz(fuzz: f64) -> f64 {
    if fuzz.is_nan() {
        0.0
    } else {
        fuzz.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

/// Backoff track for get-hash requests, measured as an absolute deadline.
#[derive(Debug, Clone)]
pub struct GetHashBackoff {
    policy: BackoffPolicy,
    next_allowed: Option<Instant>,
}

impl GetHashBackoff {
    /// Creates a track with no recorded failures.
    #[must_use]
    pub fn new(fuzz: f64) -> Self {
        Self {
            policy: BackoffPolicy::new(fuzz),
            next_allowed: None,
        }
    }

    /// Number of consecutive get-hash failures.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.policy.error_count()
    }

    /// Earliest time the next get-hash request may be sent, if backing off.
    #[must_use]
    pub fn next_allowed(&self) -> Option<Instant> {
        self.next_allowed
    }

    /// Returns true if a request may be sent at `now`.
    #[must_use]
    pub fn is_allowed(&self, now: Instant) -> bool {
        self.next_allowed.is_none_or(|deadline| now >= deadline)
    }

    /// Records a failure observed at `now` and pushes the deadline out.
    pub fn handle_failure(&mut self, now: Instant) {
        let interval = self.policy.next_interval(true, Duration::ZERO);
        self.next_allowed = Some(now + interval);
    }

    /// Records a success. The existing deadline is left in place.
    pub fn handle_success(&mut self) {
        self.policy.next_interval(false, Duration::ZERO);
    }
}
