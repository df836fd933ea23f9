//! Constants for the update protocol (intervals, timeouts, wire defaults).

use std::time::Duration;

/// Protocol version sent as the `pver` query parameter.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2.2";

/// Poll interval used until the server advertises one with `n:` (30 minutes).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Longest accepted poll interval or scheduling delay (24 hours). Larger
/// server-advertised or overridden values are clamped to this.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum time to wait for any single fetch before treating it as a connect failure.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry interval after the first consecutive failure (1 minute, never fuzzed).
pub const FIRST_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Lower edge of the backoff window at the second consecutive failure.
pub const BACKOFF_WINDOW_MIN: Duration = Duration::from_secs(30 * 60);

/// Upper edge of the backoff window at the second consecutive failure.
pub const BACKOFF_WINDOW_MAX: Duration = Duration::from_secs(60 * 60);

/// Absolute ceiling for any backoff interval (8 hours).
pub const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

/// Bounds for the delay before the very first update after `start()`.
pub const STARTUP_DELAY_MIN: Duration = Duration::from_secs(60);
pub const STARTUP_DELAY_MAX: Duration = Duration::from_secs(300);

/// Length of a full hash returned by the get-hash endpoint.
pub const FULL_HASH_LEN: usize = 32;

/// Length of a hash prefix and of a host key inside chunk payloads.
pub const PREFIX_LEN: usize = 4;
