//! Reconnection backoff policy.
//!
//! Tracks the retry schedule for one outbound endpoint: the delay starts
//! at the configured base interval and doubles per failed attempt up to
//! the configured ceiling. A successful connection resets the schedule.

use crate::options::SocketOptions;
use std::time::Duration;

/// Reconnection state tracker for one endpoint.
///
/// # Example
///
/// ```rust
/// use capstan_core::reconnect::ReconnectState;
/// use capstan_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let options = SocketOptions::default()
///     .with_reconnect_ivl(Duration::from_millis(100))
///     .with_reconnect_ivl_max(Duration::from_secs(10));
///
/// let mut reconnect = ReconnectState::new(&options);
///
/// // First attempt uses the base interval, later ones back off.
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(400));
///
/// // Reset on successful connection.
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Base reconnection interval
    base_interval: Duration,
    /// Ceiling for the backoff, `ZERO` meaning no growth at all
    max_interval: Duration,
    /// Failed attempts since the last reset
    attempt: u32,
    /// Delay the next attempt will use
    current_interval: Duration,
}

impl ReconnectState {
    /// Create a new reconnection state tracker from socket options.
    #[must_use]
    pub const fn new(options: &SocketOptions) -> Self {
        Self {
            base_interval: options.reconnect_ivl,
            max_interval: options.reconnect_ivl_max,
            attempt: 0,
            current_interval: options.reconnect_ivl,
        }
    }

    /// Delay to wait before the next connection attempt. Each call counts
    /// as one attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;
        self.attempt += 1;

        if !self.max_interval.is_zero() {
            self.current_interval = self
                .base_interval
                .saturating_mul(1_u32 << self.attempt.min(10))
                .min(self.max_interval);
        }

        delay
    }

    /// Reset the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    /// Failed attempts since the last reset.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next attempt will use.
    #[inline]
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current_interval
    }
}
