//! Back-off applied when a channel's broker consumer reports errors.

use std::time::Duration;

/// Exponential back-off between polls of a failing broker consumer.
///
/// The delay starts at `initial_delay`, doubles after each consecutive error
/// and is capped at `max_delay`. A successfully received record resets it.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first error in a run.
    pub initial_delay: Duration,
    /// Upper bound once the delay has grown.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to at least one millisecond and ensure
    /// `initial_delay <= max_delay`.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use broker_pubsub::backoff::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::ZERO,
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay to use after `current`.
    pub(crate) fn next(self, current: Duration) -> Duration { (current * 2).min(self.max_delay) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_cap() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(15),
        };
        let second = cfg.next(cfg.initial_delay);
        assert_eq!(second, Duration::from_millis(10));
        assert_eq!(cfg.next(second), Duration::from_millis(15));
    }
}
