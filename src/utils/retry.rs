//! Backoff builders for broker reconnects.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for receive loops after a consumer or stream error.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts (the loop keeps trying until the bus closes)
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff for the initial broker connection.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 10
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_reconnect_backoff_is_bounded_per_step() {
        let delays: Vec<Duration> = reconnect_backoff().build().take(50).collect();
        assert_eq!(delays.len(), 50, "reconnect backoff must not run out");
        // Jitter adds at most one extra delay on top of the cap.
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
    }

    #[test]
    fn test_connection_backoff_gives_up() {
        assert_eq!(connection_backoff().build().count(), 10);
    }
}
