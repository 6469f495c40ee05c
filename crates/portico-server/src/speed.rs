//! Per-client transfer throttling.
//!
//! A soft, send-side limiter: bytes are accumulated per direction, and once
//! the accumulator passes the configured bytes-per-second the caller sleeps
//! long enough to pay the debt, then the covered amount is subtracted. The
//! lock is held across the sleep so every task of the client shares one
//! budget. Optimistic by construction - it assumes the network delivers
//! instantly and only paces this side's writes.

use std::time::Duration;

use tokio::sync::Mutex;

pub struct SpeedLimiter {
    rate: u32,
    state: Mutex<Counters>,
}

#[derive(Default)]
struct Counters {
    upload: u32,
    download: u32,
}

/// Seconds to sleep after adding `n` bytes to `count`, and the new count.
fn debit(count: u32, n: u32, rate: u32) -> (u32, u64) {
    let count = count.saturating_add(n);
    if count < rate {
        return (count, 0);
    }
    let seconds = count / rate;
    (count - seconds * rate, u64::from(seconds))
}

impl SpeedLimiter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            state: Mutex::new(Counters::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rate > 0
    }

    /// Account for `n` transferred bytes, sleeping when over budget.
    /// Upload (client to public peer) and download are throttled
    /// separately, each at the full rate.
    pub async fn throttle(&self, n: u32, upload: bool) {
        if self.rate == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        let count = if upload {
            &mut state.upload
        } else {
            &mut state.download
        };
        let (rest, seconds) = debit(*count, n, self.rate);
        *count = rest;
        if seconds > 0 {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_below_rate_never_sleeps() {
        assert_eq!(debit(0, 100, 1024), (100, 0));
        assert_eq!(debit(900, 100, 1024), (1000, 0));
    }

    #[test]
    fn debit_sleeps_whole_seconds_and_keeps_the_remainder() {
        // 1500 bytes at 1000 B/s: one second, 500 carried over.
        assert_eq!(debit(0, 1500, 1000), (500, 1));
        // 3500 at 1000: three seconds, 500 carried.
        assert_eq!(debit(3000, 500, 1000), (500, 3));
    }

    #[tokio::test]
    async fn directions_are_throttled_independently() {
        tokio::time::pause();
        let limiter = SpeedLimiter::new(1000);

        limiter.throttle(999, true).await;
        // Upload budget nearly spent; download still free.
        let start = tokio::time::Instant::now();
        limiter.throttle(999, false).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let start = tokio::time::Instant::now();
        limiter.throttle(1, true).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn disabled_limiter_is_free() {
        let limiter = SpeedLimiter::new(0);
        assert!(!limiter.enabled());
        limiter.throttle(u32::MAX, true).await;
        limiter.throttle(u32::MAX, false).await;
    }
}
