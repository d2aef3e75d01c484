//! Client-side call throttling for explorer APIs.
//!
//! Explorer free tiers cap calls per second (typically 5/sec) and answer
//! with a "Max rate limit reached" payload instead of an HTTP error when
//! exceeded. Staying under the cap locally is cheaper than retrying.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Extra sleep on top of the computed wait, absorbing clock skew between
/// us and the explorer's own window.
const SAFETY_MARGIN: Duration = Duration::from_millis(50);

const WINDOW: Duration = Duration::from_secs(1);

/// Sliding one-second window admitting at most `calls_per_sec` calls.
#[derive(Debug)]
pub struct CallThrottle {
    calls_per_sec: usize,
    recent: VecDeque<Instant>,
}

impl CallThrottle {
    /// `calls_per_sec == 0` disables throttling.
    pub fn new(calls_per_sec: u32) -> Self {
        Self {
            calls_per_sec: calls_per_sec as usize,
            recent: VecDeque::with_capacity(calls_per_sec as usize + 1),
        }
    }

    /// Wait until another call fits in the window, then record it.
    pub async fn acquire(&mut self) {
        if self.calls_per_sec == 0 {
            return;
        }

        if self.recent.len() >= self.calls_per_sec {
            if let Some(&oldest) = self.recent.front() {
                let elapsed = oldest.elapsed();
                if elapsed < WINDOW {
                    let wait = WINDOW - elapsed + SAFETY_MARGIN;
                    debug!(wait_ms = wait.as_millis() as u64, "throttling explorer call");
                    tokio::time::sleep(wait).await;
                }
            }
            while self.recent.len() >= self.calls_per_sec {
                self.recent.pop_front();
            }
        }

        self.recent.push_back(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_calls_within_limit_do_not_wait() {
        let mut throttle = CallThrottle::new(3);
        let start = Instant::now();
        for _ in 0..3 {
            throttle.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_over_limit_waits_for_window() {
        let mut throttle = CallThrottle::new(2);
        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() >= WINDOW);
        assert!(start.elapsed() <= WINDOW + SAFETY_MARGIN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_calls_do_not_wait() {
        let mut throttle = CallThrottle::new(1);
        throttle.acquire().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        let before = Instant::now();
        throttle.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_disables_throttling() {
        let mut throttle = CallThrottle::new(0);
        let start = Instant::now();
        for _ in 0..50 {
            throttle.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
