use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Extra wait on top of the computed window expiry.
const WINDOW_SAFETY_BUFFER: Duration = Duration::from_millis(100);

/// Request quota of the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// N: maximum requests in any trailing `window`.
    pub max_requests: usize,
    pub window: Duration,
    /// D: minimum spacing between two consecutive requests.
    pub min_spacing: Duration,
}

impl RateLimit {
    /// `max_requests` per minute, evenly spaced (D = 60000 / N ms).
    pub fn per_minute(max_requests: u32) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests: max_requests as usize,
            window: Duration::from_secs(60),
            min_spacing: Duration::from_millis(60_000 / u64::from(max_requests)),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(15)
    }
}

/// Sliding-window request gate shared by every processor of a run.
///
/// The whole prune/wait/append sequence runs under one async mutex, so slot
/// acquisition is strictly serialized and waiters are served in FIFO order.
#[derive(Debug)]
pub struct RateGovernor {
    limit: RateLimit,
    window: Mutex<VecDeque<Instant>>,
}

impl RateGovernor {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window: Mutex::new(VecDeque::with_capacity(limit.max_requests + 1)),
        }
    }

    /// Suspend until a request may be issued, then record it.
    ///
    /// Returns the recorded timestamp. Cannot fail, only delay.
    pub async fn await_slot(&self) -> Instant {
        let started = Instant::now();
        let mut window = self.window.lock().await;

        loop {
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.limit.window)
            {
                window.pop_front();
            }

            if window.len() >= self.limit.max_requests {
                if let Some(oldest) = window.front().copied() {
                    let expires = oldest + self.limit.window;
                    if expires > now {
                        let wait = expires - now + WINDOW_SAFETY_BUFFER;
                        debug!(
                            wait_ms = wait.as_millis() as u64,
                            in_window = window.len(),
                            "Request window full, waiting"
                        );
                        sleep(wait).await;
                        continue;
                    }
                }
            }

            if let Some(last) = window.back().copied() {
                let since_last = now.saturating_duration_since(last);
                if since_last < self.limit.min_spacing {
                    sleep(self.limit.min_spacing - since_last).await;
                    continue;
                }
            }

            window.push_back(now);
            metrics::histogram!("studio_rate_gate_wait_seconds")
                .record(started.elapsed().as_secs_f64());
            return now;
        }
    }

    /// Requests recorded in the current trailing window.
    pub async fn in_window(&self) -> usize {
        let window = self.window.lock().await;
        let now = Instant::now();
        window
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.limit.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_per_minute_spacing() {
        let limit = RateLimit::per_minute(15);
        assert_eq!(limit.max_requests, 15);
        assert_eq!(limit.min_spacing, Duration::from_millis(4000));
        assert_eq!(RateLimit::default(), limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_slot_is_immediate() {
        let governor = RateGovernor::new(RateLimit::per_minute(15));
        let start = Instant::now();
        let slot = governor.await_slot().await;
        assert_eq!(slot, start);
        assert_eq!(governor.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_are_spaced() {
        let governor = RateGovernor::new(RateLimit::per_minute(15));
        let first = governor.await_slot().await;
        let second = governor.await_slot().await;
        assert!(second - first >= Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_blocks_until_spacing_elapses() {
        let governor = RateGovernor::new(RateLimit::per_minute(15));
        governor.await_slot().await;

        let mut next = tokio_test::task::spawn(governor.await_slot());
        tokio_test::assert_pending!(next.poll());
        tokio::time::advance(Duration::from_millis(3999)).await;
        tokio_test::assert_pending!(next.poll());
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio_test::assert_ready!(next.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_respect_spacing_and_window() {
        // Spacing of 1s lets the 60s window be the binding constraint.
        let limit = RateLimit {
            max_requests: 5,
            window: Duration::from_secs(60),
            min_spacing: Duration::from_secs(1),
        };
        let governor = Arc::new(RateGovernor::new(limit));

        let calls = (0..12).map(|_| {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.await_slot().await })
        });
        let mut stamps: Vec<Instant> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        stamps.sort();

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= limit.min_spacing);
        }
        for i in 0..stamps.len().saturating_sub(limit.max_requests) {
            assert!(
                stamps[i + limit.max_requests] - stamps[i] >= limit.window,
                "more than {} requests inside one window",
                limit.max_requests
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_frees_slots() {
        let limit = RateLimit {
            max_requests: 2,
            window: Duration::from_secs(10),
            min_spacing: Duration::ZERO,
        };
        let governor = RateGovernor::new(limit);
        let a = governor.await_slot().await;
        let _b = governor.await_slot().await;
        let c = governor.await_slot().await;
        assert!(c - a >= Duration::from_secs(10));
        assert!(c - a <= Duration::from_secs(10) + WINDOW_SAFETY_BUFFER);
    }
}
