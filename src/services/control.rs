use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How often a paused processor re-reads the pause flag.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative pause flag and cancellation token for one batch run.
///
/// Processors only look at these at their suspension points (before an
/// attempt and around retry waits); an in-flight service call is never
/// interrupted.
#[derive(Debug, Clone)]
pub struct BatchControl {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new(PAUSE_POLL_INTERVAL)
    }
}

impl BatchControl {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            poll_interval,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Poll the pause flag until it clears. Returns `false` if the run was
    /// cancelled while waiting.
    pub async fn wait_while_paused(&self) -> bool {
        while self.is_paused() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = sleep(self.poll_interval) => {}
            }
        }
        !self.is_cancelled()
    }

    /// Sleep for `delay` unless the run is cancelled first. Returns `false`
    /// on cancellation.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_unpaused_gate_passes_immediately() {
        let control = BatchControl::default();
        let start = Instant::now();
        assert!(control.wait_while_paused().await);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_releases_within_one_poll() {
        let control = BatchControl::default();
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move {
                let ok = control.wait_while_paused().await;
                (ok, Instant::now())
            })
        };

        let start = Instant::now();
        sleep(Duration::from_millis(5500)).await;
        control.resume();

        let (ok, released) = waiter.await.unwrap();
        assert!(ok);
        assert!(released - start >= Duration::from_millis(5500));
        assert!(released - start <= Duration::from_millis(5500) + PAUSE_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pause_and_sleep() {
        let control = BatchControl::default();
        control.pause();
        control.cancel();
        assert!(!control.wait_while_paused().await);
        assert!(!control.sleep(Duration::from_secs(120)).await);
    }
}
