//! Timer tasks owned by a capture session
//!
//! Both timer kinds abort their task when stopped or dropped, so a timer
//! can never outlive the session that owns it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Periodic best-effort task
pub struct Ticker {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Run `tick` every `interval`, measured from now, until it returns
    /// `false` or the ticker is stopped. Late ticks are skipped, never
    /// replayed.
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let first = Instant::now() + interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) || !tick() {
                    break;
                }
            }
            flag.store(false, Ordering::SeqCst);
            tracing::trace!("{} ticker finished", name);
        });

        Self {
            name,
            running,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the task. Returns `true` if a task was still attached.
    pub fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                tracing::debug!("Stopped {} ticker", self.name);
                true
            }
            None => false,
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// One-shot timer
pub struct Deadline {
    handle: Option<JoinHandle<()>>,
}

impl Deadline {
    /// Run `fire` once, `after` from now
    pub fn spawn<F, Fut>(after: Duration, fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let at = Instant::now() + after;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            fire().await;
        });

        Self {
            handle: Some(handle),
        }
    }

    /// Cancel the timer if it has not fired
    pub fn disarm(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Let the timer's task run to completion without aborting it
    ///
    /// Used from inside the fired callback, which must not abort itself.
    pub fn detach(&mut self) {
        self.handle.take();
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut ticker = Ticker::spawn("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!((4..=5).contains(&seen), "ticked {} times", seen);

        assert!(ticker.stop());
        assert!(!ticker.stop());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_ends_when_tick_declines() {
        let ticker = Ticker::spawn("once", Duration::from_millis(10), || false);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!ticker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_deadline_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut deadline = Deadline::spawn(Duration::from_secs(1), move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(deadline.disarm());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
