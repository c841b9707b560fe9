//! Shutdown and deadline signalling.
//!
//! A [`Shutdown`] owns the process-wide stop flag. Every long-running
//! operation receives a [`StopSignal`] derived from it, optionally narrowed
//! by a deadline, and must unwind promptly once the signal fires.

use std::future::{pending, Future};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::{RelayError, Result};

/// Owner of the shutdown flag.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Get a signal observing this flag.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: Some(self.tx.subscribe()),
            deadline: None,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation context passed through fetch, store and delivery calls.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            deadline: None,
        }
    }

    /// Derive a signal that also fires at `deadline`.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            rx: self.rx.clone(),
            deadline: Some(deadline),
        }
    }

    /// Derive a signal that also fires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Whether the deadline has passed.
    pub fn deadline_elapsed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Whether the signal has fired for any reason.
    pub fn is_stopped(&self) -> bool {
        self.is_shutdown() || self.deadline_elapsed()
    }

    /// The error describing why the signal fired.
    ///
    /// Shutdown takes precedence over the deadline.
    pub fn stop_error(&self) -> RelayError {
        if self.is_shutdown() {
            RelayError::Cancelled
        } else {
            RelayError::DeadlineExceeded
        }
    }

    /// Wait until the signal fires.
    pub async fn stopped(&self) {
        let shutdown = async {
            match &self.rx {
                Some(rx) => {
                    let mut rx = rx.clone();
                    let fired = rx.wait_for(|stop| *stop).await.is_ok();
                    // Flag owner dropped without triggering
                    if !fired && !*rx.borrow() {
                        pending::<()>().await;
                    }
                }
                None => pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown => {}
            _ = deadline => {}
        }
    }

    /// Run `fut` unless the signal fires first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_stopped() {
            return Err(self.stop_error());
        }
        tokio::select! {
            biased;
            _ = self.stopped() => Err(self.stop_error()),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_is_not_stopped() {
        let signal = StopSignal::never();
        assert!(!signal.is_stopped());
        assert!(signal.deadline().is_none());
    }

    #[test]
    fn test_trigger_is_observed() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_stopped());

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(signal.is_shutdown());
        assert!(matches!(signal.stop_error(), RelayError::Cancelled));
    }

    #[test]
    fn test_with_deadline_keeps_earlier() {
        let now = Instant::now();
        let early = StopSignal::never().with_deadline(now + Duration::from_secs(1));
        let narrowed = early.with_deadline(now + Duration::from_secs(10));
        assert_eq!(narrowed.deadline(), Some(now + Duration::from_secs(1)));

        let later = early.with_deadline(now + Duration::from_millis(500));
        assert_eq!(later.deadline(), Some(now + Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let signal = StopSignal::never().with_timeout(Duration::from_millis(20));
        signal.stopped().await;
        assert!(signal.deadline_elapsed());
        assert!(matches!(signal.stop_error(), RelayError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_stopped_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();

        let waiter = tokio::spawn(async move {
            signal.stopped().await;
        });
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_returns_result() {
        let signal = StopSignal::never();
        let value = signal.guard(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_interrupts_slow_future() {
        let signal = StopSignal::never().with_timeout(Duration::from_millis(20));
        let result: Result<()> = signal
            .guard(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RelayError::DeadlineExceeded)));
    }
}
