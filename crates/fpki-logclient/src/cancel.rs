//! Caller-supplied cancellation and deadlines
//!
//! A `Cancellation` is threaded into every backend call and poll loop of the
//! engine. It fires either when its `CancelHandle` is triggered or when its
//! deadline passes; the two are reported differently so callers can tell a
//! timeout from an abort.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a cancellable wait ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The handle was triggered
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

/// Triggers every `Cancellation` derived from it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a handle and the token it controls
    pub fn new() -> (Self, Cancellation) {
        let (tx, rx) = watch::channel(false);
        let token = Cancellation {
            signal: Some(rx),
            deadline: None,
        };
        (Self { tx }, token)
    }

    pub fn cancel(&self) {
        // No receivers left is fine: nothing is waiting.
        let _ = self.tx.send(true);
    }

    /// Another token controlled by this handle
    pub fn token(&self) -> Cancellation {
        Cancellation {
            signal: Some(self.tx.subscribe()),
            deadline: None,
        }
    }
}

/// Cancellation token with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    signal: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A token that never fires
    pub fn none() -> Self {
        Self::default()
    }

    /// A token that only fires at `timeout` from now
    pub fn timeout(timeout: Duration) -> Self {
        Self::none().with_timeout(timeout)
    }

    /// Tighten the deadline to `deadline` if it is earlier than the current one
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.signal.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.interrupted().is_some()
    }

    /// Resolve once the token fires
    ///
    /// A token whose handle was dropped without cancelling never fires on
    /// the signal; only its deadline can end the wait.
    pub async fn fired(&self) -> Interrupt {
        let signal = async {
            match self.signal.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = signal => Interrupt::Cancelled,
            _ = deadline => Interrupt::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the token fires first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        if let Some(interrupt) = self.interrupted() {
            return Err(interrupt);
        }
        tokio::select! {
            biased;
            interrupt = self.fired() => Err(interrupt),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration` unless the token fires first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_never_fires() {
        let token = Cancellation::none();
        assert!(!token.is_cancelled());
        assert_eq!(token.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_work() {
        let (handle, token) = CancelHandle::new();
        let waiter = tokio::spawn(async move {
            token.run(std::future::pending::<()>()).await
        });
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_reported_separately() {
        let token = Cancellation::timeout(Duration::from_millis(50));
        let result = token.sleep(Duration::from_secs(10)).await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_only_tightens() {
        let token = Cancellation::timeout(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(60));
        assert!(token.deadline().unwrap() <= Instant::now() + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (handle, token) = CancelHandle::new();
        drop(handle);
        assert!(!token.is_cancelled());
        assert_eq!(token.run(async { "done" }).await, Ok("done"));
    }
}
