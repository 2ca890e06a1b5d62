//! Deadline + cancellation token threaded through every batch layer.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("run cancelled")]
    Cancelled,
}

/// Owner side of a [`RunContext`]; cancelling it interrupts every clone.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Shared per-run deadline and cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl RunContext {
    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            deadline: Instant::now() + timeout,
            cancel: rx,
        };
        (ctx, CancelHandle { tx })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Same run and cancellation signal, with a deadline no later than `timeout` from now.
    pub fn child(&self, timeout: Duration) -> Self {
        let mut child = self.clone();
        child.deadline = self.deadline.min(Instant::now() + timeout);
        child
    }

    /// Same run and cancellation signal with a fresh deadline, even past the parent's.
    ///
    /// Used for the persistence phase, which still has to honour cancellation
    /// after the fetch deadline has run out.
    pub fn follow_up(&self, timeout: Duration) -> Self {
        let mut next = self.clone();
        next.deadline = Instant::now() + timeout;
        next
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if *self.cancel.borrow() {
            return Err(Interrupted::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Interrupted::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Resolves once the deadline passes or the run is cancelled.
    pub async fn done(&self) -> Interrupted {
        let mut rx = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => Interrupted::DeadlineExceeded,
            // The borrow guard must not live across the await below.
            cancelled = async { rx.wait_for(|cancelled| *cancelled).await.is_ok() } => {
                if cancelled {
                    Interrupted::Cancelled
                } else {
                    // Handle dropped without cancelling: only the deadline remains.
                    tokio::time::sleep_until(self.deadline).await;
                    Interrupted::DeadlineExceeded
                }
            }
        }
    }

    /// Drive `fut` until it completes or the context is interrupted, whichever is first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            out = fut => Ok(out),
        }
    }
}
