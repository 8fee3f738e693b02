use std::future::{pending, Future};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Cancellation scope handed to every provider call.
///
/// A context is cancelled either explicitly through its [`CancelHandle`] or
/// implicitly once its deadline passes. Cloning is cheap; clones observe the
/// same cancellation signal.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// Cancels every [`Context`] derived from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Cancelled {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[cfg(test)]
    pub fn background() -> Self {
        let (_, cancel) = watch::channel(false);
        Self { cancel, deadline: None }
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, cancel) = watch::channel(false);
        (Self { cancel, deadline: None }, CancelHandle(tx))
    }

    /// Derives a context that additionally expires after `timeout`.
    /// An earlier deadline inherited from `self` is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Returns the cancellation reason if the context is already done.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled::Cancelled)
        } else if self.deadline.map_or(false, |d| d <= Instant::now()) {
            Err(Cancelled::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Resolves once the context is explicitly cancelled. Never resolves for
    /// a background context.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Sender dropped without cancelling.
                pending::<()>().await;
            }
        }
    }

    /// Drives `fut` to completion unless the context is cancelled or its
    /// deadline passes first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(d) => time::sleep_until(d).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled::Cancelled),
            _ = deadline => Err(Cancelled::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_future() {
        let (ctx, handle) = Context::with_cancel();
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.run(pending::<()>()).await })
        };

        handle.cancel();

        assert_eq!(task.await.unwrap(), Err(Cancelled::Cancelled));
        assert_eq!(ctx.check(), Err(Cancelled::Cancelled));
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(
            ctx.run(pending::<()>()).await,
            Err(Cancelled::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn already_cancelled_does_not_poll() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();

        let mut polled = false;
        let res = ctx.run(async { polled = true }).await;

        assert_eq!(res, Err(Cancelled::Cancelled));
        assert!(!polled);
    }

    #[test]
    fn timeout_keeps_earlier_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let short = Context::background().with_timeout(Duration::from_secs(1));
            let long = short.with_timeout(Duration::from_secs(60));
            assert_eq!(short.deadline, long.deadline);
        });
    }
}
