// Deferred execution values and the combinators used to compose them.
// An Executor does nothing on construction; the whole plan is assembled
// as a value first and only runs when invoked with a cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The execution was aborted because the governing token was cancelled.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// The execution exceeded its allotted lifetime.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("execution exceeded max lifetime of {0:?}")]
pub struct TimedOut(pub Duration);

/// A deferred unit of work.
///
/// Invoking [`Executor::run`] consumes the value and drives it to completion,
/// yielding success or the failure it produced. Combinators never execute
/// their children at construction time.
pub struct Executor {
    inner: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>,
}

impl Executor {
    /// Wrap an async closure as an executor.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Box::new(move |cancel| Box::pin(f(cancel))),
        }
    }

    /// An executor that succeeds without doing anything.
    pub fn noop() -> Self {
        Self::new(|_| async { Ok(()) })
    }

    /// An executor that fails with the given error when invoked.
    pub fn fail(error: anyhow::Error) -> Self {
        Self::new(move |_| async move { Err(error) })
    }

    /// Invoke the executor.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        (self.inner)(cancel).await
    }

    /// Run the given executors in order, stopping at the first failure.
    ///
    /// Cancellation is checked before each child is dispatched; children
    /// after the first failure never run.
    pub fn pipeline(executors: Vec<Executor>) -> Self {
        Self::new(move |cancel| async move {
            for executor in executors {
                if cancel.is_cancelled() {
                    return Err(Cancelled.into());
                }
                executor.run(cancel.clone()).await?;
            }
            Ok(())
        })
    }

    /// Run up to `limit` executors concurrently and wait for all of them.
    ///
    /// The first failure is returned once every child has finished; siblings
    /// of a failed child are allowed to complete. `limit == 0` behaves as 1.
    pub fn parallel(limit: usize, executors: Vec<Executor>) -> Self {
        Self::fan_out(limit, false, executors)
    }

    /// Like [`Executor::parallel`], but the first failure cancels the
    /// remaining siblings through a shared child token.
    pub fn parallel_fail_fast(limit: usize, executors: Vec<Executor>) -> Self {
        Self::fan_out(limit, true, executors)
    }

    fn fan_out(limit: usize, fail_fast: bool, executors: Vec<Executor>) -> Self {
        Self::new(move |cancel| async move {
            let semaphore = Arc::new(Semaphore::new(limit.max(1)));
            let scope = cancel.child_token();
            let mut children: JoinSet<Result<()>> = JoinSet::new();

            for executor in executors {
                let semaphore = Arc::clone(&semaphore);
                let scope = scope.clone();
                children.spawn(async move {
                    let _permit = tokio::select! {
                        permit = Arc::clone(&semaphore).acquire_owned() => {
                            permit.map_err(|_| anyhow::Error::new(Cancelled))?
                        }
                        _ = scope.cancelled() => return Err(Cancelled.into()),
                    };
                    // No new work starts once cancellation has been observed;
                    // in-flight children see the token themselves.
                    if scope.is_cancelled() {
                        return Err(Cancelled.into());
                    }
                    executor.run(scope.clone()).await
                });
            }

            let mut first_failure: Option<anyhow::Error> = None;
            while let Some(joined) = children.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(join_error) if join_error.is_panic() => {
                        Err(anyhow::anyhow!("executor panicked: {join_error}"))
                    }
                    Err(join_error) => Err(anyhow::Error::new(join_error)),
                };
                if let Err(error) = outcome {
                    if first_failure.is_none() {
                        first_failure = Some(error);
                        if fail_fast {
                            scope.cancel();
                        }
                    }
                }
            }

            match first_failure {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    /// Chain a trailing executor that runs regardless of this one's outcome.
    ///
    /// The trailing failure replaces a prior success; a prior failure is
    /// preserved over whatever the trailing executor returns.
    pub fn then(self, next: Executor) -> Self {
        Self::new(move |cancel| async move {
            let prior = self.run(cancel.clone()).await;
            let trailing = next.run(cancel).await;
            match prior {
                Ok(()) => trailing,
                Err(error) => Err(error),
            }
        })
    }

    /// Gate an executor on a predicate evaluated at run time.
    pub fn when<P>(predicate: P, executor: Executor) -> Self
    where
        P: FnOnce() -> bool + Send + 'static,
    {
        Self::new(move |cancel| async move {
            if predicate() {
                executor.run(cancel).await
            } else {
                Ok(())
            }
        })
    }

    /// Gate an executor on the negation of a predicate evaluated at run time.
    pub fn unless<P>(predicate: P, executor: Executor) -> Self
    where
        P: FnOnce() -> bool + Send + 'static,
    {
        Self::when(move || !predicate(), executor)
    }

    /// Attach a cleanup executor that always runs after this one.
    ///
    /// The body's failure wins; a cleanup failure only surfaces when the
    /// body succeeded.
    pub fn finally(self, cleanup: Executor) -> Self {
        Self::new(move |cancel| async move {
            let outcome = self.run(cancel.clone()).await;
            let cleaned = cleanup.run(cancel).await;
            match outcome {
                Ok(()) => cleaned,
                Err(error) => {
                    if let Err(cleanup_error) = cleaned {
                        tracing::warn!("cleanup after failure also failed: {cleanup_error:#}");
                    }
                    Err(error)
                }
            }
        })
    }

    /// Run this executor on its own task so that a panic is captured and
    /// converted into a normal failure instead of unwinding the caller.
    pub fn guarded(self) -> Self {
        Self::new(move |cancel| async move {
            match tokio::spawn(self.run(cancel)).await {
                Ok(outcome) => outcome,
                Err(join_error) if join_error.is_panic() => {
                    Err(anyhow::anyhow!("executor panicked: {join_error}"))
                }
                Err(join_error) => Err(anyhow::Error::new(join_error)),
            }
        })
    }

    /// Abort this executor with [`TimedOut`] when `limit` elapses.
    ///
    /// The timed scope cancels its own child token first so in-flight work
    /// observes cancellation at the next suspension point.
    pub fn timed(self, limit: Duration) -> Self {
        Self::new(move |cancel| async move {
            let scope = cancel.child_token();
            tokio::select! {
                outcome = self.run(scope.clone()) => outcome,
                _ = tokio::time::sleep(limit) => {
                    scope.cancel();
                    Err(TimedOut(limit).into())
                }
            }
        })
    }
}

/// True when the error is a cancellation outcome rather than a real failure.
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error.downcast_ref::<Cancelled>().is_some()
}
