use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Coordinates long-running tasks: a process-wide quit signal, a default
/// per-call timeout, and a task counter that lets shutdown wait for
/// in-flight work to drain.
///
/// Two scope flavors exist: [`ContextGuard::with_ctx_quit`] cancels on quit
/// or timeout, while [`ContextGuard::ctx_blocking`] only cancels on timeout
/// so durable writes can finish even during shutdown.
#[derive(Debug, Clone)]
pub struct ContextGuard {
    inner: Arc<GuardInner>,
}

#[derive(Debug)]
struct GuardInner {
    quit: broadcast::Sender<()>,
    default_timeout: Duration,
    active_tasks: AtomicUsize,
    drained: Notify,
}

/// The outcome of a guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    /// The future completed.
    Done(T),
    /// The quit signal fired before completion.
    Quit,
    /// The timeout elapsed before completion.
    TimedOut,
}

impl<T> GuardOutcome<T> {
    /// Converts the outcome into a result, mapping cancellation to the
    /// provided error.
    pub fn or_cancelled<E>(self, err: impl FnOnce() -> E) -> Result<T, E> {
        match self {
            GuardOutcome::Done(value) => Ok(value),
            GuardOutcome::Quit | GuardOutcome::TimedOut => Err(err()),
        }
    }
}

impl ContextGuard {
    /// Creates a guard with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        let (quit, _) = broadcast::channel(1);
        ContextGuard {
            inner: Arc::new(GuardInner {
                quit,
                default_timeout,
                active_tasks: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Broadcasts the quit signal. Cancellable scopes abort; blocking
    /// scopes run to completion or their timeout.
    pub fn quit(&self) {
        let _ = self.inner.quit.send(());
    }

    /// Runs a future under the default timeout, cancelled by quit.
    pub async fn with_ctx_quit<F: Future>(&self, fut: F) -> GuardOutcome<F::Output> {
        self.with_ctx_quit_timeout(self.inner.default_timeout, fut)
            .await
    }

    /// Runs a future under a custom timeout, cancelled by quit.
    pub async fn with_ctx_quit_timeout<F: Future>(
        &self,
        timeout: Duration,
        fut: F,
    ) -> GuardOutcome<F::Output> {
        let mut quit = self.inner.quit.subscribe();
        let _task = self.task();

        tokio::select! {
            _ = quit.recv() => GuardOutcome::Quit,
            _ = tokio::time::sleep(timeout) => GuardOutcome::TimedOut,
            value = fut => GuardOutcome::Done(value),
        }
    }

    /// Runs a future that must not be interrupted by shutdown; only its
    /// timeout can cancel it. Used around durable-write sections.
    pub async fn ctx_blocking<F: Future>(&self, fut: F) -> GuardOutcome<F::Output> {
        self.ctx_blocking_timeout(self.inner.default_timeout, fut)
            .await
    }

    /// Blocking scope with a custom timeout.
    pub async fn ctx_blocking_timeout<F: Future>(
        &self,
        timeout: Duration,
        fut: F,
    ) -> GuardOutcome<F::Output> {
        let _task = self.task();

        tokio::select! {
            _ = tokio::time::sleep(timeout) => GuardOutcome::TimedOut,
            value = fut => GuardOutcome::Done(value),
        }
    }

    /// Registers a task with the guard; dropping the handle deregisters it.
    pub fn task(&self) -> TaskHandle {
        self.inner.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// A receiver of the quit signal, for tasks that select on it directly.
    pub fn subscribe_quit(&self) -> broadcast::Receiver<()> {
        self.inner.quit.subscribe()
    }

    /// Waits until every registered task has finished.
    pub async fn wait_for_drain(&self) {
        loop {
            // Arm the notification before checking the counter so a task
            // finishing in between cannot be missed.
            let drained = self.inner.drained.notified();
            if self.inner.active_tasks.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// The guard's default timeout.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }
}

/// Keeps the guard's task counter up while held.
#[derive(Debug)]
pub struct TaskHandle {
    inner: Arc<GuardInner>,
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.inner.active_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellable_scope_aborts_on_quit() {
        let guard = ContextGuard::new(Duration::from_secs(5));
        let inner = guard.clone();

        let handle = tokio::spawn(async move {
            inner
                .with_ctx_quit(std::future::pending::<()>())
                .await
        });
        tokio::task::yield_now().await;
        guard.quit();

        assert_eq!(handle.await.unwrap(), GuardOutcome::Quit);
    }

    #[tokio::test]
    async fn blocking_scope_survives_quit() {
        let guard = ContextGuard::new(Duration::from_secs(5));
        guard.quit();

        let outcome = guard
            .ctx_blocking(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            })
            .await;
        assert_eq!(outcome, GuardOutcome::Done(42));
    }

    #[tokio::test]
    async fn timeout_cancels_both_scopes() {
        let guard = ContextGuard::new(Duration::from_millis(10));
        assert_eq!(
            guard.with_ctx_quit(std::future::pending::<()>()).await,
            GuardOutcome::TimedOut
        );
        assert_eq!(
            guard.ctx_blocking(std::future::pending::<()>()).await,
            GuardOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let guard = ContextGuard::new(Duration::from_secs(1));
        let task = guard.task();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.wait_for_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(task);
        waiter.await.unwrap();
    }
}
