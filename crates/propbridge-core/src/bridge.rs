/*!
 * Execution bridge between blocking callers and device operations.
 *
 * Device operations are futures: some complete on their first poll, others
 * suspend on I/O. Blocking callers (worker threads, the discovery thread,
 * the sampling loop) drive them through [`ExecutionBridge::run`], which owns
 * exactly one lazily-created single-threaded tokio runtime per OS thread and
 * bounds every operation by a timeout.
 *
 * An operation that times out is abandoned, not cancelled: it stays queued on
 * its thread's runtime and makes progress whenever that thread drives the
 * next operation, which may be much later. A timed-out write can thus reach
 * the device after its caller has given up and released whatever lock it
 * held. Callers must never tie shared state to the completion of an
 * abandoned operation.
 */
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::Error;

thread_local! {
    static CONTEXT: RefCell<Option<Runtime>> = RefCell::new(None);
}

/// Result of a bounded operation
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The operation completed and produced a value
    Completed(T),
    /// The operation did not complete within its timeout
    TimedOut,
    /// The operation completed with an error
    Failed(E),
}

impl<T, E> Outcome<T, E> {
    /// Check if the operation completed successfully
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Check if the operation timed out
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    /// Get the value, discarding timeouts and failures
    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Map the completed value
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U, E> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }
}

impl<T, E: From<Error>> Outcome<T, E> {
    /// Convert into a result, turning a timeout into a timeout error
    pub fn into_result(self, operation: &str) -> Result<T, E> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::TimedOut => Err(Error::timeout(format!("{} timed out", operation)).into()),
            Outcome::Failed(e) => Err(e),
        }
    }
}

impl<T, E: fmt::Display> fmt::Display for Outcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed(_) => f.write_str("completed"),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Per-thread bridge between blocking callers and device futures
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionBridge;

impl ExecutionBridge {
    /// Bound a future by a timeout.
    ///
    /// Dropping the returned future cancels the wait, not `op` itself when it
    /// was spawned elsewhere.
    pub async fn bounded<F, T, E>(op: F, limit: Duration) -> Outcome<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        match timeout(limit, op).await {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Drive an operation to completion on this thread's context, waiting at most `limit`.
    ///
    /// Must be called from a thread that is not itself driving a tokio runtime;
    /// such calls fail instead of blocking the runtime.
    pub fn run<F, T, E>(op: F, limit: Duration) -> Outcome<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Outcome::Failed(
                Error::runtime("ExecutionBridge::run called from an async context; use bounded()")
                    .into(),
            );
        }

        CONTEXT.with(|cell| {
            if cell.borrow().is_none() {
                match Self::build_context() {
                    Ok(runtime) => *cell.borrow_mut() = Some(runtime),
                    Err(e) => return Outcome::Failed(e.into()),
                }
            }

            let guard = cell.borrow();
            let Some(runtime) = guard.as_ref() else {
                return Outcome::Failed(Error::runtime("execution context missing").into());
            };

            let task = runtime.spawn(op);
            let joined = async move {
                match task.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        Err(Error::runtime(format!("operation aborted: {}", join_error)).into())
                    }
                }
            };
            let outcome = runtime.block_on(Self::bounded(joined, limit));
            if outcome.is_timed_out() {
                trace!("Operation abandoned after {:?}", limit);
            }
            outcome
        })
    }

    /// Check whether the current thread already owns an execution context
    pub fn has_context() -> bool {
        CONTEXT.with(|cell| cell.borrow().is_some())
    }

    fn build_context() -> Result<Runtime, Error> {
        let thread = std::thread::current();
        debug!(
            "Creating execution context for thread {}",
            thread.name().unwrap_or("<unnamed>")
        );
        Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::runtime(format!("Failed to create execution context: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ready_operation_completes() {
        let outcome = ExecutionBridge::run(async { Ok::<_, Error>(7) }, Duration::from_millis(50));
        assert_eq!(outcome.ok(), Some(7));
    }

    #[test]
    fn test_suspending_operation_completes() {
        let outcome = ExecutionBridge::run(
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, Error>("done")
            },
            Duration::from_secs(1),
        );
        assert!(outcome.is_completed());
    }

    #[test_log::test]
    fn test_slow_operation_times_out() {
        let outcome = ExecutionBridge::run(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            },
            Duration::from_millis(20),
        );
        assert!(outcome.is_timed_out());
        assert!(matches!(outcome.into_result("slow read"), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_failure_is_reported() {
        let outcome: Outcome<(), Error> =
            ExecutionBridge::run(async { Err(Error::other("boom")) }, Duration::from_secs(1));
        assert!(matches!(outcome, Outcome::Failed(Error::Other(_))));
    }

    #[test]
    fn test_context_is_created_lazily_and_reused() {
        thread::spawn(|| {
            assert!(!ExecutionBridge::has_context());
            let _ = ExecutionBridge::run(async { Ok::<_, Error>(()) }, Duration::from_secs(1));
            assert!(ExecutionBridge::has_context());
            let outcome = ExecutionBridge::run(async { Ok::<_, Error>(1) }, Duration::from_secs(1));
            assert!(outcome.is_completed());
        })
        .join()
        .unwrap();
    }

    #[test_log::test]
    fn test_abandoned_operation_keeps_running_on_its_context() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let outcome = ExecutionBridge::run(
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, Error>(())
            },
            Duration::from_millis(1),
        );
        assert!(outcome.is_timed_out());

        // Driving the same context again lets the orphaned task finish
        let _ = ExecutionBridge::run(
            async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, Error>(())
            },
            Duration::from_secs(1),
        );
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_refuses_async_context() {
        let outcome = ExecutionBridge::run(async { Ok::<_, Error>(()) }, Duration::from_secs(1));
        assert!(matches!(outcome, Outcome::Failed(Error::Runtime(_))));
    }

    #[test]
    fn test_bounded_future() {
        let outcome = tokio_test::block_on(ExecutionBridge::bounded(
            async { Ok::<_, Error>(3) },
            Duration::from_secs(1),
        ));
        assert_eq!(outcome.ok(), Some(3));

        let outcome = tokio_test::block_on(ExecutionBridge::bounded(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, Error>(())
            },
            Duration::from_millis(5),
        ));
        assert!(outcome.is_timed_out());
    }
}
