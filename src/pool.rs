//! Bounded-concurrency runner shared by prefetch and warm phases.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deferred unit of work. Not started until the pool has a free slot; gets
/// a child token it may poll for early exit.
pub type PoolTask<E> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), E>> + Send>;

pub fn task<F, Fut, E>(f: F) -> PoolTask<E>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settled {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Never started, or abandoned mid-flight.
    pub cancelled: usize,
}

/// Run every task with at most `concurrency` in flight. A failing or
/// panicking task does not affect its siblings. Resolves once all tasks
/// have settled. `concurrency` of 0 is treated as 1.
pub async fn run<E>(
    tasks: Vec<PoolTask<E>>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> PoolReport
where
    E: Display + Send + 'static,
{
    let limit = concurrency.max(1);
    let total = tasks.len();

    let settled: Vec<Settled> = stream::iter(tasks.into_iter().enumerate())
        .map(|(idx, task)| {
            let token = cancel.child_token();
            async move {
                if token.is_cancelled() {
                    return Settled::Cancelled;
                }
                let body = AssertUnwindSafe(async { task(token.clone()).await }).catch_unwind();
                tokio::select! {
                    biased;
                    () = token.cancelled() => Settled::Cancelled,
                    outcome = body => match outcome {
                        Ok(Ok(())) => Settled::Succeeded,
                        Ok(Err(e)) => {
                            debug!(task = idx, error = %e, "Pool task failed");
                            Settled::Failed
                        }
                        Err(_) => {
                            warn!(task = idx, "Pool task panicked");
                            Settled::Failed
                        }
                    },
                }
            }
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    let mut report = PoolReport {
        total,
        ..PoolReport::default()
    };
    for outcome in settled {
        match outcome {
            Settled::Succeeded => report.succeeded += 1,
            Settled::Failed => report.failed += 1,
            Settled::Cancelled => report.cancelled += 1,
        }
    }
    debug!(
        total,
        succeeded = report.succeeded,
        failed = report.failed,
        cancelled = report.cancelled,
        "Pool drained"
    );
    report
}
