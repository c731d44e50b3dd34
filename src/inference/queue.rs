//! Async request processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overload, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! Note that this is a strictly "in process" queue for meant for
//! closely-related subtasks of a larger task. It does not attempt to handle
//! priorities or starvation.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
};

/// Work items contain an input, and a one-shot channel on which to return the
/// result.
#[derive(Debug)]
pub struct WorkItem<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// The input to the work item.
    pub input: Input,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<Output>>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A queue that processes work items in parallel, never running more than
/// `concurrency_limit` of them at once.
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one time,
    /// and another `concurrency_limit` work items may be in progress. Anything
    /// that retries must do so inside `work_fn`, so retries count against the
    /// limit too.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> Result<(Self, JoinWorker)> {
        if concurrency_limit == 0 {
            return Err(anyhow!("work queue concurrency limit must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if let Err(_sent_value) = item.tx.send(result) {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    /// Process an input and wait for the output.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    pub async fn process_blocking(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut sender = self.tx.clone();
        sender
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        rx.await.context("failed to receive work item result")?
    }
}
