//! Running untrusted parsers on a thread of their own.
//!
//! `lopdf` recurses as it walks nested objects, and it can panic on input it
//! doesn't expect. Neither should take down the whole run because of one bad
//! PDF, so we parse on a dedicated thread with a large stack and turn panics
//! into ordinary errors.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread,
};

use tokio::sync::oneshot;

use crate::{cpu_limit::with_cpu_semaphore, prelude::*};

/// Stack size for isolated threads. This is reserved address space, and only
/// touched pages are actually allocated.
const ISOLATED_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Run `f` on a fresh thread with a large stack, reporting a panic as an
/// error.
///
/// The thread isn't tied to Tokio's blocking pool, so we hold a CPU permit
/// while it runs instead. If the caller gives up waiting, the thread still
/// runs to completion and its result is dropped.
pub async fn run_isolated<F, T>(name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    with_cpu_semaphore(|| run_on_thread(name, f)).await
}

async fn run_on_thread<F, T>(name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let thread_name = name.to_owned();
    thread::Builder::new()
        .name(thread_name.clone())
        .stack_size(ISOLATED_STACK_SIZE)
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                Err(anyhow!(
                    "{thread_name} panicked: {}",
                    panic_message(&*payload)
                ))
            });
            // Nobody may be listening any more.
            let _ = tx.send(result);
        })
        .with_context(|| format!("cannot start {name} thread"))?;
    rx.await
        .with_context(|| format!("{name} thread exited without a result"))?
}

/// Extract the message from a panic payload, if it has one.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
