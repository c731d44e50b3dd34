//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `pdftotext` and
/// `pdftocairo` processes and isolated parser threads.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core. Stage tasks and OCR page rendering can easily
/// ask for far more processes than we have cores.
///
/// You don't need to do this for in-process CPU-bound tasks, as long as you're
/// using
/// [`crate::async_utils::blocking_iter_streams::spawn_blocking_propagating_panics`].
/// But you should use it for expensive external processes, and for threads
/// spawned outside the blocking pool, like
/// [`crate::async_utils::isolated::run_isolated`].
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    // Acquire a permit from the semaphore.
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    // Run the function while holding the permit.
    let result = f().await;
    // Release the permit.
    drop(permit);
    result
}
