//! State shared by every stage of one pipeline run.

use std::sync::Arc;

use tokio::sync::watch;

use super::stats::StatsRegistry;
use crate::{prelude::*, ui::Ui};

/// Everything a stage needs to know about the run it belongs to. Cheap to
/// clone, and lives exactly as long as the run.
#[derive(Clone)]
pub struct RunContext {
    /// Unique ID for this run, recorded in completion markers.
    pub run_id: String,
    /// Per-stage counters.
    pub stats: StatsRegistry,
    /// Progress bars.
    pub ui: Ui,
    /// Where `<stage>/stats.json` files go.
    pub logging_dir: PathBuf,
    cancel: Arc<watch::Sender<bool>>,
}

impl RunContext {
    /// Start a new run.
    pub fn new(ui: Ui, logging_dir: impl Into<PathBuf>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            stats: StatsRegistry::default(),
            ui,
            logging_dir: logging_dir.into(),
            cancel: Arc::new(cancel),
        }
    }

    /// Ask every running stage to stop pulling new documents.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Has [`RunContext::cancel`] been called?
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until the run is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // Only fails if the sender is gone, and we hold it.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let ctx = RunContext::new(Ui::init_for_tests(), "logs");
        assert!(!ctx.is_cancelled());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }
}
