//! The interface shared by every processing step.

use std::sync::Arc;

use super::stats::StageStats;
use crate::{document::Document, prelude::*};

/// Where a step is running.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Name of the stage.
    pub stage: String,
    /// Index of this task within the stage.
    pub rank: usize,
    /// Number of tasks in the stage.
    pub world_size: usize,
    /// Counters for the stage.
    pub stats: Arc<StageStats>,
}

impl TaskContext {
    /// A context for running steps outside of a stage.
    pub fn standalone(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            rank: 0,
            world_size: 1,
            stats: Arc::new(StageStats::default()),
        }
    }
}

/// One document transformation in a stage.
///
/// Per-document problems (unreadable files, extraction timeouts, failed
/// inference) should be recorded as metadata on the returned document. An
/// `Err` fails the whole stage, so save it for problems that affect every
/// document, like an unreachable inference server.
#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    /// A short name, used in logs and stats.
    fn name(&self) -> &str;

    /// Process one document.
    async fn process(&self, document: Document, ctx: &TaskContext) -> Result<Document>;
}
