//! Per-stage counters, saved as `stats.json` when a stage finishes.

use std::{
    collections::BTreeMap,
    fs,
    sync::{Arc, Mutex},
};

use crate::prelude::*;

/// Counters for one stage.
#[derive(Debug, Default)]
pub struct StageStats {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl StageStats {
    /// Add one to `key`.
    pub fn incr(&self, key: &str) {
        self.add(key, 1);
    }

    /// Add `n` to `key`.
    pub fn add(&self, key: &str, n: u64) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.counters.lock().expect("lock poisoned");
        *counters.entry(key.to_owned()).or_default() += n;
    }

    /// Get a counter.
    pub fn get(&self, key: &str) -> u64 {
        let counters = self.counters.lock().expect("lock poisoned");
        counters.get(key).copied().unwrap_or(0)
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().expect("lock poisoned").clone()
    }
}

/// Summary of one stage, as written to `stats.json`.
#[derive(Clone, Debug, Serialize)]
pub struct StageSummary {
    /// Stage name.
    pub stage: String,
    /// Final state.
    pub state: String,
    /// Wall-clock seconds.
    pub elapsed_secs: f64,
    /// Counters.
    pub counters: BTreeMap<String, u64>,
}

/// Counters for every stage in a run.
#[derive(Clone, Debug, Default)]
pub struct StatsRegistry {
    stages: Arc<Mutex<BTreeMap<String, Arc<StageStats>>>>,
}

impl StatsRegistry {
    /// Get (or create) the counters for a stage.
    pub fn stage(&self, name: &str) -> Arc<StageStats> {
        self.stages
            .lock()
            .expect("lock poisoned")
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Write a stage summary to `<logging_dir>/<stage>/stats.json`.
    pub fn write_summary(&self, logging_dir: &Path, summary: &StageSummary) -> Result<()> {
        let dir = logging_dir.join(&summary.stage);
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
        let path = dir.join("stats.json");
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json + "\n")
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(())
    }
}
