//! Stages, and running them in dependency order.
//!
//! A [`Pipeline`] is a list of [`Stage`]s. Each stage reads either documents
//! supplied by the caller or the finalized output of an earlier stage, runs
//! them through its [`PipelineStep`]s, and finalizes its own output. Stages
//! run one after another, and a stage only starts once everything it depends
//! on is available.

use std::collections::{BTreeMap, HashMap};

use self::{
    context::RunContext,
    stage::{Stage, StageError, StageState},
};
use crate::{prelude::*, writer::validate::check_stage_output};

pub mod context;
pub mod stage;
pub mod stats;
pub mod step;
pub mod triage;

#[allow(unused_imports)]
pub use self::step::PipelineStep;

/// Stages to run, in order.
pub struct Pipeline {
    stages: Vec<Stage>,
    /// Output directories of every stage we know about, including stages
    /// which were left out of this run.
    output_dirs: HashMap<String, PathBuf>,
}

impl Pipeline {
    /// Check stage names and dependencies. Every dependency must name an
    /// earlier stage.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut output_dirs = HashMap::new();
        for stage in &stages {
            if stage.task_count() == 0 {
                return Err(anyhow!("stage {:?} needs at least one task", stage.name()));
            }
            for dependency in stage.dependencies() {
                if !output_dirs.contains_key(dependency) {
                    return Err(anyhow!(
                        "stage {:?} depends on {:?}, which is not an earlier stage",
                        stage.name(),
                        dependency
                    ));
                }
            }
            if output_dirs
                .insert(stage.name().to_owned(), stage.output_dir().to_owned())
                .is_some()
            {
                return Err(anyhow!("duplicate stage name {:?}", stage.name()));
            }
        }
        Ok(Self {
            stages,
            output_dirs,
        })
    }

    /// Names of our stages, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Only run the named stages. Stages left out can still satisfy
    /// dependencies with output from an earlier run.
    pub fn select(mut self, names: &[String]) -> Result<Self> {
        for name in names {
            if !self.output_dirs.contains_key(name) {
                return Err(anyhow!(
                    "unknown stage {:?} (expected one of {})",
                    name,
                    self.stage_names().join(", ")
                ));
            }
        }
        self.stages.retain(|stage| names.iter().any(|n| n == stage.name()));
        Ok(self)
    }

    /// Run every stage in order. Stages which don't depend on a failed stage
    /// still run. Check [`PipelineReport::ensure_success`] for the overall
    /// result.
    #[instrument(level = "debug", name = "pipeline", skip_all, fields(run_id = %ctx.run_id))]
    pub async fn run(self, ctx: &RunContext) -> PipelineReport {
        let mut states = BTreeMap::new();
        let mut order = vec![];
        for stage in &self.stages {
            states.insert(stage.name().to_owned(), StageState::Pending);
            order.push(stage.name().to_owned());
        }
        let mut errors = BTreeMap::new();

        for stage in self.stages {
            let name = stage.name().to_owned();
            if ctx.is_cancelled() {
                states.insert(name.clone(), StageState::Failed);
                errors.insert(name.clone(), StageError::Cancelled { stage: name }.to_string());
                continue;
            }
            if let Err(err) = check_dependencies(&stage, &states, &self.output_dirs) {
                error!(stage = %name, "{err}");
                states.insert(name.clone(), StageState::Failed);
                errors.insert(name, err.to_string());
                continue;
            }

            states.insert(name.clone(), StageState::Running);
            let state = match stage.run(ctx).await {
                Ok(state) => state,
                Err(err) => {
                    error!(stage = %name, "stage failed: {err:#}");
                    errors.insert(name.clone(), format!("{err:#}"));
                    StageState::Failed
                }
            };
            states.insert(name, state);
        }

        PipelineReport {
            stages: order
                .into_iter()
                .map(|name| {
                    let state = states[&name];
                    let error = errors.remove(&name);
                    StageReport { name, state, error }
                })
                .collect(),
        }
    }
}

/// Make sure each dependency either completed in this run, or was not part
/// of this run and has finalized output from an earlier one which passes a
/// deep check.
fn check_dependencies(
    stage: &Stage,
    states: &BTreeMap<String, StageState>,
    output_dirs: &HashMap<String, PathBuf>,
) -> Result<(), StageError> {
    for dependency in stage.dependencies() {
        let not_met = |reason: String| StageError::DependencyNotMet {
            stage: stage.name().to_owned(),
            dependency: dependency.clone(),
            reason,
        };
        match states.get(dependency) {
            Some(StageState::Completed) => {}
            Some(state) => return Err(not_met(format!("it is {state}"))),
            None => {
                let dir = &output_dirs[dependency];
                match check_stage_output(dir, true) {
                    Ok(status) if status.is_valid() => {}
                    Ok(status) => {
                        return Err(not_met(format!("{}: {:?}", dir.display(), status)));
                    }
                    Err(err) => return Err(not_met(format!("{err:#}"))),
                }
            }
        }
    }
    Ok(())
}

/// What happened to each stage.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    /// Stages, in run order.
    pub stages: Vec<StageReport>,
}

/// What happened to one stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Final state.
    pub state: StageState,
    /// Why it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineReport {
    /// State of a stage, if it was part of this run.
    pub fn state(&self, name: &str) -> Option<StageState> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.state)
    }

    /// Fail unless every stage completed.
    pub fn ensure_success(&self) -> Result<()> {
        let failed = self
            .stages
            .iter()
            .filter(|s| s.state != StageState::Completed)
            .map(|s| s.name.clone())
            .collect::<Vec<_>>();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StageError::StagesFailed { failed }.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{context::RunContext, stage::StageSource, *};
    use crate::{
        document::Document,
        pipeline::step::TaskContext,
        ui::Ui,
        writer::{JsonlWriter, WriterConfig},
    };

    struct FailEverything;

    #[async_trait]
    impl PipelineStep for FailEverything {
        fn name(&self) -> &str {
            "fail"
        }

        async fn process(&self, _doc: Document, _ctx: &TaskContext) -> Result<Document> {
            Err(anyhow!("nope"))
        }
    }

    fn stage(name: &str, root: &Path) -> Stage {
        Stage::new(
            name,
            StageSource::Documents(Arc::new(vec![Document::new("a")])),
            root.join(name),
            JsonlWriter::new(WriterConfig::default(), false),
        )
    }

    fn downstream(name: &str, root: &Path, dependency: &str) -> Stage {
        Stage::new(
            name,
            StageSource::StageOutput {
                dir: root.join(dependency),
                filter: None,
            },
            root.join(name),
            JsonlWriter::new(WriterConfig::default(), false),
        )
        .depends_on(dependency)
    }

    #[test]
    fn dependencies_must_be_earlier_stages() {
        let root = Path::new("/tmp/unused");
        let err = Pipeline::new(vec![downstream("b", root, "a"), stage("a", root)])
            .err()
            .unwrap();
        assert!(err.to_string().contains("not an earlier stage"), "{err}");

        let err = Pipeline::new(vec![stage("a", root), stage("a", root)])
            .err()
            .unwrap();
        assert!(err.to_string().contains("duplicate"), "{err}");

        let err = Pipeline::new(vec![stage("a", root).tasks(0)]).err().unwrap();
        assert!(err.to_string().contains("at least one task"), "{err}");
    }

    #[tokio::test]
    async fn runs_stages_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let pipeline = Pipeline::new(vec![
            stage("a", tmp.path()),
            downstream("b", tmp.path(), "a"),
        ])
        .unwrap();
        let report = pipeline.run(&ctx).await;
        report.ensure_success().unwrap();
        assert_eq!(report.state("b"), Some(StageState::Completed));
    }

    #[tokio::test]
    async fn failed_dependency_blocks_dependents_only() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let pipeline = Pipeline::new(vec![
            stage("a", tmp.path()).step(Arc::new(FailEverything)),
            downstream("b", tmp.path(), "a"),
            stage("c", tmp.path()),
        ])
        .unwrap();
        let report = pipeline.run(&ctx).await;
        assert_eq!(report.state("a"), Some(StageState::Failed));
        assert_eq!(report.state("b"), Some(StageState::Failed));
        assert_eq!(report.state("c"), Some(StageState::Completed));
        assert!(!tmp.path().join("b").exists());

        let err = report.ensure_success().unwrap_err();
        match err.downcast_ref::<StageError>() {
            Some(StageError::StagesFailed { failed }) => assert_eq!(failed, &["a", "b"]),
            other => panic!("unexpected error: {other:?}"),
        }
        let b = &report.stages[1];
        assert!(b.error.as_deref().unwrap().contains("depends on \"a\""));
    }

    #[tokio::test]
    async fn selected_stages_need_finalized_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let build = || {
            Pipeline::new(vec![
                stage("a", tmp.path()),
                downstream("b", tmp.path(), "a"),
            ])
            .unwrap()
        };

        // Without output from "a", "b" cannot start.
        let report = build().select(&["b".to_owned()]).unwrap().run(&ctx).await;
        assert_eq!(report.state("a"), None);
        assert_eq!(report.state("b"), Some(StageState::Failed));

        // Once "a" has finalized output, "b" can run on its own.
        build().select(&["a".to_owned()]).unwrap().run(&ctx).await;
        let report = build().select(&["b".to_owned()]).unwrap().run(&ctx).await;
        report.ensure_success().unwrap();

        assert!(build().select(&["zzz".to_owned()]).is_err());
    }

    #[tokio::test]
    async fn damaged_dependency_output_is_not_read() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let build = || {
            Pipeline::new(vec![
                stage("a", tmp.path()),
                downstream("b", tmp.path(), "a"),
            ])
            .unwrap()
        };
        build().select(&["a".to_owned()]).unwrap().run(&ctx).await;

        // Flip a byte inside the compressed data, keeping the size.
        let shard = tmp.path().join("a/00000.jsonl.gz");
        let mut bytes = std::fs::read(&shard).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        std::fs::write(&shard, &bytes).unwrap();

        let report = build().select(&["b".to_owned()]).unwrap().run(&ctx).await;
        assert_eq!(report.state("b"), Some(StageState::Failed));
        assert!(!tmp.path().join("b").exists());

        // Running both rebuilds "a" first.
        build().run(&ctx).await.ensure_success().unwrap();
        assert!(check_stage_output(&tmp.path().join("a"), true).unwrap().is_valid());
    }
}
