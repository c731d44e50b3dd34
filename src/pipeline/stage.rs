//! Running one stage: a source of documents, a chain of steps, and durable
//! output.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt as _, future, stream};
use indicatif::ProgressBar;
use tokio::sync::watch;

use super::{
    context::RunContext,
    stats::{StageStats, StageSummary},
    step::{PipelineStep, TaskContext},
};
use crate::{
    async_utils::{BoxedStream, JoinWorker},
    document::Document,
    prelude::*,
    router::RouteFilter,
    ui::ProgressConfig,
    writer::{
        CompletionMarker, JsonlWriter, ShardSummary, StagingDir, WriterSession,
        reader::StageOutput,
        validate::{StageOutputStatus, check_stage_output},
    },
};

/// Where a stage gets its documents.
#[derive(Clone, Debug)]
pub enum StageSource {
    /// Documents loaded by the caller. Split round-robin across tasks.
    Documents(Arc<Vec<Document>>),
    /// The finalized output of an earlier stage. Split by shard across tasks.
    StageOutput {
        /// Output directory of the earlier stage.
        dir: PathBuf,
        /// Only pass along matching documents.
        filter: Option<RouteFilter>,
    },
}

/// Lifecycle of a stage within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not started.
    Pending,
    /// Tasks are running.
    Running,
    /// Output is finalized, either by this run or an earlier one.
    Completed,
    /// Nothing was finalized.
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Structural stage failures. Other failures are reported as plain
/// [`anyhow::Error`] values.
#[derive(Debug)]
pub enum StageError {
    /// A dependency did not complete in this run, and has no finalized output
    /// from an earlier one.
    DependencyNotMet {
        /// The stage that could not start.
        stage: String,
        /// The dependency.
        dependency: String,
        /// Why we could not use the dependency.
        reason: String,
    },
    /// The run was cancelled, or the stage ran out of time.
    Cancelled {
        /// The stage.
        stage: String,
    },
    /// One or more stages failed.
    StagesFailed {
        /// Names of failed stages.
        failed: Vec<String>,
    },
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::DependencyNotMet {
                stage,
                dependency,
                reason,
            } => write!(
                f,
                "stage {stage:?} depends on {dependency:?}, which is not available: {reason}"
            ),
            StageError::Cancelled { stage } => {
                write!(f, "stage {stage:?} was cancelled before it finished")
            }
            StageError::StagesFailed { failed } => {
                write!(f, "failed stages: {}", failed.join(", "))
            }
        }
    }
}

impl std::error::Error for StageError {}

/// A stage, ready to run.
pub struct Stage {
    name: String,
    source: StageSource,
    steps: Vec<Arc<dyn PipelineStep>>,
    tasks: usize,
    documents_in_flight: usize,
    output_dir: PathBuf,
    writer: JsonlWriter,
    depends_on: Vec<String>,
    timeout: Option<Duration>,
    force: bool,
    workers: Vec<JoinWorker>,
}

impl Stage {
    /// Create a stage with no steps, one task, and one document in flight.
    pub fn new(
        name: impl Into<String>,
        source: StageSource,
        output_dir: impl Into<PathBuf>,
        writer: JsonlWriter,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            steps: vec![],
            tasks: 1,
            documents_in_flight: 1,
            output_dir: output_dir.into(),
            writer,
            depends_on: vec![],
            timeout: None,
            force: false,
            workers: vec![],
        }
    }

    /// Append a step. Steps run in the order they were added.
    pub fn step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of parallel tasks.
    pub fn tasks(mut self, tasks: usize) -> Self {
        self.tasks = tasks;
        self
    }

    /// How many documents each task may have in its step chain at once.
    pub fn documents_in_flight(mut self, n: usize) -> Self {
        self.documents_in_flight = n;
        self
    }

    /// Require another stage to finish first.
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Give up on the stage after this long.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run even if finalized output already exists.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// A background worker which finishes once our steps are dropped, and
    /// which should be joined when the stage is done.
    pub fn background_worker(mut self, worker: JoinWorker) -> Self {
        self.workers.push(worker);
        self
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Stages we depend on.
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Number of tasks.
    pub fn task_count(&self) -> usize {
        self.tasks
    }

    /// Do we already have finalized output from an earlier run? Every shard
    /// is decompressed and counted, so damaged output gets rebuilt.
    pub fn can_skip(&self) -> Result<bool> {
        if self.force {
            return Ok(false);
        }
        let status = check_stage_output(&self.output_dir, true)?;
        if let StageOutputStatus::Corrupt { reason } = &status {
            warn!(
                output = %self.output_dir.display(),
                "finalized output is damaged, running again: {reason}"
            );
        }
        Ok(status.is_valid())
    }

    /// Run the stage, writing `stats.json` whatever happens.
    #[instrument(level = "info", name = "stage", skip_all, fields(stage = %self.name))]
    pub async fn run(self, ctx: &RunContext) -> Result<StageState> {
        if self.can_skip()? {
            info!(
                output = %self.output_dir.display(),
                "output already finalized, skipping"
            );
            return Ok(StageState::Completed);
        }

        let name = self.name.clone();
        let logging_dir = ctx.logging_dir.clone();
        let stats = ctx.stats.stage(&name);
        let started = Instant::now();
        let result = self.run_tasks(ctx, stats.clone()).await;
        let state = if result.is_ok() {
            StageState::Completed
        } else {
            StageState::Failed
        };
        let summary = StageSummary {
            stage: name,
            state: state.to_string(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            counters: stats.snapshot(),
        };
        if let Err(err) = ctx.stats.write_summary(&logging_dir, &summary) {
            warn!("cannot write stage stats: {err:#}");
        }
        result.map(|()| state)
    }

    /// Run every task, then promote or discard the staged output.
    async fn run_tasks(self, ctx: &RunContext, stats: Arc<StageStats>) -> Result<()> {
        let Stage {
            name,
            source,
            steps,
            tasks,
            documents_in_flight,
            output_dir,
            writer,
            timeout,
            workers,
            ..
        } = self;
        if tasks == 0 || documents_in_flight == 0 {
            return Err(anyhow!(
                "stage {name:?} needs at least one task and one document in flight"
            ));
        }

        // Open our source before touching the filesystem, so an unusable
        // dependency leaves no trace.
        let (inputs, size_hint) = partition_source(&source, tasks)?;

        let staging = StagingDir::create(&output_dir, &ctx.run_id)?;
        let progress = ctx.ui.new_from_size_hint(
            &ProgressConfig {
                emoji: "📄",
                msg: &name,
                done_msg: &name,
            },
            size_hint,
        );

        // Stop pulling documents on Ctrl-C or when we run out of time.
        let (stop_tx, stop_rx) = watch::channel(ctx.is_cancelled());
        let stopper = {
            let ctx = ctx.clone();
            let stage = name.clone();
            tokio::spawn(async move {
                match timeout {
                    Some(timeout) => {
                        tokio::select! {
                            _ = ctx.cancelled() => {}
                            _ = tokio::time::sleep(timeout) => {
                                warn!(%stage, ?timeout, "stage timed out");
                            }
                        }
                    }
                    None => ctx.cancelled().await,
                }
                stop_tx.send_replace(true);
            })
        };

        let steps = Arc::new(steps);
        let handles = inputs
            .into_iter()
            .enumerate()
            .map(|(rank, input)| {
                let task = StageTask {
                    ctx: TaskContext {
                        stage: name.clone(),
                        rank,
                        world_size: tasks,
                        stats: stats.clone(),
                    },
                    steps: steps.clone(),
                    documents_in_flight,
                    stop: stop_rx.clone(),
                    progress: progress.clone(),
                };
                let session = writer.open(staging.path(), rank);
                let shard = writer.shard_name(rank);
                tokio::spawn(async move { task.run(input, session?, shard).await })
            })
            .collect::<Vec<_>>();

        let mut shards = Vec::with_capacity(tasks);
        let mut first_error = None;
        for handle in future::join_all(handles).await {
            match handle.context("stage task panicked").and_then(|r| r) {
                Ok(shard) => shards.push(shard),
                Err(err) => {
                    error!("stage task failed: {err:#}");
                    first_error.get_or_insert(err);
                }
            }
        }
        stopper.abort();
        progress.finish();

        // Our steps may own queues whose workers only exit once dropped.
        drop(steps);
        for worker in workers {
            if let Err(err) = worker.join().await {
                warn!("background worker failed: {err:#}");
            }
        }

        if let Some(err) = first_error {
            staging.discard();
            return Err(err);
        }
        let marker = CompletionMarker {
            stage: name,
            run_id: ctx.run_id.clone(),
            compression: writer.compression(),
            shards,
        };
        staging.promote(&marker)
    }
}

/// Split a source into one document stream per task.
fn partition_source(
    source: &StageSource,
    tasks: usize,
) -> Result<(Vec<BoxedStream<Result<Document>>>, Option<usize>)> {
    match source {
        StageSource::Documents(documents) => {
            let streams = (0..tasks)
                .map(|rank| {
                    let assigned = documents
                        .iter()
                        .skip(rank)
                        .step_by(tasks)
                        .cloned()
                        .map(Ok)
                        .collect::<Vec<_>>();
                    stream::iter(assigned).boxed()
                })
                .collect();
            Ok((streams, Some(documents.len())))
        }
        StageSource::StageOutput { dir, filter } => {
            let output = StageOutput::open(dir)?;
            let size_hint = filter.is_none().then(|| output.marker().total_records());
            let streams = (0..tasks)
                .map(|rank| {
                    let docs = output.read_for_rank(rank, tasks);
                    match *filter {
                        Some(filter) => docs
                            .filter(move |doc| {
                                future::ready(match doc {
                                    Ok(doc) => filter.matches(doc),
                                    Err(_) => true,
                                })
                            })
                            .boxed(),
                        None => docs,
                    }
                })
                .collect();
            Ok((streams, size_hint))
        }
    }
}

/// One task's share of a stage.
struct StageTask {
    ctx: TaskContext,
    steps: Arc<Vec<Arc<dyn PipelineStep>>>,
    documents_in_flight: usize,
    stop: watch::Receiver<bool>,
    progress: ProgressBar,
}

impl StageTask {
    /// Process our documents in order, always closing our session.
    #[instrument(level = "debug", name = "task", skip_all, fields(rank = self.ctx.rank))]
    async fn run(
        self,
        input: BoxedStream<Result<Document>>,
        mut session: WriterSession,
        shard: String,
    ) -> Result<ShardSummary> {
        let result = self.process_all(input, &mut session).await;
        let closed = session.close().await;
        result?;
        closed?;
        Ok(ShardSummary {
            file: shard,
            records: session.records(),
            bytes: session.bytes(),
        })
    }

    async fn process_all(
        &self,
        input: BoxedStream<Result<Document>>,
        session: &mut WriterSession,
    ) -> Result<()> {
        let stop = &self.stop;
        let mut outputs = input
            .take_while(|_| future::ready(!*stop.borrow()))
            .map(|doc| async move {
                let doc = doc.context("cannot read input document")?;
                self.ctx.stats.incr("documents_read");
                self.run_steps(doc).await
            })
            .buffered(self.documents_in_flight);
        while let Some(doc) = outputs.next().await {
            let doc = doc?;
            session.write(&doc).await?;
            self.ctx.stats.incr("documents_written");
            self.progress.inc(1);
        }
        if *stop.borrow() {
            return Err(StageError::Cancelled {
                stage: self.ctx.stage.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn run_steps(&self, mut doc: Document) -> Result<Document> {
        for step in self.steps.iter() {
            let id = doc.id.clone();
            doc = step
                .process(doc, &self.ctx)
                .await
                .with_context(|| format!("step {:?} failed on document {:?}", step.name(), id))?;
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ui::Ui, writer::WriterConfig};

    /// Uppercases text, and fails on documents named "boom".
    struct Shout {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PipelineStep for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        async fn process(&self, mut doc: Document, ctx: &TaskContext) -> Result<Document> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if doc.id == "boom" {
                return Err(anyhow!("boom"));
            }
            doc.text = doc.id.to_uppercase();
            ctx.stats.incr("shouted");
            Ok(doc)
        }
    }

    fn docs(ids: &[&str]) -> StageSource {
        StageSource::Documents(Arc::new(ids.iter().map(|id| Document::new(*id)).collect()))
    }

    fn writer() -> JsonlWriter {
        JsonlWriter::new(WriterConfig::default(), false)
    }

    async fn read_ids(dir: &Path) -> Vec<String> {
        let docs = StageOutput::open(dir).unwrap().read_all();
        let mut ids = docs
            .map(|doc| doc.unwrap().id)
            .collect::<Vec<_>>()
            .await;
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn writes_every_document_once() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let stage = Stage::new("shout", docs(&["a", "b", "c", "d", "e"]), &out, writer())
            .step(Arc::new(Shout {
                calls: AtomicUsize::new(0),
            }))
            .tasks(2)
            .documents_in_flight(3);
        assert_eq!(stage.run(&ctx).await.unwrap(), StageState::Completed);

        assert_eq!(read_ids(&out).await, vec!["a", "b", "c", "d", "e"]);
        let marker = CompletionMarker::read(&out).unwrap();
        assert_eq!(marker.shards.len(), 2);
        assert_eq!(marker.total_records(), 5);
        assert_eq!(marker.run_id, ctx.run_id);

        let stats: Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join("logs/shout/stats.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stats["state"], json!("completed"));
        assert_eq!(stats["counters"]["documents_written"], json!(5));
        assert_eq!(stats["counters"]["shouted"], json!(5));
    }

    #[tokio::test]
    async fn output_order_matches_input_order_within_a_task() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let ids = (0..20).map(|i| format!("doc{i:02}")).collect::<Vec<_>>();
        let source = StageSource::Documents(Arc::new(
            ids.iter().map(|id| Document::new(id.as_str())).collect(),
        ));
        Stage::new("ordered", source, &out, writer())
            .documents_in_flight(4)
            .run(&ctx)
            .await
            .unwrap();
        let read = StageOutput::open(&out)
            .unwrap()
            .read_all()
            .map(|doc| doc.unwrap().id)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(read, ids);
    }

    #[tokio::test]
    async fn failed_stage_leaves_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let stage = Stage::new("shout", docs(&["a", "boom", "c"]), &out, writer()).step(
            Arc::new(Shout {
                calls: AtomicUsize::new(0),
            }),
        );
        let err = stage.run(&ctx).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert_eq!(
            check_stage_output(&out, true).unwrap(),
            StageOutputStatus::Missing
        );
        // No staging directories are left behind either.
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("inprogress"))
            .count();
        assert_eq!(leftovers, 0);

        let stats: Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join("logs/shout/stats.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stats["state"], json!("failed"));
    }

    #[tokio::test]
    async fn finalized_output_is_skipped_unless_forced() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let shout = Arc::new(Shout {
            calls: AtomicUsize::new(0),
        });
        let make = |force| {
            Stage::new("shout", docs(&["a", "b"]), &out, writer())
                .step(shout.clone())
                .force(force)
        };
        make(false).run(&ctx).await.unwrap();
        assert_eq!(shout.calls.load(Ordering::SeqCst), 2);
        assert_eq!(make(false).run(&ctx).await.unwrap(), StageState::Completed);
        assert_eq!(shout.calls.load(Ordering::SeqCst), 2);
        make(true).run(&ctx).await.unwrap();
        assert_eq!(shout.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn truncated_output_is_rebuilt() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let shout = Arc::new(Shout {
            calls: AtomicUsize::new(0),
        });
        let make = || Stage::new("shout", docs(&["a", "b"]), &out, writer()).step(shout.clone());
        make().run(&ctx).await.unwrap();

        let shard = out.join("00000.jsonl.gz");
        let bytes = std::fs::read(&shard).unwrap();
        std::fs::write(&shard, &bytes[..bytes.len() / 2]).unwrap();

        assert_eq!(make().run(&ctx).await.unwrap(), StageState::Completed);
        assert_eq!(shout.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            check_stage_output(&out, true).unwrap(),
            StageOutputStatus::Valid { records: 2 }
        );
    }

    /// Takes a while with each document.
    struct Slow;

    #[async_trait]
    impl PipelineStep for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn process(&self, doc: Document, _ctx: &TaskContext) -> Result<Document> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(doc)
        }
    }

    #[tokio::test]
    async fn timed_out_stage_is_not_finalized() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let out = tmp.path().join("out");
        let err = Stage::new("slow", docs(&["a", "b", "c", "d"]), &out, writer())
            .step(Arc::new(Slow))
            .timeout(Some(Duration::from_millis(50)))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::Cancelled { .. })
        ));
        assert!(!ctx.is_cancelled());

        assert!(!out.exists());
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("inprogress"))
            .count();
        assert_eq!(leftovers, 0);

        let stats: Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join("logs/slow/stats.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stats["state"], json!("failed"));
        // The document already in flight finished, and nothing after it started.
        assert_eq!(stats["counters"]["documents_read"], json!(1));
    }

    #[tokio::test]
    async fn reads_filtered_stage_output() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        let first = tmp.path().join("first");
        let mut routed = vec![];
        for (id, route) in [("a", "text_extraction"), ("b", "ocr_extraction"), ("c", "text_extraction")] {
            let mut doc = Document::new(id);
            doc.replace_metadata(crate::document::keys::PROCESSING_ROUTE, json!(route));
            routed.push(doc);
        }
        Stage::new("first", StageSource::Documents(Arc::new(routed)), &first, writer())
            .tasks(2)
            .run(&ctx)
            .await
            .unwrap();

        let second = tmp.path().join("second");
        let source = StageSource::StageOutput {
            dir: first.clone(),
            filter: Some(RouteFilter::Route(crate::router::RouteLabel::TextExtraction)),
        };
        Stage::new("second", source, &second, writer())
            .tasks(3)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(read_ids(&second).await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn cancelled_stage_is_not_finalized() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(Ui::init_for_tests(), tmp.path().join("logs"));
        ctx.cancel();
        let out = tmp.path().join("out");
        let err = Stage::new("shout", docs(&["a"]), &out, writer())
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::Cancelled { .. })
        ));
        assert!(!out.exists());
    }
}
