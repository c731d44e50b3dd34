//! Command-line entry points.

use clap::Args;

use crate::{
    config::PipelineConfig,
    extractors::TextBackend,
    inference::drivers::DriverType,
    input::load_input_documents,
    pipeline::{PipelineReport, context::RunContext, stage::StageState, triage},
    prelude::*,
    rate_limit::RateLimit,
    ui::Ui,
};

pub mod classify;
pub mod run;
pub mod schema;
pub mod validate;

/// Options shared by commands which run pipeline stages. Anything set here
/// overrides the config file.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// A directory of PDFs, a single PDF, or a JSONL/CSV manifest with `path`
    /// (and optionally `id`) fields.
    pub input: PathBuf,

    /// TOML or JSON pipeline config.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory for stage outputs.
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for per-stage stats.
    #[clap(long)]
    pub logging_dir: Option<PathBuf>,

    /// Documents with an OCR probability at or above this go to OCR.
    #[clap(long)]
    pub threshold: Option<f64>,

    /// Logistic model file (JSON or TOML).
    #[clap(long)]
    pub model_path: Option<PathBuf>,

    /// Parallel tasks per stage.
    #[clap(long, short = 'j')]
    pub tasks: Option<usize>,

    /// Re-run stages even if their output is already finalized.
    #[clap(long)]
    pub force: bool,
}

impl PipelineOpts {
    /// Load the config file and apply our overrides.
    pub async fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref()).await?;
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = output_dir.clone();
        }
        if let Some(logging_dir) = &self.logging_dir {
            config.logging_dir = logging_dir.clone();
        }
        if let Some(threshold) = self.threshold {
            config.router.threshold = threshold;
        }
        if let Some(model_path) = &self.model_path {
            config.router.model_path = Some(model_path.clone());
        }
        if let Some(tasks) = self.tasks {
            config.tasks = tasks;
        }
        Ok(config)
    }
}

/// Overrides for the extraction stages.
#[derive(Debug, Clone, Args)]
pub struct ExtractionOpts {
    /// Native text backend.
    #[clap(long, value_enum)]
    pub text_backend: Option<TextBackend>,

    /// Inference driver for OCR.
    #[clap(long, value_enum)]
    pub driver: Option<DriverType>,

    /// OCR model name, as known to the server.
    #[clap(long)]
    pub model: Option<String>,

    /// Maximum inference requests in flight.
    #[clap(long)]
    pub max_concurrent_requests: Option<usize>,

    /// Rate limit for inference requests, like "10/s" or "600/m".
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Only OCR the first N pages of each document.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// Save extracted PDFs next to stage output.
    #[clap(long)]
    pub save_pdfs: bool,

    /// Save page images sent to the OCR model.
    #[clap(long)]
    pub save_page_pngs: bool,
}

impl ExtractionOpts {
    /// Apply our overrides.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(backend) = self.text_backend {
            config.text_extraction.backend = backend;
        }
        let ocr = &mut config.ocr_extraction;
        if let Some(driver) = self.driver {
            ocr.driver = driver;
        }
        if let Some(model) = &self.model {
            ocr.model = model.clone();
        }
        if let Some(n) = self.max_concurrent_requests {
            ocr.max_concurrent_requests = n;
        }
        if let Some(rate_limit) = &self.rate_limit {
            ocr.rate_limit = Some(rate_limit.clone());
        }
        if let Some(max_pages) = self.max_pages {
            ocr.max_pages = Some(max_pages);
        }
        config.artifacts.save_pdfs |= self.save_pdfs;
        config.artifacts.save_page_pngs |= self.save_page_pngs;
    }
}

/// Build the triage pipeline, run the selected stages, and report on them.
pub async fn run_triage(
    ui: Ui,
    opts: &PipelineOpts,
    config: PipelineConfig,
    stages: &[String],
) -> Result<()> {
    let documents = load_input_documents(&opts.input).await?;
    let pipeline = triage::build_triage_pipeline(&config, documents, opts.force)
        .await?
        .select(stages)?;

    let ctx = RunContext::new(ui.clone(), &config.logging_dir);
    info!(run_id = %ctx.run_id, "starting run");

    // Stop cleanly on Ctrl-C. Running stages close their shards and are not
    // finalized.
    let interrupt = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping after in-flight documents");
                ctx.cancel();
            }
        })
    };
    let report = pipeline.run(&ctx).await;
    interrupt.abort();

    display_report(&ui, &report);
    report.ensure_success()
}

fn display_report(ui: &Ui, report: &PipelineReport) {
    for stage in &report.stages {
        let emoji = match stage.state {
            StageState::Completed => "✅",
            _ => "❌",
        };
        match &stage.error {
            Some(error) => ui.display_message(emoji, &format!("{}: {}", stage.name, error)),
            None => ui.display_message(emoji, &format!("{}: {}", stage.name, stage.state)),
        }
    }
}
