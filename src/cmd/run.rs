//! The `run` subcommand.

use clap::Args;

use super::{ExtractionOpts, PipelineOpts, run_triage};
use crate::{pipeline::triage::ALL_STAGES, prelude::*, ui::Ui};

/// Run options.
#[derive(Debug, Args)]
pub struct RunOpts {
    #[clap(flatten)]
    pub pipeline: PipelineOpts,

    #[clap(flatten)]
    pub extraction: ExtractionOpts,

    /// Only run these stages (comma-separated). Other stages' finalized
    /// output is reused.
    #[clap(long, value_delimiter = ',', value_parser = clap::builder::PossibleValuesParser::new(ALL_STAGES.iter().copied()))]
    pub stages: Vec<String>,
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let mut config = opts.pipeline.load_config().await?;
    opts.extraction.apply(&mut config);
    let stages = if opts.stages.is_empty() {
        ALL_STAGES.iter().map(|s| (*s).to_owned()).collect()
    } else {
        opts.stages.clone()
    };
    run_triage(ui, &opts.pipeline, config, &stages).await
}
