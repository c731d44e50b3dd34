//! The `classify` subcommand, which only runs the classification stage.

use clap::Args;

use super::{PipelineOpts, run_triage};
use crate::{pipeline::triage::CLASSIFICATION, prelude::*, ui::Ui};

/// Classify options.
#[derive(Debug, Args)]
pub struct ClassifyOpts {
    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `classify` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_classify(ui: Ui, opts: &ClassifyOpts) -> Result<()> {
    let config = opts.pipeline.load_config().await?;
    run_triage(ui, &opts.pipeline, config, &[CLASSIFICATION.to_owned()]).await
}
