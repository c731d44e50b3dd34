//! The `validate` subcommand.

use clap::Args;

use crate::{prelude::*, writer::validate::check_stage_output};

/// Validate options.
#[derive(Debug, Args)]
pub struct ValidateOpts {
    /// Stage output directory to check.
    pub dir: PathBuf,

    /// Decompress every shard and count its records.
    #[clap(long)]
    pub deep: bool,
}

/// The `validate` subcommand. Prints the status as JSON, and fails unless the
/// output is valid.
#[instrument(level = "debug", skip_all, fields(dir = %opts.dir.display()))]
pub async fn cmd_validate(opts: &ValidateOpts) -> Result<()> {
    let dir = opts.dir.clone();
    let deep = opts.deep;
    let status = tokio::task::spawn_blocking(move || check_stage_output(&dir, deep))
        .await
        .context("validation task panicked")??;
    println!("{}", serde_json::to_string(&status)?);
    if status.is_valid() {
        Ok(())
    } else {
        Err(anyhow!("{} is not valid stage output", opts.dir.display()))
    }
}
