use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod artifacts;
mod async_utils;
mod classifier;
mod cmd;
mod config;
mod cpu_limit;
mod data_url;
mod document;
mod extractors;
mod inference;
mod input;
mod pdf;
mod pipeline;
mod prelude;
mod rate_limit;
mod retry;
mod router;
#[cfg(test)]
mod test_pdfs;
mod ui;
mod writer;

/// Sort PDFs by how hard they are to read, then extract their text.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): URL of an OpenAI-compatible server used for
    OCR (vLLM, LMDeploy, Ollama, LiteLLM).
  - OPENAI_API_KEY: The key for that server.
  - RUST_LOG (optional): Log filter, like "info" or "pdf_triage=debug".

  These variables may be set in a standard `.env` file.

External tools:
  - pdftocairo (poppler) renders pages for OCR.
  - pdftotext (poppler) is used with `--text-backend pdftotext`.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Classify PDFs, then extract text along the right path for each.
    Run(cmd::run::RunOpts),
    /// Only classify and route PDFs.
    Classify(cmd::classify::ClassifyOpts),
    /// Check that a stage output directory is complete.
    Validate(cmd::validate::ValidateOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) | Cmd::Classify(_) => false,
            Cmd::Validate(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Run(opts) => cmd::run::cmd_run(ui, opts).await,
        Cmd::Classify(opts) => cmd::classify::cmd_classify(ui, opts).await,
        Cmd::Validate(opts) => cmd::validate::cmd_validate(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
