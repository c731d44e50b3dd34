//! Text extraction with `pdftotext`.

use tokio::{fs, process::Command};

use super::{ExtractionInput, ExtractionOutput, Extractor};
use crate::{
    async_utils::{check_for_command_failure, io::JsonObject},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Extractor wrapping the `pdftotext` CLI tool from `poppler-utils`.
///
/// Like [`super::native::LopdfExtractor`], this will miss any
/// "non-searchable" text in a PDF, but poppler handles more font encodings
/// and gives better reading order.
#[derive(Debug)]
pub struct PdfToTextExtractor;

#[async_trait]
impl Extractor for PdfToTextExtractor {
    fn name(&self) -> &str {
        "pdftotext"
    }

    #[instrument(level = "debug", skip_all, fields(id = %input.id))]
    async fn extract(&self, input: ExtractionInput<'_>) -> Result<ExtractionOutput> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("pdftotext")?;
        let input_path = tmpdir.path().join("input.pdf");
        let output_path = tmpdir.path().join("output.txt");
        fs::write(&input_path, input.content)
            .await
            .context("cannot write pdftotext input file")?;

        // Run pdftotext on the input file. `kill_on_drop` makes sure a timeout
        // doesn't leave the process running.
        let output = with_cpu_semaphore(|| async {
            Command::new("pdftotext")
                .arg("-layout")
                .arg(&input_path)
                .arg(&output_path)
                .kill_on_drop(true)
                .output()
                .await
                .context("cannot run pdftotext")
        })
        .await?;
        // Poppler prints "Syntax Error" for many recoverable problems, so we
        // only trust the exit status here.
        check_for_command_failure("pdftotext", &output, None)?;

        // Read the output file. `pdftotext` separates pages with form feeds.
        let text = fs::read_to_string(&output_path)
            .await
            .context("cannot read pdftotext output file")?;
        let pages = text.trim_end_matches('\u{c}').split('\u{c}').count();
        let mut metadata = JsonObject::new();
        metadata.insert("extracted_pages".to_owned(), json!(pages));
        Ok(ExtractionOutput {
            text: text.replace('\u{c}', "\n\n").trim_end().to_owned(),
            metadata,
        })
    }
}
