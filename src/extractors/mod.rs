//! Text extraction backends.
//!
//! Every backend implements [`Extractor`]. [`ExtractorStep`] runs one inside a
//! stage with a timeout, and turns timeouts and backend errors into failure
//! markers on the document, so one bad PDF never stops a batch.

use std::{sync::Arc, time::Duration};

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    async_utils::io::JsonObject,
    document::{Document, keys},
    pipeline::step::{PipelineStep, TaskContext},
    prelude::*,
};

pub mod native;
pub mod pdftotext;

/// Input to an [`Extractor`].
#[derive(Clone, Copy, Debug)]
pub struct ExtractionInput<'a> {
    /// Document ID, for logging and artifacts.
    pub id: &'a str,
    /// Raw document bytes.
    pub content: &'a [u8],
    /// Document metadata so far.
    pub metadata: &'a JsonObject,
}

/// Output of an [`Extractor`].
#[derive(Clone, Debug, Default)]
pub struct ExtractionOutput {
    /// Extracted text.
    pub text: String,
    /// Metadata to merge into the document.
    pub metadata: JsonObject,
}

/// A text extraction backend.
#[async_trait]
pub trait Extractor: Send + Sync + 'static {
    /// Name recorded in the `extractor` metadata key.
    fn name(&self) -> &str;

    /// Extract text. Errors are recorded on the document by the caller.
    async fn extract(&self, input: ExtractionInput<'_>) -> Result<ExtractionOutput>;
}

/// Which native text backend to use.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum TextBackend {
    /// In-process extraction with `lopdf`.
    #[default]
    Lopdf,
    /// Poppler's `pdftotext` CLI.
    Pdftotext,
}

impl TextBackend {
    /// Create the backend.
    pub fn create_extractor(self) -> Arc<dyn Extractor> {
        match self {
            TextBackend::Lopdf => Arc::new(native::LopdfExtractor),
            TextBackend::Pdftotext => Arc::new(pdftotext::PdfToTextExtractor),
        }
    }
}

/// Why extraction failed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend did not finish in time.
    Timeout,
    /// The backend returned an error.
    BackendFailure,
    /// The document's content could not be loaded.
    MissingContent,
    /// Some or all pages could not be recognized.
    InferenceFailed,
}

/// Record an extraction failure on a document.
pub fn mark_extraction_failed(
    document: &mut Document,
    reason: FailureReason,
    message: impl Into<String>,
) {
    let mut marker = json!({
        "reason": reason,
        "message": message.into(),
    });
    // Keep any page-level details already recorded.
    if let Some(Value::Object(existing)) = document.metadata.get(keys::EXTRACTION_ERROR) {
        if let Some(marker) = marker.as_object_mut() {
            for (key, value) in existing {
                marker.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    document.replace_metadata(keys::EXTRACTION_ERROR, marker);
}

/// Runs an [`Extractor`] on each document.
pub struct ExtractorStep {
    extractor: Arc<dyn Extractor>,
    timeout: Duration,
}

impl ExtractorStep {
    /// Create a step which gives each document up to `timeout`.
    pub fn new(extractor: Arc<dyn Extractor>, timeout: Duration) -> Self {
        Self { extractor, timeout }
    }
}

#[async_trait]
impl PipelineStep for ExtractorStep {
    fn name(&self) -> &str {
        self.extractor.name()
    }

    #[instrument(level = "debug", skip_all, fields(id = %document.id, extractor = %self.extractor.name()))]
    async fn process(&self, mut document: Document, ctx: &TaskContext) -> Result<Document> {
        document.replace_metadata(keys::EXTRACTOR, json!(self.extractor.name()));

        let content = match document.load_content().await {
            Ok(content) => content.into_owned(),
            Err(err) => {
                warn!(id = %document.id, "cannot load content: {err:#}");
                mark_extraction_failed(
                    &mut document,
                    FailureReason::MissingContent,
                    format!("{err:#}"),
                );
                ctx.stats.incr("extraction.missing_content");
                return Ok(document);
            }
        };

        let input = ExtractionInput {
            id: &document.id,
            content: &content,
            metadata: &document.metadata,
        };
        let result = tokio::time::timeout(self.timeout, self.extractor.extract(input)).await;
        match result {
            Ok(Ok(output)) => {
                document.text = output.text;
                document.merge_metadata(output.metadata);
                ctx.stats.incr("extraction.ok");
            }
            Ok(Err(err)) => {
                warn!(id = %document.id, "extraction failed: {err:#}");
                document.text = String::new();
                mark_extraction_failed(
                    &mut document,
                    FailureReason::BackendFailure,
                    format!("{err:#}"),
                );
                ctx.stats.incr("extraction.backend_failure");
            }
            Err(_elapsed) => {
                warn!(id = %document.id, timeout = ?self.timeout, "extraction timed out");
                document.text = String::new();
                mark_extraction_failed(
                    &mut document,
                    FailureReason::Timeout,
                    format!("no result after {:?}", self.timeout),
                );
                ctx.stats.incr("extraction.timeout");
            }
        }
        Ok(document)
    }
}
