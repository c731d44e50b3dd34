//! Turning OCR probabilities into routing decisions.

use std::{fmt, str::FromStr};

use schemars::JsonSchema;

use crate::{
    classifier::{Classification, PdfClassifier},
    document::{Document, keys},
    pipeline::step::{PipelineStep, TaskContext},
    prelude::*,
};

/// Which extraction stage a document belongs to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteLabel {
    /// Pull the embedded text layer out directly.
    TextExtraction,
    /// Render pages and run a vision model.
    OcrExtraction,
}

impl RouteLabel {
    /// The label as written in `processing_route`.
    pub fn as_str(self) -> &'static str {
        match self {
            RouteLabel::TextExtraction => "text_extraction",
            RouteLabel::OcrExtraction => "ocr_extraction",
        }
    }
}

impl fmt::Display for RouteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text_extraction" => Ok(RouteLabel::TextExtraction),
            "ocr_extraction" => Ok(RouteLabel::OcrExtraction),
            _ => Err(anyhow!("unknown processing route: {:?}", s)),
        }
    }
}

/// Check that a threshold is usable.
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(anyhow!("routing threshold must be in [0, 1], got {threshold}"))
    }
}

/// Route a score. A score exactly equal to the threshold goes to OCR.
pub fn route(score: f64, threshold: f64) -> RouteLabel {
    if score >= threshold {
        RouteLabel::OcrExtraction
    } else {
        RouteLabel::TextExtraction
    }
}

/// Record a classification on a document, replacing any earlier one.
pub fn annotate(
    document: &mut Document,
    classification: &Classification,
    threshold: f64,
) -> RouteLabel {
    let label = route(classification.ocr_prob, threshold);
    document.metadata.remove(keys::CLASSIFICATION_ERROR);
    document.replace_metadata(keys::PROCESSING_ROUTE, json!(label.as_str()));
    document.replace_metadata(keys::OCR_PROB, json!(classification.ocr_prob));
    document.replace_metadata(keys::NUM_PAGES, json!(classification.num_pages));
    document.replace_metadata(keys::IS_FORM, json!(classification.is_form));
    label
}

/// Record that a document could not be classified. It gets no route.
pub fn mark_unclassifiable(document: &mut Document, message: &str) {
    for key in [
        keys::PROCESSING_ROUTE,
        keys::OCR_PROB,
        keys::NUM_PAGES,
        keys::IS_FORM,
    ] {
        document.metadata.remove(key);
    }
    document.replace_metadata(
        keys::CLASSIFICATION_ERROR,
        json!({ "reason": "unclassifiable", "message": message }),
    );
}

/// Classifies each document and records its route.
pub struct PdfRouter {
    classifier: PdfClassifier,
    threshold: f64,
    embed_content: bool,
}

impl PdfRouter {
    /// Create a router. If `embed_content` is set, document bytes are loaded
    /// into the document so they can be saved with the stage output.
    pub fn new(classifier: PdfClassifier, threshold: f64, embed_content: bool) -> Result<Self> {
        validate_threshold(threshold)?;
        Ok(Self {
            classifier,
            threshold,
            embed_content,
        })
    }
}

#[async_trait]
impl PipelineStep for PdfRouter {
    fn name(&self) -> &str {
        "router"
    }

    #[instrument(level = "debug", skip_all, fields(id = %document.id))]
    async fn process(&self, mut document: Document, ctx: &TaskContext) -> Result<Document> {
        if self.embed_content {
            if let Err(err) = document.inline_content().await {
                warn!(id = %document.id, "cannot load content: {err:#}");
            }
        }
        let classification = match document.load_content().await {
            Ok(bytes) => self
                .classifier
                .classify(&bytes)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("cannot load content: {err:#}")),
        };
        match classification {
            Ok(classification) => {
                let label = annotate(&mut document, &classification, self.threshold);
                debug!(id = %document.id, ocr_prob = classification.ocr_prob, %label, "routed");
                ctx.stats.incr(&format!("routed.{label}"));
            }
            Err(message) => {
                warn!(id = %document.id, "{message}");
                mark_unclassifiable(&mut document, &message);
                ctx.stats.incr("unclassifiable");
            }
        }
        Ok(document)
    }
}

/// Selects documents from classified output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteFilter {
    /// Documents with this `processing_route`.
    Route(RouteLabel),
    /// Documents with a `classification_error` and no route.
    Unclassifiable,
}

impl RouteFilter {
    /// Does this document belong here?
    pub fn matches(&self, document: &Document) -> bool {
        let route = document.metadata_str(keys::PROCESSING_ROUTE);
        match self {
            RouteFilter::Route(label) => route == Some(label.as_str()),
            RouteFilter::Unclassifiable => {
                route.is_none() && document.metadata.contains_key(keys::CLASSIFICATION_ERROR)
            }
        }
    }
}
