//! Estimating how likely a PDF is to need OCR.
//!
//! A [`PdfClassifier`] turns raw bytes into [`PdfFeatures`] and asks a
//! [`ScoringModel`] for a probability. Anything we can't turn into a valid
//! probability is reported as an [`UnclassifiableDocumentError`], never as a
//! made-up score.

use std::{error, fmt, sync::Arc};

use crate::{async_utils::isolated::run_isolated, prelude::*};

pub mod features;
pub mod logistic;

pub use self::{features::PdfFeatures, logistic::LogisticModel};

/// Scores features. Must be deterministic.
pub trait ScoringModel: fmt::Debug + Send + Sync + 'static {
    /// Return the probability that a document needs OCR.
    fn predict(&self, features: &PdfFeatures) -> Result<f64>;
}

/// Classifier output for one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// Probability in `[0, 1]` that the document needs OCR.
    pub ocr_prob: f64,
    /// Total page count.
    pub num_pages: usize,
    /// Does the document have form fields?
    pub is_form: bool,
}

/// A document could not be scored.
#[derive(Clone, Debug, PartialEq)]
pub struct UnclassifiableDocumentError {
    /// Why not.
    pub reason: String,
}

impl UnclassifiableDocumentError {
    /// Create a new error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for UnclassifiableDocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unclassifiable document: {}", self.reason)
    }
}

impl error::Error for UnclassifiableDocumentError {}

/// Wraps a [`ScoringModel`] with PDF featurization.
#[derive(Clone, Debug)]
pub struct PdfClassifier {
    model: Arc<dyn ScoringModel>,
    max_pages_sampled: usize,
}

impl PdfClassifier {
    /// Create a classifier.
    pub fn new(model: Arc<dyn ScoringModel>, max_pages_sampled: usize) -> Self {
        Self {
            model,
            max_pages_sampled,
        }
    }

    /// Classify raw document bytes.
    #[instrument(level = "debug", skip_all)]
    pub async fn classify(
        &self,
        bytes: &[u8],
    ) -> Result<Classification, UnclassifiableDocumentError> {
        match infer::get(bytes) {
            Some(kind) if kind.mime_type() == "application/pdf" => {}
            Some(kind) => {
                return Err(UnclassifiableDocumentError::new(format!(
                    "expected a PDF, found {}",
                    kind.mime_type()
                )));
            }
            None => {
                return Err(UnclassifiableDocumentError::new(
                    "content is not a recognizable PDF",
                ));
            }
        }

        let owned = bytes.to_vec();
        let max_pages_sampled = self.max_pages_sampled;
        let features = run_isolated("pdf-features", move || {
            Ok(PdfFeatures::from_pdf_bytes(&owned, max_pages_sampled))
        })
        .await
        .map_err(|err| UnclassifiableDocumentError::new(format!("{err:#}")))??;
        trace!(?features, "PDF features");

        let ocr_prob = self
            .model
            .predict(&features)
            .map_err(|err| UnclassifiableDocumentError::new(format!("{err:#}")))?;
        if !(0.0..=1.0).contains(&ocr_prob) {
            return Err(UnclassifiableDocumentError::new(format!(
                "model returned {ocr_prob}, which is not a probability"
            )));
        }
        Ok(Classification {
            ocr_prob,
            num_pages: features.num_pages,
            is_form: features.is_form,
        })
    }
}
