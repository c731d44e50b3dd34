//! Steps run on each document after inference.

use super::drivers::{finish_reason, response_text};
use crate::{
    document::Document,
    pipeline::step::{PipelineStep, TaskContext},
    prelude::*,
};

/// Build document text from page responses, in page order.
///
/// Pages with no response get a placeholder, so the page count of the text
/// still lines up with the PDF. Responses cut off at the completion limit
/// keep their partial text and are listed in `length_limited_pages`.
#[derive(Debug, Default)]
pub struct ExtractInferenceText;

impl ExtractInferenceText {
    /// Separator between pages.
    const PAGE_SEPARATOR: &'static str = "\n\n";

    fn placeholder(page_index: usize) -> String {
        format!("[page {} could not be recognized]", page_index + 1)
    }
}

#[async_trait]
impl PipelineStep for ExtractInferenceText {
    fn name(&self) -> &str {
        "extract_inference_text"
    }

    async fn process(&self, mut document: Document, ctx: &TaskContext) -> Result<Document> {
        let Some(inference) = &document.inference else {
            document.text.clear();
            return Ok(document);
        };

        let mut length_limited = vec![];
        let texts = inference
            .pages
            .iter()
            .map(|page| match &page.response {
                Some(response) => {
                    if finish_reason(response) == Some("length") {
                        length_limited.push(page.page_index + 1);
                    }
                    response_text(response).unwrap_or_default().trim().to_owned()
                }
                None => Self::placeholder(page.page_index),
            })
            .collect::<Vec<_>>();
        let usage = inference.token_usage();

        document.text = texts.join(Self::PAGE_SEPARATOR);
        if !usage.is_zero() {
            document.replace_metadata("token_usage", serde_json::to_value(&usage)?);
        }
        if !length_limited.is_empty() {
            ctx.stats
                .add("inference.length_limited_pages", length_limited.len() as u64);
            document.replace_metadata("length_limited_pages", json!(length_limited));
        }
        Ok(document)
    }
}
