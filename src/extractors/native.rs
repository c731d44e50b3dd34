//! In-process text extraction with `lopdf`.

use super::{ExtractionInput, ExtractionOutput, Extractor};
use crate::{
    async_utils::{io::JsonObject, isolated::run_isolated},
    pdf::load_pdf,
    prelude::*,
};

/// Reads the embedded text layer of each page.
///
/// This is fast and deterministic, but only sees text that the PDF actually
/// contains. Scans come out empty, which is why the router sends them
/// elsewhere.
#[derive(Debug)]
pub struct LopdfExtractor;

#[async_trait]
impl Extractor for LopdfExtractor {
    fn name(&self) -> &str {
        "lopdf"
    }

    #[instrument(level = "debug", skip_all, fields(id = %input.id))]
    async fn extract(&self, input: ExtractionInput<'_>) -> Result<ExtractionOutput> {
        let content = input.content.to_vec();
        run_isolated("pdf-text", move || extract_pages(&content)).await
    }
}

/// Extract text page by page, joining pages with blank lines.
fn extract_pages(content: &[u8]) -> Result<ExtractionOutput> {
    let pdf = load_pdf(content)?;
    let pages = pdf.get_pages();
    if pages.is_empty() {
        return Err(anyhow!("PDF has no pages"));
    }

    let mut texts = Vec::with_capacity(pages.len());
    let mut failed_pages = vec![];
    for &page_number in pages.keys() {
        match pdf.extract_text(&[page_number]) {
            Ok(text) => texts.push(text.trim_end().to_owned()),
            Err(err) => {
                debug!(page_number, "cannot extract page text: {err}");
                failed_pages.push(page_number);
                texts.push(String::new());
            }
        }
    }
    if failed_pages.len() == pages.len() {
        return Err(anyhow!("could not extract text from any page"));
    }

    let mut metadata = JsonObject::new();
    metadata.insert("extracted_pages".to_owned(), json!(pages.len()));
    if !failed_pages.is_empty() {
        metadata.insert("failed_pages".to_owned(), json!(failed_pages));
    }
    Ok(ExtractionOutput {
        text: texts.join("\n\n"),
        metadata,
    })
}
