//! Optional debugging artifacts: the PDFs we processed and the page images we
//! sent to the model.

use tokio::fs;

use crate::{
    document::Document,
    pipeline::step::{PipelineStep, TaskContext},
    prelude::*,
};

/// Turn a document ID into something safe to use as a file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

/// Write each document's PDF to `<dir>/<id>.pdf`.
#[derive(Debug)]
pub struct SavePdfsToDisk {
    dir: PathBuf,
}

impl SavePdfsToDisk {
    /// Save PDFs to `dir`, which is created as needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PipelineStep for SavePdfsToDisk {
    fn name(&self) -> &str {
        "save_pdfs"
    }

    async fn process(&self, document: Document, ctx: &TaskContext) -> Result<Document> {
        // Documents without content already carry a failure marker.
        let content = match document.load_content().await {
            Ok(content) => content.into_owned(),
            Err(_) => return Ok(document),
        };
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.pdf", file_stem(&document.id)));
        fs::write(&path, &content)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        ctx.stats.incr("artifacts.pdfs_saved");
        Ok(document)
    }
}

/// Write the page images sent for inference to `<dir>/<id>_pageNNN.png`.
#[derive(Debug)]
pub struct SavePagesAsPng {
    dir: PathBuf,
}

impl SavePagesAsPng {
    /// Save page images to `dir`, which is created as needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PipelineStep for SavePagesAsPng {
    fn name(&self) -> &str {
        "save_page_pngs"
    }

    async fn process(&self, document: Document, ctx: &TaskContext) -> Result<Document> {
        let Some(inference) = &document.inference else {
            return Ok(document);
        };
        let stem = file_stem(&document.id);
        for page in &inference.pages {
            let Some(image) = &page.image else {
                continue;
            };
            fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("cannot create {}", self.dir.display()))?;
            let path = self
                .dir
                .join(format!("{}_page{:03}.png", stem, page.page_index + 1));
            fs::write(&path, &image.png)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
            ctx.stats.incr("artifacts.pages_saved");
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        inference::{InferenceOutput, PageInference, render::tests::blank_page},
        test_pdfs::text_pdf,
    };

    #[tokio::test]
    async fn saves_pdfs_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let step = SavePdfsToDisk::new(dir.path().join("pdfs"));
        let ctx = TaskContext::standalone("text_extraction");
        let pdf = text_pdf(&["hello"]);
        let doc = Document::from_pdf_bytes("a/b", pdf.clone());
        step.process(doc, &ctx).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("pdfs/a_b.pdf")).unwrap(), pdf);
        assert_eq!(ctx.stats.get("artifacts.pdfs_saved"), 1);
    }

    #[tokio::test]
    async fn skips_documents_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let step = SavePdfsToDisk::new(dir.path().join("pdfs"));
        let ctx = TaskContext::standalone("text_extraction");
        step.process(Document::new("empty"), &ctx).await.unwrap();
        assert!(!dir.path().join("pdfs").exists());
    }

    #[tokio::test]
    async fn saves_rendered_pages() {
        let dir = tempfile::tempdir().unwrap();
        let step = SavePagesAsPng::new(dir.path());
        let ctx = TaskContext::standalone("ocr_extraction");
        let mut doc = Document::new("scan");
        let page = |page_index| PageInference {
            page_index,
            image: Some(Arc::new(blank_page(page_index, 28, 28))),
            response: None,
            token_usage: None,
            errors: vec![],
            sent: true,
        };
        doc.inference = Some(InferenceOutput {
            model: "m".to_owned(),
            page_count: 2,
            pages: vec![page(0), page(1)],
        });
        step.process(doc, &ctx).await.unwrap();
        assert!(dir.path().join("scan_page001.png").exists());
        assert!(dir.path().join("scan_page002.png").exists());
        assert_eq!(ctx.stats.get("artifacts.pages_saved"), 2);
    }
}
