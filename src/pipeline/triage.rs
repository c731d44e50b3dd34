//! The standard PDF triage pipeline.
//!
//! 1. `classification` scores every input PDF and records its route. Records
//!    keep their PDF bytes, so later stages don't need the original files.
//! 2. `text_extraction` reads the embedded text of `text_extraction` PDFs.
//! 3. `ocr_extraction` sends `ocr_extraction` PDFs to a vision model.
//! 4. `unclassifiable` collects PDFs we could not score, for review.
//!
//! Stages 2-4 only depend on stage 1, so any of them can be re-run alone.

use std::sync::Arc;

use super::{
    Pipeline,
    stage::{Stage, StageSource},
};
use crate::{
    artifacts::{SavePagesAsPng, SavePdfsToDisk},
    classifier::{LogisticModel, PdfClassifier},
    config::{PipelineConfig, RouterConfig},
    document::Document,
    extractors::ExtractorStep,
    inference::{
        InferenceComponents, InferenceRunner, post_process::ExtractInferenceText,
        query::VisionQueryBuilder, render::PdfToCairoRenderer,
    },
    prelude::*,
    router::{PdfRouter, RouteFilter, RouteLabel},
    writer::JsonlWriter,
};

/// Stage names.
pub const CLASSIFICATION: &str = "classification";
pub const TEXT_EXTRACTION: &str = "text_extraction";
pub const OCR_EXTRACTION: &str = "ocr_extraction";
pub const UNCLASSIFIABLE: &str = "unclassifiable";

/// Every stage, in run order.
pub const ALL_STAGES: &[&str] = &[CLASSIFICATION, TEXT_EXTRACTION, OCR_EXTRACTION, UNCLASSIFIABLE];

/// Directory holding a stage's output. Classification output is called
/// `classified`, everything else matches its stage name.
pub fn stage_output_dir(config: &PipelineConfig, stage: &str) -> PathBuf {
    match stage {
        CLASSIFICATION => config.output_dir.join("classified"),
        other => config.output_dir.join(other),
    }
}

/// Build a classifier from router settings.
pub async fn build_classifier(config: &RouterConfig) -> Result<PdfClassifier> {
    let model = match &config.model_path {
        Some(path) => LogisticModel::load(path).await?,
        None => LogisticModel::default(),
    };
    Ok(PdfClassifier::new(Arc::new(model), config.max_pages_sampled))
}

/// Build all four stages.
pub async fn build_triage_pipeline(
    config: &PipelineConfig,
    documents: Vec<Document>,
    force: bool,
) -> Result<Pipeline> {
    config.validate()?;
    let classifier = build_classifier(&config.router).await?;
    let results_writer = JsonlWriter::new(config.writer.clone(), false);
    let classified_dir = stage_output_dir(config, CLASSIFICATION);
    let classified = |filter| StageSource::StageOutput {
        dir: classified_dir.clone(),
        filter: Some(filter),
    };
    let common = |stage: Stage| {
        stage
            .tasks(config.tasks)
            .documents_in_flight(config.documents_in_flight)
            .timeout(config.stage_timeout())
            .force(force)
    };

    let classification = common(Stage::new(
        CLASSIFICATION,
        StageSource::Documents(Arc::new(documents)),
        &classified_dir,
        JsonlWriter::new(config.writer.clone(), true),
    ))
    .step(Arc::new(PdfRouter::new(
        classifier,
        config.router.threshold,
        true,
    )?));

    let mut text_extraction = common(Stage::new(
        TEXT_EXTRACTION,
        classified(RouteFilter::Route(RouteLabel::TextExtraction)),
        stage_output_dir(config, TEXT_EXTRACTION),
        results_writer.clone(),
    ))
    .depends_on(CLASSIFICATION);
    if config.artifacts.save_pdfs {
        text_extraction = text_extraction.step(Arc::new(SavePdfsToDisk::new(
            config.output_dir.join("text_extraction_pdfs"),
        )));
    }
    let text_extraction = text_extraction.step(Arc::new(ExtractorStep::new(
        config.text_extraction.backend.create_extractor(),
        config.text_extraction.timeout(),
    )));

    let ocr = &config.ocr_extraction;
    let mut post_process_steps: Vec<Arc<dyn super::PipelineStep>> =
        vec![Arc::new(ExtractInferenceText)];
    if config.artifacts.save_pdfs {
        post_process_steps.push(Arc::new(SavePdfsToDisk::new(
            config.output_dir.join("ocr_extraction_pdfs"),
        )));
    }
    if config.artifacts.save_page_pngs {
        post_process_steps.push(Arc::new(SavePagesAsPng::new(
            config.output_dir.join("ocr_extraction_pages_png"),
        )));
    }
    let (runner, runner_worker) = InferenceRunner::new(
        ocr.clone(),
        InferenceComponents {
            driver: ocr.driver.create_driver()?,
            renderer: Arc::new(PdfToCairoRenderer),
            query_builder: Arc::new(VisionQueryBuilder::new(ocr)?),
            post_process_steps,
        },
    )?;
    let ocr_extraction = common(Stage::new(
        OCR_EXTRACTION,
        classified(RouteFilter::Route(RouteLabel::OcrExtraction)),
        stage_output_dir(config, OCR_EXTRACTION),
        results_writer.clone(),
    ))
    // Keep enough documents in flight to use every inference task permit.
    .documents_in_flight(config.documents_in_flight.max(ocr.max_concurrent_tasks))
    .depends_on(CLASSIFICATION)
    .step(Arc::new(runner))
    .background_worker(runner_worker);

    let unclassifiable = common(Stage::new(
        UNCLASSIFIABLE,
        classified(RouteFilter::Unclassifiable),
        stage_output_dir(config, UNCLASSIFIABLE),
        results_writer,
    ))
    .depends_on(CLASSIFICATION);

    Pipeline::new(vec![
        classification,
        text_extraction,
        ocr_extraction,
        unclassifiable,
    ])
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;
    use crate::{
        document::keys, extractors::TextBackend, inference::drivers::DriverType,
        pipeline::context::RunContext, test_pdfs::{scanned_pdf, text_pdf}, ui::Ui,
        writer::reader::StageOutput,
    };

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig {
            output_dir: root.join("out"),
            logging_dir: root.join("logs"),
            tasks: 2,
            ..PipelineConfig::default()
        };
        config.text_extraction.backend = TextBackend::Lopdf;
        config.ocr_extraction.driver = DriverType::Echo;
        config
    }

    fn input_documents() -> Vec<Document> {
        vec![
            Document::from_pdf_bytes("letter", text_pdf(&["Dear Counsel,", "Sincerely."])),
            Document::from_pdf_bytes("scan", scanned_pdf(2)),
            Document::from_pdf_bytes("notes", b"just some text".to_vec()),
        ]
    }

    async fn read(config: &PipelineConfig, stage: &str) -> Vec<Document> {
        StageOutput::open(&stage_output_dir(config, stage))
            .unwrap()
            .read_all()
            .map(|doc| doc.unwrap())
            .collect()
            .await
    }

    /// Everything except OCR, which needs poppler to render pages.
    #[tokio::test]
    async fn every_document_lands_in_exactly_one_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let ctx = RunContext::new(Ui::init_for_tests(), &config.logging_dir);
        let pipeline = build_triage_pipeline(&config, input_documents(), false)
            .await
            .unwrap()
            .select(&[
                CLASSIFICATION.to_owned(),
                TEXT_EXTRACTION.to_owned(),
                UNCLASSIFIABLE.to_owned(),
            ])
            .unwrap();
        pipeline.run(&ctx).await.ensure_success().unwrap();

        let classified = read(&config, CLASSIFICATION).await;
        assert_eq!(classified.len(), 3);
        for doc in &classified {
            assert!(doc.content_media().unwrap().media_bytes.is_some());
        }
        let route = |id: &str| {
            classified
                .iter()
                .find(|d| d.id == id)
                .unwrap()
                .metadata_str(keys::PROCESSING_ROUTE)
                .map(str::to_owned)
        };
        assert_eq!(route("letter").as_deref(), Some("text_extraction"));
        assert_eq!(route("scan").as_deref(), Some("ocr_extraction"));
        assert_eq!(route("notes"), None);

        let text = read(&config, TEXT_EXTRACTION).await;
        assert_eq!(text.len(), 1);
        assert!(text[0].text.contains("Dear Counsel,"));
        assert!(text[0].media.iter().all(|m| m.media_bytes.is_none()));

        let unclassifiable = read(&config, UNCLASSIFIABLE).await;
        assert_eq!(unclassifiable.len(), 1);
        assert_eq!(unclassifiable[0].id, "notes");
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mut decisions = vec![];
        for _ in 0..2 {
            let ctx = RunContext::new(Ui::init_for_tests(), &config.logging_dir);
            build_triage_pipeline(&config, input_documents(), true)
                .await
                .unwrap()
                .select(&[CLASSIFICATION.to_owned()])
                .unwrap()
                .run(&ctx)
                .await
                .ensure_success()
                .unwrap();
            let mut docs = read(&config, CLASSIFICATION).await;
            docs.sort_by(|a, b| a.id.cmp(&b.id));
            decisions.push(
                docs.iter()
                    .map(|d| {
                        (
                            d.id.clone(),
                            d.metadata.get(keys::PROCESSING_ROUTE).cloned(),
                            d.metadata.get(keys::OCR_PROB).cloned(),
                        )
                    })
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(decisions[0], decisions[1]);
    }

    #[tokio::test]
    async fn rejects_bad_thresholds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.router.threshold = -0.1;
        assert!(
            build_triage_pipeline(&config, input_documents(), false)
                .await
                .is_err()
        );
    }
}
