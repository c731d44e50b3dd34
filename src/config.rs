//! Pipeline configuration, loaded from TOML or JSON. Every field has a
//! default, so an empty file (or no file at all) is a valid configuration.

use std::time::Duration;

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml,
    extractors::TextBackend,
    inference::InferenceConfig,
    prelude::*,
    router::validate_threshold,
    writer::WriterConfig,
};

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Stage outputs go in subdirectories of this directory.
    pub output_dir: PathBuf,

    /// Per-stage `stats.json` files go in subdirectories of this directory.
    pub logging_dir: PathBuf,

    /// Parallel tasks per stage.
    pub tasks: usize,

    /// Documents each task may have in progress at once.
    pub documents_in_flight: usize,

    /// Give up on a stage after this many seconds.
    pub stage_timeout_secs: Option<u64>,

    /// Classification and routing.
    pub router: RouterConfig,

    /// Stage output format.
    pub writer: WriterConfig,

    /// The native text path.
    pub text_extraction: TextExtractionConfig,

    /// The OCR path.
    pub ocr_extraction: InferenceConfig,

    /// Debugging artifacts.
    pub artifacts: ArtifactsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            logging_dir: PathBuf::from("logs"),
            tasks: 1,
            documents_in_flight: 1,
            stage_timeout_secs: None,
            router: RouterConfig::default(),
            writer: WriterConfig::default(),
            text_extraction: TextExtractionConfig::default(),
            ocr_extraction: InferenceConfig::default(),
            artifacts: ArtifactsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file, or use defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => read_json_or_toml(path)
                .await
                .with_context(|| format!("cannot load config from {}", path.display())),
            None => Ok(Self::default()),
        }
    }

    /// Check for settings which can never work.
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.router.threshold)?;
        if self.tasks == 0 {
            return Err(anyhow!("tasks must be at least 1"));
        }
        if self.documents_in_flight == 0 {
            return Err(anyhow!("documents_in_flight must be at least 1"));
        }
        if self.router.max_pages_sampled == 0 {
            return Err(anyhow!("router.max_pages_sampled must be at least 1"));
        }
        self.ocr_extraction
            .validate()
            .context("invalid ocr_extraction settings")
    }

    /// Stage timeout, if any.
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// Classification and routing settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Documents with `ocr_prob >= threshold` go to OCR.
    pub threshold: f64,

    /// Logistic model file. Uses built-in weights if absent.
    pub model_path: Option<PathBuf>,

    /// Featurize at most this many pages per document.
    pub max_pages_sampled: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            model_path: None,
            max_pages_sampled: 8,
        }
    }
}

/// Native text extraction settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextExtractionConfig {
    /// Which backend to use.
    pub backend: TextBackend,

    /// Per-document timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for TextExtractionConfig {
    fn default() -> Self {
        Self {
            backend: TextBackend::default(),
            timeout_secs: 1200,
        }
    }
}

impl TextExtractionConfig {
    /// Per-document timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Optional debugging artifacts.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactsConfig {
    /// Save each extracted PDF under `<output_dir>/<stage>_pdfs`.
    pub save_pdfs: bool,

    /// Save page images sent to the model under
    /// `<output_dir>/ocr_extraction_pages_png`.
    pub save_page_pngs: bool,
}
