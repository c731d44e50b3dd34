//! Rendering PDF pages to PNG images for vision models.

use std::io::Cursor;

use image::{ImageFormat, ImageReader, imageops::FilterType};
use tokio::{fs, process::Command};

use crate::{
    async_utils::{POPPLER_ERROR_REGEX, check_for_command_failure},
    cpu_limit::with_cpu_semaphore,
    data_url::data_url,
    pdf::count_pages,
    prelude::*,
};

/// Vision models typically spend one token per 28x28 pixel patch.
const PATCH_SIZE: u32 = 28;

/// A rendered page.
#[derive(Clone, Debug)]
pub struct RenderedPage {
    /// Zero-based page index.
    pub page_index: usize,
    /// PNG data.
    pub png: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl RenderedPage {
    /// Wrap PNG data, reading its dimensions.
    pub fn from_png(page_index: usize, png: Vec<u8>) -> Result<Self> {
        let (width, height) = ImageReader::with_format(Cursor::new(&png), ImageFormat::Png)
            .into_dimensions()
            .context("cannot read rendered page dimensions")?;
        Ok(Self {
            page_index,
            png,
            width,
            height,
        })
    }

    /// Roughly how many prompt tokens this image will cost.
    pub fn visual_tokens(&self) -> usize {
        (self.width.div_ceil(PATCH_SIZE) * self.height.div_ceil(PATCH_SIZE)) as usize
    }

    /// Convert to a data URL.
    pub fn to_data_url(&self) -> String {
        data_url("image/png", &self.png)
    }
}

/// Shrink a page until it fits in `max_visual_tokens`.
pub fn fit_to_token_budget(page: RenderedPage, max_visual_tokens: usize) -> Result<RenderedPage> {
    let tokens = page.visual_tokens();
    if tokens <= max_visual_tokens {
        return Ok(page);
    }
    if max_visual_tokens == 0 {
        return Err(anyhow!("max_visual_tokens must be at least 1"));
    }

    let image = image::load_from_memory_with_format(&page.png, ImageFormat::Png)
        .context("cannot decode rendered page")?;
    let mut scale = (max_visual_tokens as f64 / tokens as f64).sqrt();
    loop {
        let width = ((page.width as f64 * scale).floor() as u32).max(1);
        let height = ((page.height as f64 * scale).floor() as u32).max(1);
        let fits = (width.div_ceil(PATCH_SIZE) * height.div_ceil(PATCH_SIZE)) as usize
            <= max_visual_tokens;
        if fits || (width == 1 && height == 1) {
            let resized = image.resize_exact(width, height, FilterType::Triangle);
            let mut png = Vec::new();
            resized
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .context("cannot encode resized page")?;
            trace!(
                page_index = page.page_index,
                from = ?(page.width, page.height),
                to = ?(width, height),
                "resized page to fit visual token budget"
            );
            return Ok(RenderedPage {
                page_index: page.page_index,
                png,
                width,
                height,
            });
        }
        scale *= 0.95;
    }
}

/// Renders PDF pages.
#[async_trait]
pub trait PageRenderer: Send + Sync + 'static {
    /// Count pages.
    async fn page_count(&self, pdf: &[u8]) -> Result<usize> {
        count_pages(pdf).await
    }

    /// Render one page so that its longest side is `longest_side` pixels.
    async fn render_page(
        &self,
        pdf_path: &Path,
        page_index: usize,
        longest_side: u32,
    ) -> Result<RenderedPage>;
}

/// Renders pages with Poppler's `pdftocairo` CLI tool.
#[derive(Debug, Default)]
pub struct PdfToCairoRenderer;

#[async_trait]
impl PageRenderer for PdfToCairoRenderer {
    #[instrument(level = "debug", skip_all, fields(page = page_index + 1))]
    async fn render_page(
        &self,
        pdf_path: &Path,
        page_index: usize,
        longest_side: u32,
    ) -> Result<RenderedPage> {
        let tmpdir = tempfile::TempDir::with_prefix("page")?;
        let out_base = tmpdir.path().join("page");
        let page_number = (page_index + 1).to_string();

        // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
        // 100% of a CPU, and we don't want to run 200 copies of it at once by
        // mistake.
        let output = with_cpu_semaphore(|| async {
            Command::new("pdftocairo")
                .arg("-png")
                .arg("-singlefile")
                .arg("-f")
                .arg(&page_number)
                .arg("-l")
                .arg(&page_number)
                .arg("-scale-to")
                .arg(longest_side.to_string())
                .arg(pdf_path)
                .arg(&out_base)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("failed to run pdftocairo on {:?}", pdf_path))
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&*POPPLER_ERROR_REGEX))?;

        let png = fs::read(out_base.with_extension("png"))
            .await
            .context("cannot read pdftocairo output")?;
        RenderedPage::from_png(page_index, png)
    }
}
