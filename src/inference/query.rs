//! Building chat requests for individual pages.

use handlebars::Handlebars;

use super::{InferenceConfig, render::RenderedPage};
use crate::{async_utils::io::JsonObject, prelude::*};

/// A rough characters-per-token ratio for prompt text.
const CHARS_PER_TOKEN: usize = 4;

/// Per-message overhead for chat templates, in tokens.
const CHAT_TEMPLATE_OVERHEAD: usize = 32;

/// One page to ask about.
#[derive(Clone, Copy, Debug)]
pub struct PageQuery<'a> {
    /// Document ID.
    pub id: &'a str,
    /// Document metadata.
    pub metadata: &'a JsonObject,
    /// The rendered page.
    pub page: &'a RenderedPage,
    /// Pages in the document.
    pub page_count: usize,
}

/// A request ready to send.
#[derive(Clone, Debug)]
pub struct BuiltQuery {
    /// Provider-specific request body, minus `model`.
    pub payload: Value,
    /// Estimated prompt size in tokens, including the image.
    pub estimated_prompt_tokens: usize,
}

/// Turns a page into a chat request.
pub trait QueryBuilder: Send + Sync + 'static {
    /// Build the request for one page.
    fn build_query(&self, query: &PageQuery<'_>) -> Result<BuiltQuery>;
}

/// Sends a page image plus a templated text prompt, in OpenAI's
/// `image_url` format.
///
/// The prompt is a Handlebars template with `id`, `page_number` (1-based),
/// `page_count` and `metadata` in scope.
pub struct VisionQueryBuilder {
    handlebars: Handlebars<'static>,
    max_completion_tokens: Option<u32>,
    temperature: Option<f32>,
    request_extra: JsonObject,
}

impl VisionQueryBuilder {
    /// Template name used for the prompt.
    const PROMPT: &'static str = "prompt";

    /// Create a query builder from our inference config.
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars
            .register_template_string(Self::PROMPT, &config.prompt)
            .context("invalid prompt template")?;
        Ok(Self {
            handlebars,
            max_completion_tokens: config.max_completion_tokens,
            temperature: config.temperature,
            request_extra: config.request_extra.clone(),
        })
    }
}

impl QueryBuilder for VisionQueryBuilder {
    fn build_query(&self, query: &PageQuery<'_>) -> Result<BuiltQuery> {
        let bindings = json!({
            "id": query.id,
            "page_number": query.page.page_index + 1,
            "page_count": query.page_count,
            "metadata": query.metadata,
        });
        let prompt = self
            .handlebars
            .render(Self::PROMPT, &bindings)
            .context("cannot render prompt")?;
        let estimated_prompt_tokens = query.page.visual_tokens()
            + prompt.len().div_ceil(CHARS_PER_TOKEN)
            + CHAT_TEMPLATE_OVERHEAD;

        let mut payload = self.request_extra.clone();
        payload.insert(
            "messages".to_owned(),
            json!([{
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": { "url": query.page.to_data_url() },
                    },
                    { "type": "text", "text": prompt },
                ],
            }]),
        );
        if let Some(max_tokens) = self.max_completion_tokens {
            payload.insert("max_tokens".to_owned(), json!(max_tokens));
        }
        if let Some(temperature) = self.temperature {
            payload.insert("temperature".to_owned(), json!(temperature));
        }
        Ok(BuiltQuery {
            payload: Value::Object(payload),
            estimated_prompt_tokens,
        })
    }
}
