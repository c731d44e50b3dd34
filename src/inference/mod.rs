//! Page-level inference against a vision model server.
//!
//! [`InferenceRunner`] is a pipeline step. For each document it renders
//! pages, builds one request per page, and sends them through a bounded
//! [`queue::WorkQueue`], so `max_concurrent_requests` holds across every
//! document and every retry. Responses are matched back to their page, kept in
//! page order, and handed to the runner's post-processing steps.

use std::{
    iter,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt as _, StreamExt as _, TryStreamExt as _, stream};
use keen_retry::{ExponentialJitter, ResolvedResult};
use leaky_bucket::RateLimiter;
use schemars::JsonSchema;
use tokio::sync::Semaphore;

use self::{
    drivers::{ChatCompletionResponse, Driver, DriverType, LlmRetryResult, TokenUsage},
    query::{PageQuery, QueryBuilder},
    queue::WorkQueue,
    render::{PageRenderer, RenderedPage, fit_to_token_budget},
};
use crate::{
    async_utils::{JoinWorker, io::JsonObject},
    document::{Document, keys},
    extractors::{FailureReason, mark_extraction_failed},
    pipeline::step::{PipelineStep, TaskContext},
    prelude::*,
    rate_limit::RateLimit,
};

pub mod drivers;
pub mod post_process;
pub mod query;
pub mod queue;
pub mod render;

/// The default prompt, suitable for RolmOCR and olmOCR-style models.
pub const DEFAULT_PROMPT: &str = "Return the plain text representation of this document page as if you were reading it naturally.";

/// Inference settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    /// Which driver to use.
    pub driver: DriverType,

    /// Model name, as known to the server.
    pub model: String,

    /// Context window of the model, in tokens. Requests which would not fit
    /// are never sent.
    pub model_max_context: usize,

    /// Maximum requests in flight at once, including retries.
    pub max_concurrent_requests: usize,

    /// Maximum documents being inferred at once.
    pub max_concurrent_tasks: usize,

    /// Optional rate limit, like "10/s" or "600/m".
    #[schemars(with = "Option<String>")]
    pub rate_limit: Option<RateLimit>,

    /// Timeout for one request, in seconds.
    pub request_timeout_secs: Option<u64>,

    /// Timeout for a whole document, in seconds.
    pub document_timeout_secs: Option<u64>,

    /// Retries after the first attempt, for transient failures. Zero means
    /// each request is tried once.
    pub max_retries: u8,

    /// This many documents failing in a row means the server is unreachable,
    /// which fails the stage.
    pub max_consecutive_failures: usize,

    /// Only send the first N pages of each document.
    pub max_pages: Option<usize>,

    /// Render pages so their longest side is this many pixels.
    pub resize_longest_side_pixels: u32,

    /// Shrink rendered pages until they cost at most this many tokens.
    pub max_visual_tokens: usize,

    /// Completion token budget per page.
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Handlebars prompt template. See [`query::VisionQueryBuilder`].
    pub prompt: String,

    /// Extra fields merged into every request body.
    pub request_extra: JsonObject,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            driver: DriverType::default(),
            model: "Reducto/RolmOCR".to_owned(),
            model_max_context: 8096,
            max_concurrent_requests: 1,
            max_concurrent_tasks: 1,
            rate_limit: None,
            request_timeout_secs: Some(600),
            document_timeout_secs: None,
            max_retries: 5,
            max_consecutive_failures: 20,
            max_pages: None,
            resize_longest_side_pixels: 1280,
            max_visual_tokens: 2048,
            max_completion_tokens: Some(4096),
            temperature: Some(0.0),
            prompt: DEFAULT_PROMPT.to_owned(),
            request_extra: JsonObject::new(),
        }
    }
}

impl InferenceConfig {
    /// Check settings which would otherwise fail later.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(anyhow!("max_concurrent_requests must be at least 1"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow!("max_concurrent_tasks must be at least 1"));
        }
        if self.max_visual_tokens == 0 || self.resize_longest_side_pixels == 0 {
            return Err(anyhow!("page images must have a non-zero size"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be at least 1"));
        }
        let reserved = self.max_completion_tokens.unwrap_or(0) as usize;
        if reserved >= self.model_max_context {
            return Err(anyhow!(
                "max_completion_tokens ({}) leaves no room for a prompt in a {}-token context",
                reserved,
                self.model_max_context
            ));
        }
        Ok(())
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    fn document_timeout(&self) -> Option<Duration> {
        self.document_timeout_secs.map(Duration::from_secs)
    }
}

/// Inference results for one document, in page order. Held on
/// [`Document::inference`] until post-processing is done.
#[derive(Clone, Debug)]
pub struct InferenceOutput {
    /// Model name.
    pub model: String,
    /// Pages in the document.
    pub page_count: usize,
    /// One entry per page sent, in order.
    pub pages: Vec<PageInference>,
}

impl InferenceOutput {
    /// Zero-based indices of pages with no response.
    pub fn failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|page| page.response.is_none())
            .map(|page| page.page_index)
            .collect()
    }

    /// Errors for each page that had any, with 1-based page numbers. Pages
    /// that recovered after a retry are included.
    pub fn page_errors(&self) -> Vec<Value> {
        self.pages
            .iter()
            .filter(|page| !page.errors.is_empty())
            .map(|page| json!({ "page": page.page_index + 1, "errors": page.errors }))
            .collect()
    }

    /// Total token usage.
    pub fn token_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for usage in self.pages.iter().filter_map(|p| p.token_usage.clone()) {
            total += usage;
        }
        total
    }
}

/// The result for one page.
#[derive(Clone, Debug)]
pub struct PageInference {
    /// Zero-based page index.
    pub page_index: usize,
    /// The image we sent, if rendering worked.
    pub image: Option<Arc<RenderedPage>>,
    /// Raw response, if the request succeeded.
    pub response: Option<Value>,
    /// Token usage.
    pub token_usage: Option<TokenUsage>,
    /// Errors, including transient errors we recovered from.
    pub errors: Vec<String>,
    /// Did we actually send anything to the server?
    pub sent: bool,
}

impl PageInference {
    fn failed(page_index: usize, image: Option<Arc<RenderedPage>>, error: String) -> Self {
        Self {
            page_index,
            image,
            response: None,
            token_usage: None,
            errors: vec![error],
            sent: false,
        }
    }
}

/// One page request on the work queue.
struct PageRequest {
    id: String,
    page_index: usize,
    payload: Value,
}

/// What came back for a [`PageRequest`].
struct PageResponse {
    response: Option<ChatCompletionResponse>,
    errors: Vec<String>,
}

impl PageResponse {
    /// Flatten a [`ResolvedResult`].
    fn from_resolved_result(
        result: ResolvedResult<(), (), ChatCompletionResponse, anyhow::Error>,
    ) -> Self {
        let full_err = |err: anyhow::Error| format!("{:?}", err);
        match result {
            ResolvedResult::Ok { output, .. } => Self {
                response: Some(output),
                errors: vec![],
            },
            ResolvedResult::Fatal { error, .. } => Self {
                response: None,
                errors: vec![full_err(error)],
            },
            ResolvedResult::Recovered {
                output,
                retry_errors,
                ..
            } => Self {
                response: Some(output),
                errors: retry_errors.into_iter().map(full_err).collect(),
            },
            ResolvedResult::GivenUp {
                retry_errors,
                fatal_error,
                ..
            }
            | ResolvedResult::Unrecoverable {
                retry_errors,
                fatal_error,
                ..
            } => Self {
                response: None,
                errors: retry_errors
                    .into_iter()
                    .map(full_err)
                    .chain(iter::once(full_err(fatal_error)))
                    .collect(),
            },
        }
    }
}

/// State shared by request workers.
struct RequestState {
    driver: Arc<dyn Driver>,
    config: Arc<InferenceConfig>,
    rate_limiter: Option<RateLimiter>,
}

/// Send one page request, retrying transient failures.
#[instrument(level = "debug", skip_all, fields(id = %request.id, page = request.page_index + 1))]
async fn send_page_request(state: Arc<RequestState>, request: PageRequest) -> Result<PageResponse> {
    // If we have a transient failure, back off exponentially.
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: state.config.max_retries,
        jitter_ratio: 0.2,
    };

    let result = send_page_request_inner(&state, &request)
        .await
        .retry_with_async(|_| async { send_page_request_inner(&state, &request).await })
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_fatal(|_, fatal_error| error!("FAILED with error {fatal_error:?}"))
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });
    Ok(PageResponse::from_resolved_result(result))
}

/// One attempt at a page request.
async fn send_page_request_inner(
    state: &RequestState,
    request: &PageRequest,
) -> LlmRetryResult<ChatCompletionResponse> {
    if let Some(rate_limiter) = &state.rate_limiter {
        rate_limiter.acquire_one().await;
    }
    state
        .driver
        .chat_completion(
            &state.config.model,
            &request.payload,
            state.config.request_timeout(),
        )
        .await
}

/// The components an [`InferenceRunner`] is built from.
pub struct InferenceComponents {
    /// Talks to the model server.
    pub driver: Arc<dyn Driver>,
    /// Renders pages.
    pub renderer: Arc<dyn PageRenderer>,
    /// Builds requests.
    pub query_builder: Arc<dyn QueryBuilder>,
    /// Run on each document after inference, in order.
    pub post_process_steps: Vec<Arc<dyn PipelineStep>>,
}

/// Runs page-level inference on each document, then post-processes it.
pub struct InferenceRunner {
    config: Arc<InferenceConfig>,
    renderer: Arc<dyn PageRenderer>,
    query_builder: Arc<dyn QueryBuilder>,
    post_process_steps: Vec<Arc<dyn PipelineStep>>,
    requests: WorkQueue<PageRequest, PageResponse>,
    task_permits: Semaphore,
    consecutive_failures: AtomicUsize,
}

impl InferenceRunner {
    /// Create a runner. The returned worker finishes once the runner is
    /// dropped.
    pub fn new(
        config: InferenceConfig,
        components: InferenceComponents,
    ) -> Result<(Self, JoinWorker)> {
        config.validate()?;
        let config = Arc::new(config);
        let state = Arc::new(RequestState {
            driver: components.driver,
            config: config.clone(),
            rate_limiter: config.rate_limit.as_ref().map(|r| r.to_rate_limiter()),
        });
        let (requests, worker) = WorkQueue::new(
            config.max_concurrent_requests,
            Arc::new(move |request| send_page_request(state.clone(), request).boxed()),
        )?;
        Ok((
            Self {
                task_permits: Semaphore::new(config.max_concurrent_tasks),
                config,
                renderer: components.renderer,
                query_builder: components.query_builder,
                post_process_steps: components.post_process_steps,
                requests,
                consecutive_failures: AtomicUsize::new(0),
            },
            worker,
        ))
    }

    /// Infer every page of a document. Page-level problems are recorded on
    /// the pages. An `Err` means the document could not be processed at all.
    #[instrument(level = "debug", skip_all, fields(id = %id))]
    pub async fn infer_document(
        &self,
        id: &str,
        content: &[u8],
        metadata: &JsonObject,
    ) -> Result<InferenceOutput> {
        let page_count = self.renderer.page_count(content).await?;
        let pages_to_send = match self.config.max_pages {
            Some(max_pages) => page_count.min(max_pages),
            None => page_count,
        };

        // Renderers work from a file, so write one copy for all pages.
        let tmpdir = tempfile::TempDir::with_prefix("infer")?;
        let pdf_path = tmpdir.path().join("input.pdf");
        tokio::fs::write(&pdf_path, content)
            .await
            .context("cannot write PDF for rendering")?;

        // `buffered` keeps pages in order, whatever order they finish in.
        let pages = stream::iter(0..pages_to_send)
            .map(|page_index| self.infer_page(id, metadata, &pdf_path, page_index, page_count))
            .buffered(self.config.max_concurrent_requests)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(InferenceOutput {
            model: self.config.model.clone(),
            page_count,
            pages,
        })
    }

    /// Render, build and send one page.
    async fn infer_page(
        &self,
        id: &str,
        metadata: &JsonObject,
        pdf_path: &Path,
        page_index: usize,
        page_count: usize,
    ) -> Result<PageInference> {
        let rendered = self
            .renderer
            .render_page(pdf_path, page_index, self.config.resize_longest_side_pixels)
            .await
            .and_then(|page| fit_to_token_budget(page, self.config.max_visual_tokens));
        let page = match rendered {
            Ok(page) => Arc::new(page),
            Err(err) => {
                warn!(id, page = page_index + 1, "cannot render page: {err:#}");
                return Ok(PageInference::failed(
                    page_index,
                    None,
                    format!("render failed: {err:#}"),
                ));
            }
        };

        let built = match self.query_builder.build_query(&PageQuery {
            id,
            metadata,
            page: &page,
            page_count,
        }) {
            Ok(built) => built,
            Err(err) => {
                return Ok(PageInference::failed(
                    page_index,
                    Some(page),
                    format!("cannot build request: {err:#}"),
                ));
            }
        };

        let completion_budget = self.config.max_completion_tokens.unwrap_or(0) as usize;
        let needed = built.estimated_prompt_tokens + completion_budget;
        if needed > self.config.model_max_context {
            warn!(id, page = page_index + 1, needed, "request would not fit in context");
            return Ok(PageInference::failed(
                page_index,
                Some(page),
                format!(
                    "request needs about {} tokens, but model_max_context is {}",
                    needed, self.config.model_max_context
                ),
            ));
        }

        let response = self
            .requests
            .process_blocking(PageRequest {
                id: id.to_owned(),
                page_index,
                payload: built.payload,
            })
            .await?;
        let token_usage = response.response.as_ref().and_then(|r| r.token_usage.clone());
        Ok(PageInference {
            page_index,
            image: Some(page),
            response: response.response.map(|r| r.response),
            token_usage,
            errors: response.errors,
            sent: true,
        })
    }

    /// Track runs of failed documents. Returns an error once the run is long
    /// enough to believe the server is down.
    fn record_outcome(&self, all_requests_failed: bool) -> Result<()> {
        if !all_requests_failed {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return Ok(());
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.max_consecutive_failures {
            Err(anyhow!(
                "{} documents in a row failed inference; is the model server at OPENAI_API_BASE reachable?",
                failures
            ))
        } else {
            Ok(())
        }
    }

    /// Run our post-processing steps in order.
    async fn post_process(&self, mut document: Document, ctx: &TaskContext) -> Result<Document> {
        for step in &self.post_process_steps {
            document = step.process(document, ctx).await?;
        }
        Ok(document)
    }
}

#[async_trait]
impl PipelineStep for InferenceRunner {
    fn name(&self) -> &str {
        "inference"
    }

    #[instrument(level = "debug", skip_all, fields(id = %document.id))]
    async fn process(&self, mut document: Document, ctx: &TaskContext) -> Result<Document> {
        document.replace_metadata(keys::EXTRACTOR, json!(format!("ocr:{}", self.config.model)));

        let content = match document.load_content().await {
            Ok(content) => content.into_owned(),
            Err(err) => {
                mark_extraction_failed(
                    &mut document,
                    FailureReason::MissingContent,
                    format!("{err:#}"),
                );
                ctx.stats.incr("inference.missing_content");
                return self.post_process(document, ctx).await;
            }
        };

        let permit = self
            .task_permits
            .acquire()
            .await
            .context("inference task semaphore closed")?;
        let inference = self.infer_document(&document.id, &content, &document.metadata);
        let outcome = match self.config.document_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, inference).await {
                Ok(result) => result.map_err(|err| (FailureReason::BackendFailure, err)),
                Err(_) => Err((
                    FailureReason::Timeout,
                    anyhow!("no result after {:?}", timeout),
                )),
            },
            None => inference
                .await
                .map_err(|err| (FailureReason::BackendFailure, err)),
        };
        drop(permit);

        match outcome {
            Ok(output) => {
                let failed = output.failed_pages();
                let all_requests_failed = !output.pages.is_empty()
                    && output.pages.iter().all(|p| p.sent && p.response.is_none());
                ctx.stats.add("inference.pages", output.pages.len() as u64);
                ctx.stats.add("inference.failed_pages", failed.len() as u64);
                if output.page_count > output.pages.len() {
                    document.replace_metadata(
                        keys::TRUNCATED_PAGES,
                        json!(output.page_count - output.pages.len()),
                    );
                }
                if !failed.is_empty() {
                    document.replace_metadata(
                        keys::EXTRACTION_ERROR,
                        json!({
                            "failed_pages": failed.iter().map(|i| i + 1).collect::<Vec<_>>(),
                            "pages": output.page_errors(),
                        }),
                    );
                    mark_extraction_failed(
                        &mut document,
                        FailureReason::InferenceFailed,
                        format!(
                            "{} of {} pages could not be recognized",
                            failed.len(),
                            output.pages.len()
                        ),
                    );
                    ctx.stats.incr("inference.failed_documents");
                } else {
                    ctx.stats.incr("inference.ok_documents");
                }
                document.inference = Some(output);
                self.record_outcome(all_requests_failed)?;
            }
            Err((reason, err)) => {
                warn!(id = %document.id, "inference failed: {err:#}");
                mark_extraction_failed(&mut document, reason, format!("{err:#}"));
                ctx.stats.incr("inference.failed_documents");
            }
        }

        self.post_process(document, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{
        post_process::ExtractInferenceText, query::VisionQueryBuilder, render::tests::blank_page,
        *,
    };
    use crate::{
        retry::{retry_result_fatal, retry_result_ok, retry_result_transient},
        test_pdfs::text_pdf,
    };

    /// Pretends to render every page as a small blank image.
    struct FakeRenderer;

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn render_page(
            &self,
            _pdf_path: &Path,
            page_index: usize,
            _longest_side: u32,
        ) -> Result<RenderedPage> {
            Ok(blank_page(page_index, 56, 56))
        }
    }

    /// Scripted model server. Answers with the prompt text, after a delay
    /// that makes early pages finish last.
    #[derive(Debug, Default)]
    struct FakeServer {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        /// Fail this many calls with a transient error first.
        transient_failures: AtomicUsize,
        always_fail: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Driver for FakeServer {
        async fn chat_completion(
            &self,
            _model: &str,
            request: &Value,
            _timeout: Option<Duration>,
        ) -> LlmRetryResult<ChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let text = request["messages"][0]["content"][1]["text"]
                .as_str()
                .unwrap_or_default()
                .to_owned();
            let page: u64 = text.rsplit(' ').next().unwrap().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(40 / page)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(text.clone());

            if self.always_fail {
                return retry_result_fatal(anyhow!("server says no"));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return retry_result_transient(anyhow!("503 Service Unavailable"));
            }
            retry_result_ok(ChatCompletionResponse {
                response: json!({
                    "choices": [{ "message": { "content": text }, "finish_reason": "stop" }]
                }),
                token_usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                }),
            })
        }
    }

    fn runner(
        config: InferenceConfig,
        server: Arc<FakeServer>,
    ) -> (InferenceRunner, JoinWorker) {
        let config = InferenceConfig {
            prompt: "page {{page_number}}".to_owned(),
            ..config
        };
        let query_builder = Arc::new(VisionQueryBuilder::new(&config).unwrap());
        InferenceRunner::new(
            config,
            InferenceComponents {
                driver: server,
                renderer: Arc::new(FakeRenderer),
                query_builder,
                post_process_steps: vec![Arc::new(ExtractInferenceText::default())],
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pages_come_back_in_order() {
        let server = Arc::new(FakeServer::default());
        let config = InferenceConfig {
            max_concurrent_requests: 3,
            ..InferenceConfig::default()
        };
        let (runner, _worker) = runner(config, server.clone());
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a", "b", "c"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        assert_eq!(doc.text, "page 1\n\npage 2\n\npage 3");
        assert!(doc.metadata.get(keys::EXTRACTION_ERROR).is_none());
        assert_eq!(doc.metadata[keys::EXTRACTOR], json!("ocr:Reducto/RolmOCR"));
        // The fastest page (3) finished first.
        assert_eq!(server.seen.lock().unwrap()[0], "page 3");
    }

    #[tokio::test]
    async fn in_flight_requests_never_exceed_limit() {
        let server = Arc::new(FakeServer::default());
        let config = InferenceConfig {
            max_concurrent_requests: 2,
            max_concurrent_tasks: 4,
            ..InferenceConfig::default()
        };
        let (runner, _worker) = runner(config, server.clone());
        let ctx = TaskContext::standalone("ocr_extraction");
        let docs = (0..4).map(|i| {
            Document::from_pdf_bytes(format!("doc{i}"), text_pdf(&["a", "b", "c", "d"]))
        });
        let results =
            futures::future::join_all(docs.map(|doc| runner.process(doc, &ctx))).await;
        for doc in results {
            assert!(doc.unwrap().metadata.get(keys::EXTRACTION_ERROR).is_none());
        }
        assert_eq!(server.calls.load(Ordering::SeqCst), 16);
        assert!(server.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = Arc::new(FakeServer {
            transient_failures: AtomicUsize::new(2),
            ..FakeServer::default()
        });
        let (runner, _worker) = runner(InferenceConfig::default(), server.clone());
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        assert_eq!(doc.text, "page 1");
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let server = Arc::new(FakeServer {
            transient_failures: AtomicUsize::new(2),
            ..FakeServer::default()
        });
        let config = InferenceConfig {
            max_retries: 0,
            ..InferenceConfig::default()
        };
        assert!(config.validate().is_ok());
        let (runner, _worker) = runner(config, server.clone());
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        let marker = &doc.metadata[keys::EXTRACTION_ERROR];
        assert_eq!(marker["failed_pages"], json!([1]));
        let error = marker["pages"][0]["errors"][0].as_str().unwrap();
        assert!(error.contains("503"), "{error}");
    }

    #[tokio::test]
    async fn failed_documents_are_marked_and_passed_on() {
        let server = Arc::new(FakeServer {
            always_fail: true,
            ..FakeServer::default()
        });
        let (runner, _worker) = runner(InferenceConfig::default(), server);
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a", "b"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        let marker = &doc.metadata[keys::EXTRACTION_ERROR];
        assert_eq!(marker["reason"], json!("inference_failed"));
        assert_eq!(marker["failed_pages"], json!([1, 2]));
        let pages = marker["pages"].as_array().unwrap();
        assert_eq!(pages.len(), 2);
        for (page, expected) in pages.iter().zip([1, 2]) {
            assert_eq!(page["page"], json!(expected));
            let errors = page["errors"].as_array().unwrap();
            assert!(!errors.is_empty(), "{page}");
            assert!(errors[0].as_str().unwrap().contains("server says no"), "{page}");
        }
        assert!(doc.text.contains("could not be recognized"));
    }

    #[tokio::test]
    async fn long_failure_runs_are_fatal() {
        let server = Arc::new(FakeServer {
            always_fail: true,
            ..FakeServer::default()
        });
        let config = InferenceConfig {
            max_consecutive_failures: 2,
            ..InferenceConfig::default()
        };
        let (runner, _worker) = runner(config, server);
        let ctx = TaskContext::standalone("ocr_extraction");
        let pdf = text_pdf(&["a"]);
        assert!(
            runner
                .process(Document::from_pdf_bytes("one", pdf.clone()), &ctx)
                .await
                .is_ok()
        );
        let err = runner
            .process(Document::from_pdf_bytes("two", pdf), &ctx)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("in a row"), "{err}");
    }

    #[tokio::test]
    async fn oversized_requests_are_not_sent() {
        let server = Arc::new(FakeServer::default());
        let config = InferenceConfig {
            model_max_context: 4100,
            max_completion_tokens: Some(4096),
            ..InferenceConfig::default()
        };
        let (runner, _worker) = runner(config, server.clone());
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            doc.metadata[keys::EXTRACTION_ERROR]["reason"],
            json!("inference_failed")
        );
    }

    #[tokio::test]
    async fn max_pages_truncates() {
        let server = Arc::new(FakeServer::default());
        let config = InferenceConfig {
            max_pages: Some(1),
            ..InferenceConfig::default()
        };
        let (runner, _worker) = runner(config, server);
        let ctx = TaskContext::standalone("ocr_extraction");
        let doc = Document::from_pdf_bytes("doc", text_pdf(&["a", "b", "c"]));
        let doc = runner.process(doc, &ctx).await.unwrap();
        assert_eq!(doc.text, "page 1");
        assert_eq!(doc.metadata[keys::TRUNCATED_PAGES], json!(2));
    }

    #[test]
    fn rejects_configs_without_room_for_prompts() {
        let config = InferenceConfig {
            model_max_context: 1000,
            max_completion_tokens: Some(1000),
            ..InferenceConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(InferenceConfig::default().validate().is_ok());
    }
}
