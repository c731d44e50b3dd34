//! Chat completion drivers.
//!
//! Mostly we prefer to leave model compatibility to the serving stack (vLLM,
//! LMDeploy, Ollama, LiteLLM), which all speak the OpenAI chat completions
//! protocol. The echo driver exists so the whole pipeline can be exercised
//! without a model server.

use std::{error, fmt, ops::AddAssign, pin::Pin, sync::Arc, time::Duration};

use clap::ValueEnum;
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use tokio::time;

use crate::{prelude::*, retry::IsKnownTransient};

pub mod echo;
pub mod openai;

/// Our different driver types.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI-compatible chat completions (vLLM, LMDeploy, Ollama, LiteLLM).
    #[default]
    #[serde(rename = "openai")]
    #[clap(name = "openai")]
    OpenAI,

    /// Echo the prompt text back. For testing without a model server.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver.
    pub fn create_driver(&self) -> Result<Arc<dyn Driver>> {
        match self {
            DriverType::OpenAI => Ok(Arc::new(openai::OpenAiDriver::new()?)),
            DriverType::Echo => Ok(Arc::new(echo::EchoDriver::new())),
        }
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for chat completion drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Send one chat completion request. `request` is a provider-specific
    /// payload without a `model` field.
    async fn chat_completion(
        &self,
        model: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// A chat completion response.
#[derive(Clone, Debug)]
pub struct ChatCompletionResponse {
    /// The raw response body. Post-processing steps pull text out of this.
    pub response: Value,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Apply an optional timeout to a driver call.
///
/// The `Pin<Box<dyn Future<...>>>` is just our friend
/// [`crate::async_utils::BoxedFuture`], written out the long way so we can
/// include `'fut`, because `future` may borrow the request.
pub fn apply_timeout<'fut, T, E>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, E>> + Send + 'fut,
) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let future = future.map_err(LlmError::Native);
    if let Some(timeout) = timeout {
        time::timeout(timeout, future)
            // We have a `Result<Result<T, LlmError<E>>, Elapsed>` here, and
            // we want to convert it to a `Result<T, LlmError<E>>`.
            .map(|result| match result {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout),
            })
            .boxed()
    } else {
        future.boxed()
    }
}

/// An error which occurred while calling a model.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    /// Is this a known transient error?
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and overloaded servers can be retried with
            // hope of a better result.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "model server error: {err}"),
            LlmError::Timeout => write!(f, "model request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

/// Pull the assistant text out of a chat completion response.
pub fn response_text(response: &Value) -> Option<&str> {
    response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Get the finish reason from a chat completion response.
pub fn finish_reason(response: &Value) -> Option<&str> {
    response.get("choices")?.get(0)?.get("finish_reason")?.as_str()
}
