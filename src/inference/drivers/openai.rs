//! Our OpenAI driver, which we also use for vLLM, LMDeploy, Ollama, LiteLLM
//! and other compatible servers.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};

use super::{
    ChatCompletionResponse, Driver, LlmError, LlmRetryResult, TokenUsage, apply_timeout,
};
use crate::{
    prelude::*,
    retry::{
        IntoRetryResult as _, IsKnownTransient as _, retry_result_fatal, retry_result_ok,
        retry_result_transient, try_with_retry_result,
    },
};

/// Our OpenAI driver.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    pub client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver, configured from `OPENAI_API_BASE` and
    /// `OPENAI_API_KEY`.
    pub fn new() -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            client_config = client_config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(client_config),
        })
    }
}

#[async_trait]
impl Driver for OpenAiDriver {
    async fn chat_completion(
        &self,
        model: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let mut req = match request {
            Value::Object(req) => req.clone(),
            _ => return retry_result_fatal(anyhow!("chat request must be a JSON object")),
        };
        req.insert("model".to_owned(), Value::String(model.to_owned()));
        trace!(?req, "Request");

        // Call the server.
        let chat = self.client.chat();
        let chat_result: Value = try_with_retry_result!(
            apply_timeout(timeout, chat.create_byot::<Value, Value>(Value::Object(req)))
                .await
                .into_retry_result(LlmError::is_known_transient)
        );
        debug!(%chat_result, "Chat completion response");

        // Make sure this looks like a chat completion before handing it on.
        // A garbled body from an overloaded server is worth another try.
        let parsed = try_with_retry_result!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result.clone())
                .context("Error parsing chat completion response")
                .into_transient()
        );
        let token_usage = parsed.usage.map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });
        let choice = match parsed.choices.first() {
            Some(choice) => choice,
            None => return retry_result_transient(anyhow!("No choices in response")),
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        if choice.message.content.is_none() {
            return retry_result_transient(anyhow!("Response has no message content"));
        }

        retry_result_ok(ChatCompletionResponse {
            response: chat_result,
            token_usage,
        })
    }
}
