//! Echo driver for testing.
//!
//! This driver answers every request with the text parts of its last user
//! message, wrapped in a chat completion response. Page images are ignored.

use std::time::Duration;

use super::{ChatCompletionResponse, Driver, LlmRetryResult, TokenUsage};
use crate::{
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok},
};

/// Echo driver for testing.
#[derive(Debug, Default)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

/// Extract the text from the last user message. Content may be a plain string
/// or a list of typed parts.
fn extract_last_user_text(request: &Value) -> Result<String> {
    let messages = request
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| anyhow!("request has no messages"))?;
    let content = messages
        .iter()
        .rev()
        .find(|msg| msg.get("role").and_then(|r| r.as_str()) == Some("user"))
        .and_then(|msg| msg.get("content"))
        .ok_or_else(|| anyhow!("No user message found in request"))?;
    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")),
        _ => Err(anyhow!("unsupported message content: {content}")),
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn chat_completion(
        &self,
        model: &str,
        request: &Value,
        _timeout: Option<Duration>,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let text = match extract_last_user_text(request) {
            Ok(text) => text,
            Err(err) => return retry_result_fatal(err),
        };
        retry_result_ok(ChatCompletionResponse {
            response: json!({
                "id": "echo",
                "object": "chat.completion",
                "created": 0,
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": text },
                    "finish_reason": "stop",
                }],
            }),
            token_usage: Some(TokenUsage::default()),
        })
    }
}

// We focus on testing the "sad paths", because the happy path is tested by the
// dispatcher tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_parts_and_skips_images() {
        let request = json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": "data:image/png;base64," } },
                    { "type": "text", "text": "page 2" },
                ],
            }],
        });
        assert_eq!(extract_last_user_text(&request).unwrap(), "page 2");
    }

    #[test]
    fn missing_user_message_is_an_error() {
        let request = json!({ "messages": [{ "role": "system", "content": "hi" }] });
        let err = extract_last_user_text(&request).unwrap_err();
        assert!(err.to_string().contains("No user message"));
        assert!(extract_last_user_text(&json!({})).is_err());
    }
}
