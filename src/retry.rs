//! Support utilities for [`keen_retry`]'s retry API.

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::prelude::*;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_with_retry_result;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Convert a [`Result`] into a [`RetryResult`].
pub(crate) trait IntoRetryResult<T, E> {
    /// Treat any error as transient.
    fn into_transient(self) -> RetryResult<(), (), T, anyhow::Error>;

    /// Decide whether an error is transient using `is_transient`.
    fn into_retry_result(
        self,
        is_transient: impl FnOnce(&E) -> bool,
    ) -> RetryResult<(), (), T, anyhow::Error>;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn into_transient(self) -> RetryResult<(), (), T, anyhow::Error> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) => {
                let error = error.into();
                debug!("Potentially transient error: {:?}", error);
                retry_result_transient(error)
            }
        }
    }

    fn into_retry_result(
        self,
        is_transient: impl FnOnce(&E) -> bool,
    ) -> RetryResult<(), (), T, anyhow::Error> {
        match self {
            Ok(output) => retry_result_ok(output),
            Err(error) if is_transient(&error) => {
                let error = error.into();
                debug!("Potentially transient error: {:?}", error);
                retry_result_transient(error)
            }
            Err(error) => retry_result_fatal(error.into()),
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient. This includes "connection refused" while an inference
            // server is still loading its model.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(err) => {
                let message = err.message.to_ascii_lowercase();
                // Servers like vLLM and LMDeploy report an oversized prompt as
                // an ordinary API error. That will never succeed on retry.
                if message.contains("context length")
                    || message.contains("maximum context")
                {
                    return false;
                }
                message.contains("rate limit")
                    || message.contains("overloaded")
                    || message.contains("try again")
            }
            // Truncated or garbled bodies from an overloaded server.
            OpenAIError::JSONDeserialize(_) | OpenAIError::StreamError(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_worth_retrying() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
    }

    #[test]
    fn into_retry_result_classifies_errors() {
        let transient: Result<(), &str> = Err("flaky");
        assert!(matches!(
            transient.map_err(|e| anyhow!(e)).into_transient(),
            RetryResult::Transient { .. }
        ));
        let fatal: Result<u8> = Err(anyhow!("broken"));
        assert!(matches!(
            fatal.into_retry_result(|_| false),
            RetryResult::Fatal { .. }
        ));
        let ok: Result<u8> = Ok(3);
        assert!(matches!(
            ok.into_retry_result(|_| true),
            RetryResult::Ok { output: 3, .. }
        ));
    }
}
