//! Chat-completions client for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: Only 429, 5xx and transport failures can succeed on retry
//! - B_i: Response content may be missing or null → InvalidResponse
//! - I^B: Network and service availability → bounded retries with backoff
//!
//! - One request at a time per caller; no pooling beyond reqwest's own.
//! - Transport failures, 429s and 5xx responses are retried up to
//!   `max_retries` attempts in total; any other error status fails at once.
//! - Once attempts run out, the last error is returned as is.

use crate::client::RateLimiter;
use crate::models::{EndpointConfig, ModelSpec, RepairError, Result, ServiceError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default base delay between transport retries; doubles each attempt.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on a single retry delay.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated content
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    /// Input tokens
    pub input_tokens: u32,
    /// Output tokens
    pub output_tokens: u32,
    /// Request duration, including retries
    pub duration: Duration,
}

/// Client for a single OpenAI-compatible chat-completions endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    rate_limiter: Arc<RateLimiter>,
    total_requests: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
}

impl ChatClient {
    /// Create a new client. `max_retries` is the total number of attempts.
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RepairError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
            total_requests: AtomicU64::new(0),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
        })
    }

    /// Create a client from the `[endpoint]` config section.
    pub fn from_config(config: &EndpointConfig, api_key: Option<String>) -> Result<Self> {
        Self::new(
            api_key,
            config.base_url.clone(),
            config.timeout_secs,
            config.max_retries,
            None,
        )
    }

    /// Set the base delay between transport retries.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    /// Get the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| RepairError::InvalidInput("API key is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
    }

    /// Complete a chat request.
    pub async fn complete(&self, model: &ModelSpec, messages: &[Message]) -> Result<Completion> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model: &model.id,
            messages,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.headers()?;
        let mut attempt = 0;

        loop {
            self.rate_limiter.wait_if_needed(&model.id).await;
            attempt += 1;

            let error = match self.send(&url, &headers, &request, model).await {
                Ok(mut completion) => {
                    completion.duration = start.elapsed();
                    return Ok(completion);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= self.max_retries {
                warn!(attempts = attempt, error = %error, "Giving up on generation request");
                return Err(error);
            }

            match error.retry_after() {
                // The rate limiter holds this wait; it is served at the top of the loop.
                Some(secs) => debug!(attempt, retry_after_secs = secs, "Rate limited, retrying"),
                None => {
                    let backoff = self.backoff(attempt);
                    debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Retrying generation request"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One HTTP attempt.
    async fn send(
        &self,
        url: &str,
        headers: &HeaderMap,
        request: &ChatCompletionRequest<'_>,
        model: &ModelSpec,
    ) -> Result<Completion> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(url)
            .headers(headers.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RepairError::Timeout(self.timeout)
                } else {
                    RepairError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        let wait = self
            .rate_limiter
            .record_request(&model.id, status, response.headers());

        if status == 429 {
            let message = response.text().await.unwrap_or_default();
            return Err(RepairError::Service(ServiceError::RateLimited {
                message,
                retry_after_secs: Some(wait.as_secs_f64()),
            }));
        }

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .map(|api_error| api_error.error.message)
                .unwrap_or(error_body);
            let error = match status {
                401 => ServiceError::AuthenticationFailed,
                404 => ServiceError::ModelNotFound(model.id.clone()),
                _ => ServiceError::ApiError { status, message },
            };
            if status >= 500 {
                warn!(status, "Server error from generation service");
            }
            return Err(RepairError::Service(error));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            RepairError::Service(ServiceError::InvalidResponse(format!(
                "Failed to decode completion: {e}"
            )))
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                RepairError::Service(ServiceError::InvalidResponse(
                    "No content in response".to_string(),
                ))
            })?;

        let usage = body.usage.unwrap_or_default();
        self.total_input_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.total_output_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);

        Ok(Completion {
            content,
            model: body.model.unwrap_or_else(|| model.id.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            duration: Duration::ZERO,
        })
    }

    /// Total HTTP requests sent, retries included.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get total tokens tracked as (input, output).
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }
}
