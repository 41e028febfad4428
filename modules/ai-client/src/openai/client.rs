use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::types::*;
use crate::error::AiError;
use crate::rate_limit::retry_after_from_headers;
use crate::util::truncate_chars;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Upper bound on how much of an error body is kept in `AiError::Api`.
const ERROR_BODY_CHARS: usize = 240;

pub(crate) struct OpenAiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, http: reqwest::Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            http,
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, AiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| AiError::Config(format!("invalid api key header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Send a chat completion and return the first choice's content.
    pub async fn chat_content(&self, request: &ChatRequest) -> Result<String, AiError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "OpenAI chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_from_headers(response.headers(), Utc::now());
            warn!(?retry_after, model = %request.model, "OpenAI rate limited");
            return Err(AiError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                message: truncate_chars(&error_text, ERROR_BODY_CHARS).to_string(),
            });
        }

        let body = response.text().await?;
        extract_content(&body)
    }
}

/// Unwrap `choices[0].message.content` from a chat-completions envelope.
pub(crate) fn extract_content(body: &str) -> Result<String, AiError> {
    let chat_response: ChatResponse = serde_json::from_str(body)?;

    if let Some(ref usage) = chat_response.usage {
        debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "OpenAI usage"
        );
    }

    let choice = chat_response
        .choices
        .into_iter()
        .next()
        .ok_or(AiError::EmptyContent)?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("OpenAI completion truncated at max tokens");
    }

    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(AiError::EmptyContent),
    }
}
