mod client;
pub(crate) mod types;

use async_trait::async_trait;

use crate::error::AiError;
use crate::traits::{CompletionRequest, ImagePart, JsonCompletion};

use client::OpenAiClient;

// =============================================================================
// OpenAi Agent
// =============================================================================

#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    pub(crate) model: String,
    base_url: Option<String>,
    http: reqwest::Client,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, AiError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AiError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Share one connection pool across agents.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn client(&self) -> OpenAiClient {
        let client = OpenAiClient::new(&self.api_key, self.http.clone());
        if let Some(ref url) = self.base_url {
            client.with_base_url(url)
        } else {
            client
        }
    }

    fn base_request(&self, max_tokens: u32) -> types::ChatRequest {
        let request = types::ChatRequest::new(&self.model)
            .response_format(types::ResponseFormat::json_object());

        if types::uses_max_completion_tokens(&self.model) {
            request.max_completion_tokens(max_tokens)
        } else {
            request.max_tokens(max_tokens).temperature(0.0)
        }
    }

    /// JSON-mode chat completion with inline images. Returns the raw message content.
    pub async fn vision_completion(
        &self,
        system: impl Into<String>,
        user_text: impl Into<String>,
        images: &[ImagePart],
        max_tokens: u32,
    ) -> Result<String, AiError> {
        let data_urls: Vec<String> = images.iter().map(|i| i.data_url.clone()).collect();
        let request = self
            .base_request(max_tokens)
            .message(types::WireMessage::system(system))
            .message(types::WireMessage::user_with_images(user_text, &data_urls));

        self.client().chat_content(&request).await
    }

    /// JSON-mode text-only chat completion. Returns the raw message content.
    pub async fn json_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
        max_tokens: u32,
    ) -> Result<String, AiError> {
        let request = self
            .base_request(max_tokens)
            .message(types::WireMessage::system(system))
            .message(types::WireMessage::user(user));

        self.client().chat_content(&request).await
    }
}

// =============================================================================
// JsonCompletion Implementation
// =============================================================================

#[async_trait]
impl JsonCompletion for OpenAi {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete_json(&self, request: CompletionRequest) -> Result<String, AiError> {
        if request.images.is_empty() {
            self.json_completion(request.system, request.user, request.max_tokens)
                .await
        } else {
            self.vision_completion(
                request.system,
                request.user,
                &request.images,
                request.max_tokens,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_openai_new() {
        let ai = OpenAi::new("sk-test", "gpt-4o-mini");
        assert_eq!(ai.model, "gpt-4o-mini");
        assert_eq!(ai.api_key, "sk-test");
    }

    #[test]
    fn test_openai_with_base_url() {
        let ai = OpenAi::new("sk-test", "gpt-4o").with_base_url("https://custom.api.com");
        assert_eq!(ai.base_url, Some("https://custom.api.com".to_string()));
    }

    #[test]
    fn reasoning_models_use_max_completion_tokens() {
        let req = OpenAi::new("k", "gpt-5-mini").base_request(500);
        assert_eq!(req.max_completion_tokens, Some(500));
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.temperature, None);

        let req = OpenAi::new("k", "gpt-4o-mini").base_request(500);
        assert_eq!(req.max_tokens, Some(500));
        assert_eq!(req.temperature, Some(0.0));
    }

    #[tokio::test]
    async fn json_completion_returns_raw_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "response_format": { "type": "json_object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "```json\n{\"edges\":[]}\n```" } }]
            })))
            .mount(&server)
            .await;

        let ai = OpenAi::new("sk-test", "gpt-4o-mini").with_base_url(server.uri());
        let content = ai.json_completion("sys", "user", 900).await.unwrap();
        assert_eq!(content, "```json\n{\"edges\":[]}\n```");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .mount(&server)
            .await;

        let ai = OpenAi::new("sk-test", "gpt-4o-mini").with_base_url(server.uri());
        let err = ai
            .vision_completion("sys", "user", &[ImagePart::new("data:image/png;base64,AA")], 500)
            .await
            .unwrap_err();

        match err {
            AiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(5)))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_without_hint_has_no_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let ai = OpenAi::new("sk-test", "gpt-4o-mini").with_base_url(server.uri());
        let err = ai.json_completion("sys", "user", 900).await.unwrap_err();
        assert!(matches!(err, AiError::RateLimited { retry_after: None }));
    }

    #[tokio::test]
    async fn server_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let ai = OpenAi::new("sk-test", "gpt-4o-mini").with_base_url(server.uri());
        let err = ai.json_completion("sys", "user", 900).await.unwrap_err();
        match err {
            AiError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "upstream unavailable");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }
}
