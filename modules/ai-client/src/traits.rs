use async_trait::async_trait;

use crate::error::AiError;

// =============================================================================
// Request Types
// =============================================================================

/// One inline image sent alongside the prompt, already encoded as a data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub data_url: String,
}

impl ImagePart {
    pub fn new(data_url: impl Into<String>) -> Self {
        Self {
            data_url: data_url.into(),
        }
    }

    /// Encode raw image bytes as a `data:<content_type>;base64,...` URL.
    pub fn from_bytes(content_type: &str, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::new(format!("data:{content_type};base64,{encoded}"))
    }
}

/// A single-shot request whose answer is expected (not guaranteed) to be a JSON object.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<ImagePart>,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            images: Vec::new(),
            max_tokens: 900,
        }
    }

    pub fn images(mut self, images: Vec<ImagePart>) -> Self {
        self.images = images;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

// =============================================================================
// JsonCompletion Trait
// =============================================================================

/// A model that answers with raw text that should contain JSON.
///
/// The text is returned untouched: callers decide how tolerant to be.
#[async_trait]
pub trait JsonCompletion: Send + Sync {
    fn model(&self) -> &str;

    async fn complete_json(&self, request: CompletionRequest) -> Result<String, AiError>;
}
