use std::env;
use std::str::FromStr;

use tracing::info;

use crate::error::ExposureError;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_IMAGES_PER_CALL: usize = 12;
pub const MAX_IMAGES_PER_CALL_CEILING: usize = 25;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 1_500_000;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 6;
pub const DEFAULT_RATE_LIMIT_FALLBACK_MS: u64 = 8_000;
pub const DEFAULT_CALLS_PER_MINUTE: u32 = 20;
pub const DEFAULT_TRUSTED_IMAGE_HOSTS: &str = "pstatic.net";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // OpenAI
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub vision_model: String,
    pub graph_model: String,

    // Image scan
    pub max_images_per_call: usize,
    pub max_image_bytes: usize,
    pub download_concurrency: usize,
    pub trusted_image_hosts: Vec<String>,

    // Pacing
    pub rate_limit_fallback_ms: u64,
    /// 0 disables the local limiter.
    pub calls_per_minute: u32,
}

impl Config {
    /// Defaults for everything but the API key.
    pub fn new(openai_api_key: impl Into<String>) -> Self {
        Self {
            openai_api_key: openai_api_key.into(),
            openai_base_url: None,
            vision_model: DEFAULT_MODEL.to_string(),
            graph_model: DEFAULT_MODEL.to_string(),
            max_images_per_call: DEFAULT_MAX_IMAGES_PER_CALL,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            trusted_image_hosts: split_hosts(DEFAULT_TRUSTED_IMAGE_HOSTS),
            rate_limit_fallback_ms: DEFAULT_RATE_LIMIT_FALLBACK_MS,
            calls_per_minute: DEFAULT_CALLS_PER_MINUTE,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ExposureError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ExposureError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("OPENAI_API_KEY").ok_or_else(|| {
            ExposureError::Config("OPENAI_API_KEY environment variable is required".into())
        })?;
        let mut config = Self::new(api_key);

        config.openai_base_url = get("OPENAI_BASE_URL");
        if let Some(model) = get("EXPOSURE_VISION_MODEL") {
            config.vision_model = model;
        }
        if let Some(model) = get("EXPOSURE_GRAPH_MODEL") {
            config.graph_model = model;
        }
        if let Some(n) = parse_var::<usize>(&get, "EXPOSURE_MAX_IMAGES_PER_CALL")? {
            config.max_images_per_call = n.clamp(1, MAX_IMAGES_PER_CALL_CEILING);
        }
        if let Some(n) = parse_var::<usize>(&get, "EXPOSURE_MAX_IMAGE_BYTES")? {
            config.max_image_bytes = n;
        }
        if let Some(n) = parse_var::<usize>(&get, "EXPOSURE_DOWNLOAD_CONCURRENCY")? {
            config.download_concurrency = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&get, "EXPOSURE_RATE_LIMIT_FALLBACK_MS")? {
            config.rate_limit_fallback_ms = ms;
        }
        if let Some(n) = parse_var::<u32>(&get, "EXPOSURE_CALLS_PER_MINUTE")? {
            config.calls_per_minute = n;
        }
        if let Some(hosts) = get("EXPOSURE_TRUSTED_IMAGE_HOSTS") {
            config.trusted_image_hosts = split_hosts(&hosts);
        }

        Ok(config)
    }

    /// Log config values with secrets redacted.
    pub fn log_redacted(&self) {
        info!(
            openai_api_key = redact(&self.openai_api_key),
            openai_base_url = self.openai_base_url.as_deref().unwrap_or("(default)"),
            vision_model = self.vision_model.as_str(),
            graph_model = self.graph_model.as_str(),
            max_images_per_call = self.max_images_per_call,
            max_image_bytes = self.max_image_bytes,
            download_concurrency = self.download_concurrency,
            trusted_image_hosts = ?self.trusted_image_hosts,
            rate_limit_fallback_ms = self.rate_limit_fallback_ms,
            calls_per_minute = self.calls_per_minute,
            "Config loaded"
        );
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ExposureError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ExposureError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}

fn split_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        return "***".to_string();
    }
    let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("***{tail}")
}
