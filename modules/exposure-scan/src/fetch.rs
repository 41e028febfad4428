use ai_client::ImagePart;
use async_trait::async_trait;
use exposure_common::{guess_image_content_type, is_allowed_image_url, ExposureError};
use reqwest::header::{ACCEPT, CONTENT_TYPE, REFERER, USER_AGENT};
use tracing::debug;

use crate::traits::ImageFetcher;

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Downloads allow-listed images over HTTPS and inlines them as data URLs.
pub struct HttpImageFetcher {
    http: reqwest::Client,
    max_bytes: usize,
    trusted_hosts: Vec<String>,
}

impl HttpImageFetcher {
    pub fn new(http: reqwest::Client, max_bytes: usize, trusted_hosts: Vec<String>) -> Self {
        Self {
            http,
            max_bytes,
            trusted_hosts,
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, referer: &str) -> Result<ImagePart, ExposureError> {
        if !is_allowed_image_url(url, &self.trusted_hosts) {
            return Err(ExposureError::Validation(format!(
                "image host not allowed: {url}"
            )));
        }

        let response = self
            .http
            .get(url)
            .header(USER_AGENT, BROWSER_UA)
            .header(ACCEPT, "image/avif,image/webp,image/*,*/*;q=0.8")
            .header(REFERER, referer)
            .send()
            .await
            .map_err(|e| ExposureError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExposureError::Transport(format!(
                "image fetch {url} returned {status}"
            )));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(ExposureError::Validation(format!(
                    "image too large: {len} bytes"
                )));
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or_else(|| guess_image_content_type(url).to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExposureError::Transport(e.to_string()))?;

        if bytes.is_empty() {
            return Err(ExposureError::Validation(format!("empty image body: {url}")));
        }
        if bytes.len() > self.max_bytes {
            return Err(ExposureError::Validation(format!(
                "image too large: {} bytes",
                bytes.len()
            )));
        }

        debug!(url, bytes = bytes.len(), content_type = content_type.as_str(), "Fetched image");
        Ok(ImagePart::from_bytes(&content_type, &bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_untrusted_hosts_before_any_request() {
        let fetcher = HttpImageFetcher::new(
            reqwest::Client::new(),
            1_000,
            vec!["pstatic.net".to_string()],
        );
        let err = fetcher
            .fetch("https://evil.example/a.jpg", "https://blog.example/1")
            .await
            .unwrap_err();
        assert!(matches!(err, ExposureError::Validation(_)));
    }
}
