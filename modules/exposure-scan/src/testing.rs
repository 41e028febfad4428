// Test mocks for the exposure scan.
//
// Three mocks matching the three trait boundaries:
// - MockModel (JsonCompletion): scripted replies and errors, records requests
// - MockFetcher (ImageFetcher): succeeds for any URL unless told to fail
// - MemoryStore (ScanStore): keeps the last saved snapshot in memory
//
// Plus helpers for constructing items, signals and a fast ScanConfig.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use ai_client::{AiError, CompletionRequest, ImagePart, JsonCompletion};
use async_trait::async_trait;
use exposure_common::{ExposureError, ImageSignal, Item, Severity, SignalType, TextSignal};

use crate::scan::{ScanConfig, ScanSnapshot};
use crate::traits::{ImageFetcher, ScanStore};

// ---------------------------------------------------------------------------
// MockModel
// ---------------------------------------------------------------------------

enum Scripted {
    Reply(String),
    RateLimited(Option<Duration>),
    Api(u16, String),
    Empty,
}

impl Scripted {
    fn into_result(self) -> Result<String, AiError> {
        match self {
            Scripted::Reply(text) => Ok(text),
            Scripted::RateLimited(retry_after) => Err(AiError::RateLimited { retry_after }),
            Scripted::Api(status, message) => Err(AiError::Api { status, message }),
            Scripted::Empty => Err(AiError::EmptyContent),
        }
    }
}

/// Answers from a script, in order. Once the script runs out every call gets
/// the fallback reply.
/// Builder pattern: `.reply()`, `.rate_limited()`, `.api_error()`, `.empty()`.
pub struct MockModel {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    fallback: String,
    latency: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            name: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: "{}".to_string(),
            latency: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Scripted::Reply(text.into()))
    }

    pub fn rate_limited(self, retry_after: Option<Duration>) -> Self {
        self.push(Scripted::RateLimited(retry_after))
    }

    pub fn api_error(self, status: u16, message: &str) -> Self {
        self.push(Scripted::Api(status, message.to_string()))
    }

    pub fn empty(self) -> Self {
        self.push(Scripted::Empty)
    }

    pub fn otherwise(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// Every call sleeps this long before answering.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn push(self, scripted: Scripted) -> Self {
        self.script.lock().unwrap().push_back(scripted);
        self
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JsonCompletion for MockModel {
    fn model(&self) -> &str {
        &self.name
    }

    async fn complete_json(&self, request: CompletionRequest) -> Result<String, AiError> {
        self.requests.lock().unwrap().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(scripted) => scripted.into_result(),
            None => Ok(self.fallback.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Returns a tiny PNG for every URL except the ones registered with `.fail()`.
pub struct MockFetcher {
    failing: HashSet<String>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, url: &str, _referer: &str) -> Result<ImagePart, ExposureError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.failing.contains(url) {
            return Err(ExposureError::Transport(format!(
                "MockFetcher: {url} registered to fail"
            )));
        }
        Ok(ImagePart::from_bytes("image/png", b"\x89PNG"))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<ScanSnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: ScanSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Option<ScanSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn load(&self) -> Result<Option<ScanSnapshot>, ExposureError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn save(&self, snapshot: &ScanSnapshot) -> Result<(), ExposureError> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// An allow-listed image URL.
pub fn trusted_image(item_id: &str, n: usize) -> String {
    format!("https://postfiles.pstatic.net/{item_id}/{n}.jpg")
}

/// Item with `images` allow-listed images and no text.
pub fn item(id: &str, images: usize) -> Item {
    Item {
        id: id.to_string(),
        url: format!("https://blog.example/{id}"),
        title: format!("Post {id}"),
        published_at: None,
        text: String::new(),
        images: (0..images).map(|n| trusted_image(id, n)).collect(),
    }
}

pub fn text_item(id: &str, text: &str) -> Item {
    Item {
        text: text.to_string(),
        ..item(id, 0)
    }
}

pub fn image_signal(item_id: &str, image_index: usize, label: &str, severity: Severity) -> ImageSignal {
    ImageSignal {
        source_item_id: item_id.to_string(),
        item_url: format!("https://blog.example/{item_id}"),
        item_title: format!("Post {item_id}"),
        image_url: trusted_image(item_id, image_index),
        image_index,
        label: label.to_string(),
        severity,
        excerpt: format!("{label} visible"),
        rationale: "identifies the household".to_string(),
        confidence: Some(0.8),
    }
}

pub fn text_signal(item_id: &str, signal_type: SignalType, value: &str) -> TextSignal {
    TextSignal {
        signal_type,
        value: value.to_string(),
        source_item_id: Some(item_id.to_string()),
        excerpt: Some(value.to_string()),
        rationale: Some("narrows down where the author lives".to_string()),
        confidence: Some(0.7),
    }
}

/// A `{"findings": [...]}` reply with one finding per `(item, index, label)`.
pub fn findings_reply(findings: &[(&str, usize, &str)]) -> String {
    let records: Vec<serde_json::Value> = findings
        .iter()
        .map(|(item, index, label)| {
            serde_json::json!({
                "sourceItemId": item,
                "imageIndex": index,
                "label": label,
                "severity": "high",
                "excerpt": format!("{label} readable"),
                "rationale": "pins the author's location",
                "confidence": 0.9,
            })
        })
        .collect();
    serde_json::json!({ "findings": records }).to_string()
}

/// No pacing, no local limit, small batches.
pub fn fast_config(max_images_per_call: usize) -> ScanConfig {
    ScanConfig {
        max_images_per_call,
        calls_per_minute: 0,
        pacing_min: Duration::from_millis(1),
        pacing_max: Duration::from_millis(1),
        ..ScanConfig::default()
    }
}
