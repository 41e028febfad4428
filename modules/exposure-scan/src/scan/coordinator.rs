use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ai_client::{CompletionRequest, ImagePart, JsonCompletion};
use chrono::Utc;
use exposure_common::{Config, ExposureError, ImageSignal, Item, ReportScoring, ScanState};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cursor::{next_batch, Batch, ImageRef};
use super::session::{ScanSession, ScanSnapshot};
use crate::decode::decode_image_findings;
use crate::model::{complete_and_parse, ModelReply};
use crate::prompt;
use crate::rate_limit::CallRateLimiter;
use crate::scoring::score_report;
use crate::traits::{ImageFetcher, ScanStore};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_images_per_call: usize,
    pub download_concurrency: usize,
    pub trusted_image_hosts: Vec<String>,
    /// Used when a rate-limit response carries no usable hint.
    pub rate_limit_fallback: Duration,
    /// 0 disables the local limiter.
    pub calls_per_minute: u32,
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    pub min_retry: Duration,
    pub max_retry: Duration,
    pub max_tokens: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_images_per_call: exposure_common::config::DEFAULT_MAX_IMAGES_PER_CALL,
            download_concurrency: exposure_common::config::DEFAULT_DOWNLOAD_CONCURRENCY,
            trusted_image_hosts: vec![
                exposure_common::config::DEFAULT_TRUSTED_IMAGE_HOSTS.to_string()
            ],
            rate_limit_fallback: Duration::from_millis(
                exposure_common::config::DEFAULT_RATE_LIMIT_FALLBACK_MS,
            ),
            calls_per_minute: exposure_common::config::DEFAULT_CALLS_PER_MINUTE,
            pacing_min: Duration::from_millis(1800),
            pacing_max: Duration::from_millis(2600),
            min_retry: Duration::from_secs(1),
            max_retry: Duration::from_secs(120),
            max_tokens: 900,
        }
    }
}

impl ScanConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_images_per_call: config.max_images_per_call,
            download_concurrency: config.download_concurrency,
            trusted_image_hosts: config.trusted_image_hosts.clone(),
            rate_limit_fallback: Duration::from_millis(config.rate_limit_fallback_ms),
            calls_per_minute: config.calls_per_minute,
            ..Self::default()
        }
    }

    fn retry_delay(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.rate_limit_fallback)
            .clamp(self.min_retry, self.max_retry)
    }

    fn pacing_delay(&self) -> Duration {
        if self.pacing_max <= self.pacing_min {
            return self.pacing_min;
        }
        let min = self.pacing_min.as_millis() as u64;
        let max = self.pacing_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

// =============================================================================
// Observable Phase
// =============================================================================

/// What the coordinator is doing, as seen by a progress display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Running,
    RateLimited { retry_after_ms: u64 },
    Error { message: String },
    Done,
    Paused,
}

/// Result of one `run_step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The cursor moved. `merged` counts findings that were new.
    Advanced { merged: usize, processed: usize },
    Complete,
    /// The same batch must be retried after the delay.
    RateLimited { retry_after_ms: u64 },
    /// Another step was in flight, or the scan is paused.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Aborted,
}

/// Resets the in-flight flag however the step ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// ScanCoordinator
// =============================================================================

/// Drives the image scan one batch at a time with at most one model call in flight.
pub struct ScanCoordinator {
    items: Vec<Item>,
    model: Arc<dyn JsonCompletion>,
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn ScanStore>,
    config: ScanConfig,
    session: Mutex<ScanSession>,
    limiter: Mutex<CallRateLimiter>,
    in_flight: AtomicBool,
    control: watch::Sender<Control>,
    phase: watch::Sender<ScanPhase>,
}

impl ScanCoordinator {
    pub fn new(
        items: Vec<Item>,
        model: Arc<dyn JsonCompletion>,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ScanStore>,
        config: ScanConfig,
    ) -> Self {
        let session = ScanSession::new(&items);
        Self::with_session(items, session, model, fetcher, store, config)
    }

    /// Resume from the store's snapshot if there is one.
    pub async fn open(
        items: Vec<Item>,
        model: Arc<dyn JsonCompletion>,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ScanStore>,
        config: ScanConfig,
    ) -> Result<Self, ExposureError> {
        let session = match store.load().await? {
            Some(snapshot) => ScanSession::restore(&items, snapshot),
            None => ScanSession::new(&items),
        };
        Ok(Self::with_session(items, session, model, fetcher, store, config))
    }

    fn with_session(
        items: Vec<Item>,
        session: ScanSession,
        model: Arc<dyn JsonCompletion>,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ScanStore>,
        config: ScanConfig,
    ) -> Self {
        let limiter = CallRateLimiter::per_minute(config.calls_per_minute);
        let phase = if session.state().is_complete() {
            ScanPhase::Done
        } else {
            ScanPhase::Idle
        };
        Self {
            items,
            model,
            fetcher,
            store,
            config,
            session: Mutex::new(session),
            limiter: Mutex::new(limiter),
            in_flight: AtomicBool::new(false),
            control: watch::channel(Control::Running).0,
            phase: watch::channel(phase).0,
        }
    }

    // --- Observation ---

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase.borrow().clone()
    }

    pub fn state(&self) -> ScanState {
        self.session().state().clone()
    }

    pub fn findings(&self) -> Vec<ImageSignal> {
        self.session().findings().to_vec()
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.session().snapshot()
    }

    /// Image-only score over everything merged so far.
    pub fn scoring(&self) -> ReportScoring {
        let session = self.session();
        score_report(&self.items, &[], session.findings(), Utc::now())
    }

    // --- Control ---

    /// Stop starting new steps. A step already in flight still merges.
    pub fn pause(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Running {
                *c = Control::Paused;
                return true;
            }
            false
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Paused {
                *c = Control::Running;
                return true;
            }
            false
        });
    }

    /// Cancel any outstanding call and stop for good.
    pub fn abort(&self) {
        self.control.send_replace(Control::Aborted);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.borrow() == Control::Paused
    }

    fn is_aborted(&self) -> bool {
        *self.control.borrow() == Control::Aborted
    }

    // --- Stepping ---

    /// Process the next batch. A call while another step is outstanding, or
    /// while paused, does nothing.
    pub async fn run_step(&self) -> Result<StepOutcome, ExposureError> {
        if self.is_aborted() {
            return Err(ExposureError::Aborted);
        }
        if self.is_paused() {
            return Ok(StepOutcome::Skipped);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Scan step already in flight, skipping");
            return Ok(StepOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.in_flight);

        self.set_phase(ScanPhase::Running);
        let mut control = self.control.subscribe();
        let result = tokio::select! {
            biased;
            _ = wait_for_abort(&mut control) => Err(ExposureError::Aborted),
            result = self.step() => result,
        };

        match &result {
            Ok(StepOutcome::Complete) => self.set_phase(ScanPhase::Done),
            Ok(StepOutcome::RateLimited { retry_after_ms }) => {
                self.set_phase(ScanPhase::RateLimited {
                    retry_after_ms: *retry_after_ms,
                })
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Scan step failed, cursor unchanged");
                self.set_phase(ScanPhase::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn step(&self) -> Result<StepOutcome, ExposureError> {
        let batch = {
            let session = self.session();
            session.cursor().and_then(|cursor| {
                next_batch(
                    &self.items,
                    cursor,
                    self.config.max_images_per_call,
                    &self.config.trusted_image_hosts,
                )
            })
        };

        let Some(batch) = batch else {
            self.update(|s, items| s.mark_complete(items)).await;
            info!(scan_id = %self.session().scan_id(), "Scan complete");
            return Ok(StepOutcome::Complete);
        };

        info!(
            cursor = %batch.start,
            images = batch.images.len(),
            refused = batch.refused,
            "Scan step"
        );

        if batch.images.is_empty() {
            return Ok(self.advance(&batch, Vec::new(), None).await);
        }

        let local_wait = {
            let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
            limiter.try_acquire(tokio::time::Instant::now()).err()
        };
        if let Some(wait) = local_wait {
            debug!(wait_ms = wait.as_millis() as u64, "Local call limit reached");
            return Ok(self.rate_limited(&batch, Some(wait)).await);
        }

        let (sent, parts) = self.download(&batch).await;
        if sent.is_empty() {
            warn!(cursor = %batch.start, "No image in batch could be downloaded, moving on");
            return Ok(self.advance(&batch, Vec::new(), None).await);
        }

        let request = CompletionRequest::new(
            prompt::vision_system(),
            prompt::vision_user(&self.items, &sent),
        )
        .images(parts)
        .max_tokens(self.config.max_tokens);

        let reply = match complete_and_parse(self.model.as_ref(), request, &["findings"]).await {
            Ok(reply) => reply,
            Err(ExposureError::RateLimited { retry_after_ms }) => {
                let hint = retry_after_ms.map(Duration::from_millis);
                return Ok(self.rate_limited(&batch, hint).await);
            }
            Err(e) => return Err(e),
        };

        match reply {
            ModelReply::Parsed(parsed) => {
                let (findings, dropped) = self.decode_sent(&parsed.value, &sent);
                let warning = (dropped > 0).then(|| {
                    warn!(cursor = %batch.start, dropped, "Dropped unplaceable findings");
                    format!(
                        "dropped {dropped} findings at {} with no matching attached image",
                        batch.start
                    )
                });
                Ok(self.advance(&batch, findings, warning).await)
            }
            ModelReply::Unparseable(e) => {
                let warning = format!("images at {} unreadable: {e}", batch.start);
                warn!(cursor = %batch.start, error = %e, "Batch reply unparseable, moving on");
                self.update(|s, items| s.apply_parse_failure(items, batch.next, warning))
                    .await;
                Ok(self.progress_outcome(0))
            }
        }
    }

    /// Download every image in the batch, keeping the ones that arrived in
    /// attachment order.
    async fn download(&self, batch: &Batch) -> (Vec<ImageRef>, Vec<ImagePart>) {
        let results: Vec<(ImageRef, Result<ImagePart, ExposureError>)> =
            stream::iter(batch.images.iter().cloned())
                .map(|image| async move {
                    let referer = self
                        .items
                        .get(image.item_index)
                        .map(|it| it.url.as_str())
                        .unwrap_or("");
                    let result = self.fetcher.fetch(&image.url, referer).await;
                    (image, result)
                })
                .buffered(self.config.download_concurrency.max(1))
                .collect()
                .await;

        let mut sent = Vec::with_capacity(results.len());
        let mut parts = Vec::with_capacity(results.len());
        for (image, result) in results {
            match result {
                Ok(part) => {
                    sent.push(image);
                    parts.push(part);
                }
                Err(e) => warn!(url = image.url.as_str(), error = %e, "Image download failed"),
            }
        }
        (sent, parts)
    }

    /// Decode findings and keep only those about images that were attached.
    /// Findings that name an attached image, plus how many records were
    /// dropped. A record without an item id cannot be placed once the batch
    /// spans several items.
    fn decode_sent(
        &self,
        value: &serde_json::Value,
        sent: &[ImageRef],
    ) -> (Vec<ImageSignal>, usize) {
        let mut item_indexes: Vec<usize> = sent.iter().map(|r| r.item_index).collect();
        item_indexes.dedup();
        let batch_items: Vec<&Item> = item_indexes
            .iter()
            .filter_map(|&i| self.items.get(i))
            .collect();

        let attached: HashSet<(&str, usize)> = sent
            .iter()
            .filter_map(|r| {
                self.items
                    .get(r.item_index)
                    .map(|it| (it.id.as_str(), r.image_index))
            })
            .collect();

        let decoded = decode_image_findings(value, &batch_items);
        let total = decoded.records.len() + decoded.dropped;
        let findings: Vec<ImageSignal> = decoded
            .records
            .into_iter()
            .filter(|f| attached.contains(&(f.source_item_id.as_str(), f.image_index)))
            .collect();
        let dropped = total - findings.len();
        if dropped > 0 {
            debug!(kept = findings.len(), total, "Dropped invalid findings");
        }
        (findings, dropped)
    }

    async fn advance(
        &self,
        batch: &Batch,
        findings: Vec<ImageSignal>,
        warning: Option<String>,
    ) -> StepOutcome {
        let mut merged = 0;
        self.update(|s, items| {
            if let Some(warning) = warning {
                s.push_warning(warning);
            }
            merged = s.apply_findings(items, batch.next, findings);
        })
        .await;
        let score = self.scoring();
        info!(
            merged,
            findings = self.session().findings().len(),
            risk_score = score.risk_score,
            "Batch merged"
        );
        self.progress_outcome(merged)
    }

    async fn rate_limited(&self, batch: &Batch, hint: Option<Duration>) -> StepOutcome {
        let delay = self.config.retry_delay(hint);
        let retry_after_ms = delay.as_millis() as u64;
        warn!(cursor = %batch.start, retry_after_ms, "Rate limited, batch will be retried");
        self.update(|s, items| s.apply_rate_limited(items, batch.start))
            .await;
        StepOutcome::RateLimited { retry_after_ms }
    }

    fn progress_outcome(&self, merged: usize) -> StepOutcome {
        let state = self.state();
        if state.is_complete() {
            StepOutcome::Complete
        } else {
            StepOutcome::Advanced {
                merged,
                processed: state.processed_count,
            }
        }
    }

    // --- Loop ---

    /// Step until the scan completes, pacing between steps and backing off on
    /// rate limits. Returns early with an error on transport failure or abort.
    pub async fn run(&self) -> Result<ScanState, ExposureError> {
        let mut control = self.control.subscribe();

        loop {
            let current = *control.borrow_and_update();
            match current {
                Control::Aborted => return Err(ExposureError::Aborted),
                Control::Paused => {
                    self.set_phase(ScanPhase::Paused);
                    info!(processed = self.state().processed_count, "Scan paused");
                    if control
                        .wait_for(|c| *c != Control::Paused)
                        .await
                        .is_err()
                    {
                        return Err(ExposureError::Aborted);
                    }
                    continue;
                }
                Control::Running => {}
            }

            let delay = match self.run_step().await? {
                StepOutcome::Complete => return Ok(self.state()),
                StepOutcome::Advanced { processed, .. } => {
                    let delay = self.config.pacing_delay();
                    debug!(
                        processed,
                        total = self.state().total_count,
                        delay_ms = delay.as_millis() as u64,
                        "Pacing before next step"
                    );
                    delay
                }
                StepOutcome::RateLimited { retry_after_ms } => Duration::from_millis(retry_after_ms),
                StepOutcome::Skipped => self.config.pacing_min,
            };

            tokio::select! {
                biased;
                _ = wait_for_abort(&mut control) => return Err(ExposureError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // --- Internals ---

    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: ScanPhase) {
        self.phase.send_replace(phase);
    }

    /// Mutate the session, then persist the new snapshot. The lock is released
    /// before the store is awaited.
    async fn update(&self, f: impl FnOnce(&mut ScanSession, &[Item])) {
        let snapshot = {
            let mut session = self.session();
            f(&mut session, &self.items);
            session.snapshot()
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "Failed to persist scan snapshot");
        }
    }
}

async fn wait_for_abort(control: &mut watch::Receiver<Control>) {
    let aborted = control.wait_for(|c| *c == Control::Aborted).await.is_ok();
    if !aborted {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_uses_hint_then_fallback_and_clamps() {
        let config = ScanConfig::default();
        assert_eq!(
            config.retry_delay(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(config.retry_delay(None), Duration::from_millis(8000));
        assert_eq!(
            config.retry_delay(Some(Duration::from_millis(10))),
            Duration::from_secs(1)
        );
        assert_eq!(
            config.retry_delay(Some(Duration::from_secs(3600))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn pacing_stays_within_jitter_window() {
        let config = ScanConfig::default();
        for _ in 0..100 {
            let delay = config.pacing_delay();
            assert!(delay >= Duration::from_millis(1800));
            assert!(delay <= Duration::from_millis(2600));
        }
    }

    #[test]
    fn phase_serializes_with_tag() {
        let json = serde_json::to_value(ScanPhase::RateLimited {
            retry_after_ms: 5000,
        })
        .unwrap();
        assert_eq!(json["phase"], "rate_limited");
        assert_eq!(json["retry_after_ms"], 5000);
    }

    #[test]
    fn config_carries_env_knobs() {
        let mut config = Config::new("sk-test");
        config.max_images_per_call = 3;
        config.calls_per_minute = 0;
        config.rate_limit_fallback_ms = 2500;
        let scan = ScanConfig::from_config(&config);
        assert_eq!(scan.max_images_per_call, 3);
        assert_eq!(scan.calls_per_minute, 0);
        assert_eq!(scan.rate_limit_fallback, Duration::from_millis(2500));
    }
}
