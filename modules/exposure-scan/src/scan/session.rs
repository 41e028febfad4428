use chrono::{DateTime, Utc};
use exposure_common::{ImageSignal, Item, ScanCursor, ScanState, ScanStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::cursor::{absolute_progress, normalize, total_images};
use crate::dedup::merge_signals;

/// Only the most recent warnings are kept.
pub const MAX_WARNINGS: usize = 10;

/// Everything needed to resume a scan, as plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub scan_id: Uuid,
    pub state: ScanState,
    #[serde(default)]
    pub findings: Vec<ImageSignal>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ScanSnapshot {
    pub fn new(state: ScanState) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            state,
            findings: Vec::new(),
            warnings: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Accumulated scan progress over one fixed list of items.
///
/// All mutation goes through the `apply_*` methods, each of which leaves the
/// state consistent with the cursor.
#[derive(Debug, Clone)]
pub struct ScanSession {
    snapshot: ScanSnapshot,
}

impl ScanSession {
    pub fn new(items: &[Item]) -> Self {
        let total = total_images(items);
        let state = match normalize(items, ScanCursor::START) {
            Some(_) => ScanState::pending(total),
            None => ScanState::complete(total),
        };
        Self {
            snapshot: ScanSnapshot::new(state),
        }
    }

    /// Resume from a saved snapshot. A snapshot taken over a different set of
    /// images cannot be trusted and starts a fresh session instead.
    pub fn restore(items: &[Item], snapshot: ScanSnapshot) -> Self {
        let total = total_images(items);
        if snapshot.state.total_count != total {
            warn!(
                saved_total = snapshot.state.total_count,
                total, "Snapshot does not match items, starting a fresh scan"
            );
            return Self::new(items);
        }

        let mut session = Self { snapshot };
        if !session.snapshot.state.is_complete() {
            let saved = session.snapshot.state.cursor;
            let cursor = saved.and_then(|c| normalize(items, c));
            if cursor.is_none() || cursor != saved {
                session.set_cursor(items, cursor);
            } else {
                session.snapshot.state.processed_count = absolute_progress(items, cursor);
            }
        }
        info!(
            scan_id = %session.snapshot.scan_id,
            processed = session.snapshot.state.processed_count,
            total,
            findings = session.snapshot.findings.len(),
            "Resumed scan"
        );
        session
    }

    pub fn scan_id(&self) -> Uuid {
        self.snapshot.scan_id
    }

    pub fn state(&self) -> &ScanState {
        &self.snapshot.state
    }

    pub fn cursor(&self) -> Option<ScanCursor> {
        self.snapshot.state.cursor
    }

    pub fn findings(&self) -> &[ImageSignal] {
        &self.snapshot.findings
    }

    pub fn warnings(&self) -> &[String] {
        &self.snapshot.warnings
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.snapshot.clone()
    }

    /// Merge a batch's findings and move past it. Returns how many were new.
    pub fn apply_findings(
        &mut self,
        items: &[Item],
        next: Option<ScanCursor>,
        findings: Vec<ImageSignal>,
    ) -> usize {
        let merged = merge_signals(&mut self.snapshot.findings, findings);
        self.set_cursor(items, next);
        merged
    }

    /// The batch was spent on an answer nobody could read. Move on anyway.
    pub fn apply_parse_failure(
        &mut self,
        items: &[Item],
        next: Option<ScanCursor>,
        warning: impl Into<String>,
    ) {
        self.push_warning(warning);
        self.set_cursor(items, next);
    }

    /// Keep the pre-batch cursor so the same batch is retried.
    pub fn apply_rate_limited(&mut self, items: &[Item], start: ScanCursor) {
        self.set_cursor(items, Some(start));
    }

    pub fn mark_complete(&mut self, items: &[Item]) {
        self.set_cursor(items, None);
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warnings = &mut self.snapshot.warnings;
        warnings.push(warning.into());
        if warnings.len() > MAX_WARNINGS {
            let excess = warnings.len() - MAX_WARNINGS;
            warnings.drain(..excess);
        }
        self.snapshot.updated_at = Utc::now();
    }

    fn set_cursor(&mut self, items: &[Item], cursor: Option<ScanCursor>) {
        let state = &mut self.snapshot.state;
        state.cursor = cursor;
        state.processed_count = absolute_progress(items, cursor);
        state.status = match cursor {
            None => ScanStatus::Complete,
            Some(_) => ScanStatus::Partial,
        };
        self.snapshot.updated_at = Utc::now();
    }
}
