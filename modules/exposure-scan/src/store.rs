use std::path::{Path, PathBuf};

use async_trait::async_trait;
use exposure_common::ExposureError;
use tracing::debug;

use crate::scan::session::ScanSnapshot;
use crate::traits::ScanStore;

/// Snapshot persisted as pretty JSON. Writes go to a sibling temp file and are
/// renamed into place, so a crash never leaves a half-written snapshot.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn store_err(e: impl std::fmt::Display) -> ExposureError {
    ExposureError::Store(e.to_string())
}

#[async_trait]
impl ScanStore for JsonFileStore {
    async fn load(&self) -> Result<Option<ScanSnapshot>, ExposureError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };
        let snapshot = serde_json::from_str(&raw).map_err(store_err)?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &ScanSnapshot) -> Result<(), ExposureError> {
        let json = serde_json::to_string_pretty(snapshot).map_err(store_err)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await.map_err(store_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(store_err)?;
        debug!(path = %self.path.display(), processed = snapshot.state.processed_count, "Snapshot saved");
        Ok(())
    }
}
