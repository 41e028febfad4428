// Trait abstractions for the scan coordinator's side effects.
//
// ImageFetcher: downloads one allow-listed image as an inline payload.
// ScanStore   : persists and restores the resumable scan snapshot.
//
// The model call itself goes through ai_client::JsonCompletion. Together these
// let the coordinator run against MockFetcher / MemoryStore / MockModel with
// no network and no disk.

use ai_client::ImagePart;
use async_trait::async_trait;
use exposure_common::ExposureError;

use crate::scan::session::ScanSnapshot;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch `url` and encode it for the model. `referer` is the owning item's URL.
    async fn fetch(&self, url: &str, referer: &str) -> Result<ImagePart, ExposureError>;
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    /// The last saved snapshot, if any.
    async fn load(&self) -> Result<Option<ScanSnapshot>, ExposureError>;

    async fn save(&self, snapshot: &ScanSnapshot) -> Result<(), ExposureError>;
}
