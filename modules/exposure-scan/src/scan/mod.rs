pub mod coordinator;
pub mod cursor;
pub mod session;

pub use coordinator::{ScanConfig, ScanCoordinator, ScanPhase, StepOutcome};
pub use cursor::{absolute_progress, next_batch, total_images, Batch, ImageRef};
pub use session::{ScanSession, ScanSnapshot};
