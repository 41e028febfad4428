pub mod config;
pub mod error;
pub mod safety;
pub mod types;

pub use config::Config;
pub use error::ExposureError;
pub use safety::*;
pub use types::*;
