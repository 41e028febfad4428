pub mod analysis;
pub mod decode;
pub mod dedup;
pub mod fetch;
pub mod graph;
pub mod model;
pub mod parser;
pub mod prompt;
pub mod rate_limit;
pub mod report;
pub mod scan;
pub mod scoring;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
