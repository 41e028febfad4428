pub mod error;
pub mod openai;
pub mod rate_limit;
pub mod traits;
pub mod util;

pub use error::AiError;
pub use openai::OpenAi;
pub use rate_limit::retry_after_from_headers;
pub use traits::{CompletionRequest, ImagePart, JsonCompletion};
pub use util::truncate_chars;
