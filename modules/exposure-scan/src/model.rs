use ai_client::{AiError, CompletionRequest, JsonCompletion};
use exposure_common::ExposureError;
use tracing::{debug, warn};

use crate::parser::{parse_tolerant, ParseError, Parsed};

/// Outcome of one upstream call whose answer should be JSON.
#[derive(Debug)]
pub enum ModelReply {
    Parsed(Parsed),
    /// The call succeeded but nothing usable came back.
    Unparseable(ParseError),
}

/// Map a vendor error onto the scan taxonomy.
///
/// Empty content is not a transport problem: the call went through and
/// returned nothing usable, which callers treat like a parse failure.
pub fn upstream_error(err: AiError) -> ExposureError {
    match err {
        AiError::RateLimited { retry_after } => ExposureError::RateLimited {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        },
        AiError::EmptyContent => ExposureError::Parse("model returned empty content".into()),
        AiError::Config(msg) => ExposureError::Config(msg),
        other => ExposureError::Transport(other.to_string()),
    }
}

/// Issue one completion and run the tolerant parser over it.
pub async fn complete_and_parse(
    model: &dyn JsonCompletion,
    request: CompletionRequest,
    salvage_keys: &[&str],
) -> Result<ModelReply, ExposureError> {
    let raw = match model.complete_json(request).await {
        Ok(raw) => raw,
        Err(AiError::EmptyContent) => return Ok(ModelReply::Unparseable(ParseError::Empty)),
        Err(e) => return Err(upstream_error(e)),
    };

    match parse_tolerant(&raw, salvage_keys) {
        Ok(parsed) => {
            debug!(model = model.model(), strategy = %parsed.strategy, "Parsed model reply");
            Ok(ModelReply::Parsed(parsed))
        }
        Err(e) => {
            warn!(model = model.model(), error = %e, "Model reply unparseable");
            Ok(ModelReply::Unparseable(e))
        }
    }
}
