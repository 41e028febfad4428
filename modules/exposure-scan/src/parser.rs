// Tolerant JSON recovery for model output.
//
// Models are asked for strict JSON and routinely return something close to it:
// fenced, commented, with trailing commas, wrapped in prose, or cut off at the
// token limit. `parse_tolerant` escalates through four strategies and stops at
// the first that yields a value:
//
//   1. Direct       : serde_json on the trimmed text.
//   2. Normalized   : fences, comments, trailing commas stripped; `}{` → `},{`.
//   3. BracketSlice : first `{` .. last `}` of the normalized text, then 1–2.
//   4. Salvage      : walk a known top-level array and keep every element that
//                      parses on its own. Tolerates a missing closing `]`.
//
// Comment stripping is regex-based and not string-aware: a `/* */` pair inside
// a JSON string value will be eaten. Full-line `//` comments only.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*```(?:json)?\s*").unwrap());
static FENCE_CLOSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*```\s*$").unwrap());
static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*//.*$").unwrap());
static BLOCK_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());
static ADJACENT_OBJECTS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\}\s*\{").unwrap());

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("model returned empty content")]
    Empty,
    #[error("model output is not recoverable JSON ({len} chars)")]
    Unparseable { len: usize },
}

/// Which strategy produced the value. Logged per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    Normalized,
    BracketSlice,
    /// Only part of the named array was recovered.
    Salvage,
}

impl std::fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseStrategy::Direct => write!(f, "direct"),
            ParseStrategy::Normalized => write!(f, "normalized"),
            ParseStrategy::BracketSlice => write!(f, "bracket_slice"),
            ParseStrategy::Salvage => write!(f, "salvage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub value: Value,
    pub strategy: ParseStrategy,
}

/// Recover a JSON value from model output.
///
/// `salvage_keys` names the top-level arrays worth rescuing element by element
/// (e.g. `["findings"]`). The first key that yields at least one element wins.
pub fn parse_tolerant(text: &str, salvage_keys: &[&str]) -> Result<Parsed, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(Parsed {
            value,
            strategy: ParseStrategy::Direct,
        });
    }

    let normalized = normalize(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(&normalized) {
        return Ok(Parsed {
            value,
            strategy: ParseStrategy::Normalized,
        });
    }

    if let Some(slice) = bracket_slice(&normalized) {
        if let Some(value) = parse_direct_or_normalized(slice) {
            return Ok(Parsed {
                value,
                strategy: ParseStrategy::BracketSlice,
            });
        }
    }

    for key in salvage_keys {
        if let Some(value) = salvage_array(&normalized, key) {
            return Ok(Parsed {
                value,
                strategy: ParseStrategy::Salvage,
            });
        }
    }

    Err(ParseError::Unparseable {
        len: trimmed.chars().count(),
    })
}

/// Strip fences and comments, drop trailing commas, separate adjacent objects.
pub fn normalize(text: &str) -> String {
    let s = FENCE_OPEN_RE.replace(text, "");
    let s = FENCE_CLOSE_RE.replace(&s, "");
    let s = LINE_COMMENT_RE.replace_all(&s, "");
    let s = BLOCK_COMMENT_RE.replace_all(&s, "");
    let s = TRAILING_COMMA_RE.replace_all(&s, "$1");
    let s = ADJACENT_OBJECTS_RE.replace_all(&s, "},{");
    s.trim().to_string()
}

fn parse_direct_or_normalized(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim())
        .ok()
        .or_else(|| serde_json::from_str(&normalize(text)).ok())
}

fn bracket_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Rescue the elements of `"key": [ ... ]` one object at a time.
///
/// Returns `{ key: [parsed elements] }`, or `None` when nothing parsed.
fn salvage_array(text: &str, key: &str) -> Option<Value> {
    let needle = format!("\"{key}\"");
    let key_pos = text.find(&needle)?;
    let after_key = key_pos + needle.len();
    let open = after_key + text[after_key..].find('[')?;

    let elements: Vec<Value> = object_chunks(&text[open + 1..])
        .into_iter()
        .filter_map(parse_direct_or_normalized)
        .collect();

    if elements.is_empty() {
        return None;
    }

    let mut out = serde_json::Map::new();
    out.insert(key.to_string(), Value::Array(elements));
    Some(Value::Object(out))
}

/// Split the body of an array into top-level `{...}` chunks.
///
/// String-and-escape aware: braces inside quoted strings don't count. Stops
/// at the array's closing `]`, or at end of input if it was truncated.
/// A trailing unbalanced object is discarded.
fn object_chunks(body: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        chunks.push(&body[s..=i]);
                    }
                }
            }
            ']' if depth == 0 => break,
            _ => {}
        }
    }

    chunks
}
