//! The judgment seam between the search and the language model.
//!
//! The search only sees the `Judge` trait. Raw responses are reduced to a
//! JSON object (markdown fences and surrounding prose are tolerated, JSON5 is
//! accepted as a fallback), shape-checked by the caller's parser, and retried
//! with a stricter format instruction until the attempt bound is reached.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM endpoint is rate limiting requests")]
    RateLimited,
    #[error("LLM transport failed: {0}")]
    Transport(String),
    #[error("LLM response is malformed: {0}")]
    Malformed(String),
    #[error("LLM returned an empty response")]
    Empty,
}

/// What a judgment is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// First-stage ranking of a node's trial actions
    Filter,
    /// Second-stage ranking of paths across the round
    Evaluate,
    /// Confirmation that a path reproduced the bug
    Validate,
    /// Text for an input field
    Input,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::Filter => "filter",
            Purpose::Evaluate => "evaluate",
            Purpose::Validate => "validate",
            Purpose::Input => "input",
        })
    }
}

/// An image sent alongside the prompt
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub purpose: Purpose,
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
}

impl JudgeRequest {
    pub fn new(purpose: Purpose, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            prompt: prompt.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.images.push(image);
        self
    }
}

/// A source of judgments; shared by reference across the judgment threads
pub trait Judge: Send + Sync {
    fn judge(&self, request: &JudgeRequest) -> LlmResult<String>;
}

/// Bounded retry for one judgment
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Pause before retrying a rate-limited call, multiplied by the attempt number
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_LLM_MAX_ATTEMPTS,
            rate_limit_backoff: Duration::from_millis(crate::config::DEFAULT_RATE_LIMIT_BACKOFF_MS),
        }
    }
}

/// One call of a judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: usize,
    /// Whether the stricter format instruction was appended
    pub strict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a judgment: the validated value, if any attempt produced one
#[derive(Debug, Clone)]
pub struct Judgment<V> {
    pub value: Option<V>,
    pub attempts: Vec<Attempt>,
}

/// Strip a surrounding markdown code fence
pub fn strip_markdown_code_fence(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    let mut lines = trimmed.lines();
    lines.next()?;
    let mut body = lines.collect::<Vec<_>>();
    if body.last().map(|line| line.trim()) != Some("```") {
        return None;
    }
    body.pop();
    Some(body.join("\n"))
}

fn parse_relaxed_json_value(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(value),
        Err(primary_error) => match json5::from_str::<Value>(raw) {
            Ok(value) => Ok(value),
            Err(_) => Err(primary_error.to_string()),
        },
    }
}

/// Extract the JSON object a model answered with.
///
/// Tries the whole text, the body of a code fence, and the outermost
/// `{...}` span, in that order.
pub fn extract_json_object(raw: &str) -> LlmResult<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LlmError::Empty);
    }

    let mut candidates = vec![trimmed.to_string()];
    if let Some(body) = strip_markdown_code_fence(trimmed) {
        candidates.push(body.trim().to_string());
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    let mut last_error = String::from("no JSON object found");
    for candidate in candidates {
        match parse_relaxed_json_value(&candidate) {
            Ok(value @ Value::Object(_)) => return Ok(value),
            Ok(_) => last_error = "response is not a JSON object".to_string(),
            Err(e) => last_error = e,
        }
    }
    Err(LlmError::Malformed(last_error))
}

/// Read a list of non-negative integers, accepting numeric strings
pub fn index_list(value: &Value, field: &str) -> Result<Vec<usize>, String> {
    let Some(items) = value.get(field) else {
        return Ok(Vec::new());
    };
    let items = items
        .as_array()
        .ok_or_else(|| format!("\"{}\" must be an array", field))?;
    items
        .iter()
        .map(|item| match item {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().trim_start_matches(['#', 'P', 'p']).parse().ok(),
            _ => None,
        })
        .map(|n| n.ok_or_else(|| format!("\"{}\" contains a non-index value", field)))
        .collect()
}

/// Read a yes/no flag, accepting `true`, `"yes"` and `"true"`
pub fn flag(value: &Value, field: &str) -> Result<bool, String> {
    match value.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" => Ok(false),
            other => Err(format!("\"{}\" is not a yes/no value: {}", field, other)),
        },
        _ => Err(format!("missing boolean field \"{}\"", field)),
    }
}

/// Run one judgment with bounded retry.
///
/// `parse` validates the extracted object against the caller's schema.
/// Every failed attempt (transport error, malformed or invalid output)
/// moves on to the next attempt with `strict_suffix` appended.
pub fn judge_with_retry<V, F>(
    judge: &dyn Judge,
    request: &JudgeRequest,
    policy: &RetryPolicy,
    strict_suffix: &str,
    parse: F,
) -> Judgment<V>
where
    F: Fn(&Value) -> Result<V, String>,
{
    let mut attempts = Vec::new();
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let strict = attempt > 1;
        let call = if strict {
            let mut stricter = request.clone();
            stricter.prompt = format!("{}\n\n{}", request.prompt, strict_suffix);
            judge.judge(&stricter)
        } else {
            judge.judge(request)
        };

        let (raw, result) = match call {
            Ok(raw) => {
                let parsed = extract_json_object(&raw)
                    .map_err(|e| e.to_string())
                    .and_then(|value| parse(&value));
                (Some(raw), parsed)
            }
            Err(e) => {
                if e == LlmError::RateLimited && attempt < max_attempts {
                    thread::sleep(policy.rate_limit_backoff * attempt as u32);
                }
                (None, Err(e.to_string()))
            }
        };

        match result {
            Ok(value) => {
                debug!(purpose = %request.purpose, attempt, "judgment accepted");
                attempts.push(Attempt { attempt, strict, raw, error: None });
                return Judgment {
                    value: Some(value),
                    attempts,
                };
            }
            Err(error) => {
                warn!(purpose = %request.purpose, attempt, max_attempts, %error, "judgment attempt rejected");
                attempts.push(Attempt {
                    attempt,
                    strict,
                    raw,
                    error: Some(error),
                });
            }
        }
    }

    Judgment { value: None, attempts }
}

/// Run many judgments with at most `concurrency` calls in flight.
///
/// `parse` receives the request's index so each response can be checked
/// against its own candidate set. Results come back in request order, after
/// every batch has joined.
pub fn judge_all<V, F>(
    judge: &dyn Judge,
    requests: &[JudgeRequest],
    policy: &RetryPolicy,
    strict_suffix: &str,
    concurrency: usize,
    parse: F,
) -> Vec<Judgment<V>>
where
    V: Send,
    F: Fn(usize, &Value) -> Result<V, String> + Sync,
{
    let batch_size = concurrency.max(1);
    let mut results = Vec::with_capacity(requests.len());
    for (batch_index, batch) in requests.chunks(batch_size).enumerate() {
        let joined: Vec<Judgment<V>> = thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(offset, request)| {
                    let parse = &parse;
                    let index = batch_index * batch_size + offset;
                    scope.spawn(move || {
                        judge_with_retry(judge, request, policy, strict_suffix, |value: &Value| parse(index, value))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| Judgment {
                        value: None,
                        attempts: vec![Attempt {
                            attempt: 1,
                            strict: false,
                            raw: None,
                            error: Some("judgment thread panicked".to_string()),
                        }],
                    })
                })
                .collect()
        });
        results.extend(joined);
    }
    results
}
