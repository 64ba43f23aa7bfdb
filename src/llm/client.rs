//! OpenAI-compatible chat completions client.
//!
//! Provides robust API communication with:
//! - Streaming responses (activity-based timeout instead of a total timeout)
//! - Non-streaming fallback with HTTP status handling (429 maps to rate limiting)
//! - Image attachments sent as data URLs
//! - Token usage accounting per purpose
//! - Connection health checks
//!
//! Requests are sent through `curl`; the request body is written to its
//! stdin so large screenshots never hit argument length limits.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::judge::{Judge, JudgeRequest, LlmError, LlmResult, Purpose};
use crate::config;

/// curl exit code for an operation timeout
const CURL_TIMEOUT_EXIT: i32 = 28;
/// Marker separating the body from the status code in non-streaming output
const STATUS_MARKER: &str = "\n__HTTP_STATUS__:";

/// Configuration for the chat client
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Timeout for the initial connection (seconds)
    pub connect_timeout: u64,
    /// Inactivity timeout when streaming, total timeout otherwise (seconds)
    pub timeout: u64,
    pub stream: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        let cfg = &config::get().llm;
        Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            max_tokens: cfg.max_tokens,
            connect_timeout: cfg.connect_timeout,
            timeout: cfg.timeout,
            stream: cfg.stream,
        }
    }
}

impl ChatConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Token counters for one purpose
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Token accounting for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub total: UsageCounter,
    pub by_purpose: BTreeMap<String, UsageCounter>,
}

impl TokenUsage {
    fn add(&mut self, purpose: Purpose, usage: &Value) {
        let read = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
        let (prompt, completion) = (read("prompt_tokens"), read("completion_tokens"));
        for counter in [&mut self.total, self.by_purpose.entry(purpose.to_string()).or_default()] {
            counter.calls += 1;
            counter.prompt_tokens += prompt;
            counter.completion_tokens += completion;
        }
    }
}

pub struct ChatClient {
    config: ChatConfig,
    usage: Mutex<TokenUsage>,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        let usage = TokenUsage {
            model: config.model.clone(),
            ..Default::default()
        };
        Self {
            config,
            usage: Mutex::new(usage),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Snapshot of the token usage so far
    pub fn usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn record_usage(&self, purpose: Purpose, usage: &Value) {
        if let Ok(mut total) = self.usage.lock() {
            total.add(purpose, usage);
        }
    }

    fn request_body(&self, request: &JudgeRequest, stream: bool) -> Value {
        let mut content: Vec<Value> = request
            .images
            .iter()
            .map(|img| {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&img.data);
                serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", img.mime, encoded) }
                })
            })
            .collect();
        content.push(serde_json::json!({ "type": "text", "text": request.prompt }));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": self.config.max_tokens,
            "temperature": 0,
        });
        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    fn curl(&self, extra: &[&str]) -> Command {
        let mut cmd = Command::new("curl");
        cmd.args(["-s", "-X", "POST", &self.config.endpoint])
            .args(["-H", "Content-Type: application/json"])
            .args(["--connect-timeout", &self.config.connect_timeout.to_string()])
            .args(["--data-binary", "@-"])
            .args(extra);
        if let Some(key) = &self.config.api_key {
            cmd.args(["-H", &format!("Authorization: Bearer {}", key)]);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// Streaming completion with an inactivity timeout
    fn complete_streaming(&self, request: &JudgeRequest) -> LlmResult<String> {
        let body = serde_json::to_vec(&self.request_body(request, true))
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let mut child = self
            .curl(&["-N"])
            .spawn()
            .map_err(|e| LlmError::Transport(format!("failed to start curl: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).map_err(|e| LlmError::Transport(e.to_string()))?;
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::Transport("Failed to capture stdout".to_string()))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        });

        let activity_timeout = Duration::from_secs(self.config.timeout);
        let mut content = String::new();
        let mut other_lines = String::new();
        let mut last_activity = Instant::now();

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(line)) => {
                    last_activity = Instant::now();
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        other_lines.push_str(&line);
                        continue;
                    };
                    if data == "[DONE]" {
                        break;
                    }
                    if let Ok(json) = serde_json::from_str::<Value>(data) {
                        if let Some(delta) = json["choices"][0]["delta"]["content"].as_str() {
                            content.push_str(delta);
                        }
                        if json["usage"].is_object() {
                            self.record_usage(request.purpose, &json["usage"]);
                        }
                    }
                }
                Ok(Err(e)) => return Err(LlmError::Transport(e.to_string())),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() > activity_timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(LlmError::Timeout(activity_timeout));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait().map_err(|e| LlmError::Transport(e.to_string()))?;
        if content.is_empty() {
            if status.code() == Some(CURL_TIMEOUT_EXIT) {
                return Err(LlmError::Timeout(Duration::from_secs(self.config.connect_timeout)));
            }
            if other_lines.contains("rate limit") || other_lines.contains("\"code\":429") {
                return Err(LlmError::RateLimited);
            }
            // Endpoint ignored `stream`; ask again without it
            debug!("streaming produced no content, retrying without streaming");
            return self.complete_blocking(request);
        }
        Ok(content)
    }

    /// Non-streaming completion bounded by the total timeout
    fn complete_blocking(&self, request: &JudgeRequest) -> LlmResult<String> {
        let body = serde_json::to_vec(&self.request_body(request, false))
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let write_out = format!("{}%{{http_code}}", STATUS_MARKER);

        let mut child = self
            .curl(&["--max-time", &self.config.timeout.to_string(), "-w", &write_out])
            .spawn()
            .map_err(|e| LlmError::Transport(format!("failed to start curl: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).map_err(|e| LlmError::Transport(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if output.status.code() == Some(CURL_TIMEOUT_EXIT) {
            return Err(LlmError::Timeout(Duration::from_secs(self.config.timeout)));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let (body, status) = text
            .rsplit_once(STATUS_MARKER)
            .map(|(b, s)| (b, s.trim().parse::<u16>().unwrap_or(0)))
            .unwrap_or((text.as_ref(), 0));

        match status {
            0 => {
                return Err(LlmError::Transport(format!(
                    "no HTTP response: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            429 => return Err(LlmError::RateLimited),
            200..=299 => {}
            code => {
                let excerpt: String = body.chars().take(200).collect();
                return Err(LlmError::Transport(format!("HTTP {}: {}", code, excerpt)));
            }
        }

        let response: Value =
            serde_json::from_str(body).map_err(|e| LlmError::Malformed(format!("response body: {}", e)))?;
        if response["usage"].is_object() {
            self.record_usage(request.purpose, &response["usage"]);
        }
        let content = response["choices"][0]["message"]["content"].as_str().unwrap_or("");
        if content.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(content.to_string())
    }
}

impl Judge for ChatClient {
    fn judge(&self, request: &JudgeRequest) -> LlmResult<String> {
        let started = Instant::now();
        let result = if self.config.stream {
            self.complete_streaming(request)
        } else {
            self.complete_blocking(request)
        };
        match &result {
            Ok(text) => debug!(purpose = %request.purpose, chars = text.len(), elapsed_ms = started.elapsed().as_millis() as u64, "LLM call finished"),
            Err(e) => warn!(purpose = %request.purpose, error = %e, "LLM call failed"),
        }
        result
    }
}

/// Check if an endpoint is reachable (connection-only check).
///
/// Any HTTP status means the server is up; `000` means the connection failed.
pub fn check_health(endpoint: &str, timeout_secs: u64) -> LlmResult<bool> {
    let url = endpoint.trim_start_matches("http://").trim_start_matches("https://");
    let host_port = url.split('/').next().unwrap_or("127.0.0.1:8080");
    let scheme = if endpoint.starts_with("https://") { "https" } else { "http" };

    let output = Command::new("curl")
        .args([
            "-s",
            "-o",
            "/dev/null",
            "-w",
            "%{http_code}",
            "--connect-timeout",
            &timeout_secs.to_string(),
            "--max-time",
            &timeout_secs.to_string(),
            "-I",
            &format!("{}://{}", scheme, host_port),
        ])
        .output()
        .map_err(|e| LlmError::Transport(format!("failed to start curl: {}", e)))?;

    let code: u16 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0);
    Ok(code > 0)
}
