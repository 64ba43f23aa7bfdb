//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for droid-repro, supporting:
//! - Environment variables for every collaborator setting (LLM, device, output)
//! - Defaults matching the values the explorer was tuned with
//! - Validation of the search parameters before a run starts
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DROID_REPRO_LLM_ENDPOINT` | Chat completions endpoint URL | `http://127.0.0.1:8080/v1/chat/completions` |
//! | `DROID_REPRO_LLM_MODEL` | Model name | `gpt-4o` |
//! | `DROID_REPRO_LLM_API_KEY` | Bearer token for the endpoint | unset |
//! | `DROID_REPRO_LLM_MAX_TOKENS` | Maximum tokens in a response | `1024` |
//! | `DROID_REPRO_LLM_TIMEOUT` | Activity/total timeout per call (seconds) | `90` |
//! | `DROID_REPRO_LLM_CONNECT_TIMEOUT` | Connection timeout (seconds) | `10` |
//! | `DROID_REPRO_LLM_STREAM` | Use streaming responses (`true`/`false`) | `false` |
//! | `DROID_REPRO_RESULT_DIR` | Base directory for run records | `working/result` |
//! | `DROID_REPRO_BUGS_DIR` | Directory holding `<bug-id>.json` reports | `bugs` |
//! | `DROID_REPRO_ADB` | Path to the `adb` binary | `adb` |
//! | `DROID_REPRO_SERIAL` | Emulator serial | `emulator-5554` |
//! | `DROID_REPRO_ACTION_DELAY_MS` | Settle delay after each action (ms) | `2000` |
//! | `DROID_REPRO_DEVICE_TIMEOUT` | Timeout per device command (seconds) | `30` |
//!
//! # Example
//!
//! ```bash
//! export DROID_REPRO_LLM_ENDPOINT="https://api.openai.com/v1/chat/completions"
//! export DROID_REPRO_LLM_API_KEY="sk-..."
//! export DROID_REPRO_SERIAL="emulator-5556"
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::explore::action::GlobalAction;
use crate::llm::RetryPolicy;

// ============================================================================
// Default Values
// ============================================================================

/// Default chat completions endpoint
pub const DEFAULT_LLM_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";

/// Default model name
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o";

/// Default max tokens for LLM responses
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 1024;

/// Default LLM connection timeout (seconds)
pub const DEFAULT_LLM_CONNECT_TIMEOUT: u64 = 10;

/// Default LLM activity/total timeout (seconds)
pub const DEFAULT_LLM_TIMEOUT: u64 = 90;

/// Default base directory for run records
pub const DEFAULT_RESULT_DIR: &str = "working/result";

/// Default directory for bug report files
pub const DEFAULT_BUGS_DIR: &str = "bugs";

/// Default adb binary
pub const DEFAULT_ADB: &str = "adb";

/// Default emulator serial
pub const DEFAULT_SERIAL: &str = "emulator-5554";

/// Default settle delay after an action (milliseconds)
pub const DEFAULT_ACTION_DELAY_MS: u64 = 2000;

/// Default timeout for a single device command (seconds)
pub const DEFAULT_DEVICE_TIMEOUT: u64 = 30;

/// Default round budget
pub const DEFAULT_MAX_STEP: usize = 20;

/// Default committed-action budget
pub const DEFAULT_MAX_TRANSITION: usize = 100;

/// Default wall-clock budget (minutes)
pub const DEFAULT_MAX_MINUTES: u64 = 120;

/// Default first-stage width
pub const DEFAULT_THRESHOLD_A: usize = 6;

/// Default second-stage width
pub const DEFAULT_THRESHOLD_K: usize = 3;

/// Default attempts per LLM judgment before falling back
pub const DEFAULT_LLM_MAX_ATTEMPTS: usize = 3;

/// Default number of LLM calls in flight during a judgment phase
pub const DEFAULT_LLM_CONCURRENCY: usize = 4;

/// Default pause before retrying a rate-limited LLM call (milliseconds)
pub const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 2000;

/// Default similarity required after a snapshot restore
pub const DEFAULT_RESTORE_TOLERANCE: f64 = 0.9;

/// Default restore attempts before a node is abandoned
pub const DEFAULT_RESTORE_ATTEMPTS: usize = 2;

/// Text typed into editable fields when no better value is available
pub const DEFAULT_INPUT_TEXT: &str = "test";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_LLM_ENDPOINT: &str = "DROID_REPRO_LLM_ENDPOINT";
pub const ENV_LLM_MODEL: &str = "DROID_REPRO_LLM_MODEL";
pub const ENV_LLM_API_KEY: &str = "DROID_REPRO_LLM_API_KEY";
pub const ENV_LLM_MAX_TOKENS: &str = "DROID_REPRO_LLM_MAX_TOKENS";
pub const ENV_LLM_TIMEOUT: &str = "DROID_REPRO_LLM_TIMEOUT";
pub const ENV_LLM_CONNECT_TIMEOUT: &str = "DROID_REPRO_LLM_CONNECT_TIMEOUT";
pub const ENV_LLM_STREAM: &str = "DROID_REPRO_LLM_STREAM";
pub const ENV_RESULT_DIR: &str = "DROID_REPRO_RESULT_DIR";
pub const ENV_BUGS_DIR: &str = "DROID_REPRO_BUGS_DIR";
pub const ENV_ADB: &str = "DROID_REPRO_ADB";
pub const ENV_SERIAL: &str = "DROID_REPRO_SERIAL";
pub const ENV_ACTION_DELAY_MS: &str = "DROID_REPRO_ACTION_DELAY_MS";
pub const ENV_DEVICE_TIMEOUT: &str = "DROID_REPRO_DEVICE_TIMEOUT";

/// Legacy key accepted for the API token
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for droid-repro
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmSettings,
    pub device: DeviceSettings,
    pub output: OutputSettings,
}

/// LLM endpoint settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Activity timeout when streaming, total timeout otherwise (seconds)
    pub timeout: u64,
    pub stream: bool,
}

/// Emulator access settings
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub adb: String,
    pub serial: String,
    pub action_delay_ms: u64,
    pub command_timeout: u64,
}

/// Where runs are written and bug reports are read from
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub result_dir: PathBuf,
    pub bugs_dir: PathBuf,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            llm: LlmSettings::from_env(),
            device: DeviceSettings::from_env(),
            output: OutputSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            llm: LlmSettings::defaults(),
            device: DeviceSettings::defaults(),
            output: OutputSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl LlmSettings {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_LLM_ENDPOINT).unwrap_or_else(|_| DEFAULT_LLM_ENDPOINT.to_string()),
            model: env::var(ENV_LLM_MODEL).unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            api_key: env::var(ENV_LLM_API_KEY)
                .or_else(|_| env::var(ENV_OPENAI_API_KEY))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            max_tokens: env_parse(ENV_LLM_MAX_TOKENS, DEFAULT_LLM_MAX_TOKENS),
            connect_timeout: env_parse(ENV_LLM_CONNECT_TIMEOUT, DEFAULT_LLM_CONNECT_TIMEOUT),
            timeout: env_parse(ENV_LLM_TIMEOUT, DEFAULT_LLM_TIMEOUT),
            stream: env_parse(ENV_LLM_STREAM, false),
        }
    }

    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key: None,
            max_tokens: DEFAULT_LLM_MAX_TOKENS,
            connect_timeout: DEFAULT_LLM_CONNECT_TIMEOUT,
            timeout: DEFAULT_LLM_TIMEOUT,
            stream: false,
        }
    }
}

impl DeviceSettings {
    pub fn from_env() -> Self {
        Self {
            adb: env::var(ENV_ADB).unwrap_or_else(|_| DEFAULT_ADB.to_string()),
            serial: env::var(ENV_SERIAL).unwrap_or_else(|_| DEFAULT_SERIAL.to_string()),
            action_delay_ms: env_parse(ENV_ACTION_DELAY_MS, DEFAULT_ACTION_DELAY_MS),
            command_timeout: env_parse(ENV_DEVICE_TIMEOUT, DEFAULT_DEVICE_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            adb: DEFAULT_ADB.to_string(),
            serial: DEFAULT_SERIAL.to_string(),
            action_delay_ms: DEFAULT_ACTION_DELAY_MS,
            command_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }
}

impl OutputSettings {
    pub fn from_env() -> Self {
        Self {
            result_dir: env::var(ENV_RESULT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_RESULT_DIR)),
            bugs_dir: env::var(ENV_BUGS_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_BUGS_DIR)),
        }
    }

    pub fn defaults() -> Self {
        Self {
            result_dir: PathBuf::from(DEFAULT_RESULT_DIR),
            bugs_dir: PathBuf::from(DEFAULT_BUGS_DIR),
        }
    }
}

// ============================================================================
// Exploration parameters
// ============================================================================

/// Errors raised while validating run parameters
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be at least 1 (got {value})")]
    ZeroThreshold { name: &'static str, value: usize },
    #[error("{0} budget must be greater than zero")]
    ZeroBudget(&'static str),
    #[error("restore tolerance must be within 0.0..=1.0 (got {0})")]
    Tolerance(f64),
    #[error("unknown global action '{0}'")]
    UnknownGlobalAction(String),
    #[error("failed to read prompt template {path}: {source}")]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How deterministic fallbacks order candidates that the LLM could not rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep enumeration / creation order
    #[default]
    EnumerationOrder,
    /// Larger screenshot change first, enumeration order among equals
    LargestScreenDelta,
}

impl std::str::FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "enumeration_order" | "enumeration" | "order" => Ok(Self::EnumerationOrder),
            "largest_screen_delta" | "delta" => Ok(Self::LargestScreenDelta),
            other => Err(format!("unknown tie-break policy '{}'", other)),
        }
    }
}

/// Parameters of a single exploration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploreConfig {
    /// Round budget
    pub max_step: usize,
    /// Committed-action budget
    pub max_transition: usize,
    /// Wall-clock budget
    #[serde(with = "duration_secs")]
    pub max_duration: Option<Duration>,
    /// First-stage width: children kept per node
    pub threshold_a: usize,
    /// Second-stage width: frontier size
    pub threshold_k: usize,
    /// Extra actions enumerated on every screen, in order
    pub global_actions: Vec<GlobalAction>,
    pub tie_break: TieBreak,
    /// Attempts per judgment before the deterministic fallback is used
    pub llm_max_attempts: usize,
    /// LLM calls in flight during a judgment phase
    pub llm_concurrency: usize,
    /// Pause before retrying a rate-limited call, scaled by the attempt number
    pub rate_limit_backoff_ms: u64,
    /// Minimum similarity between a restored state and its recording
    pub restore_tolerance: f64,
    pub restore_attempts: usize,
    /// Text used when no value could be synthesized for an input field
    pub default_input_text: String,
    /// Packages whose elements are never enumerated
    pub ignored_packages: Vec<String>,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            max_step: DEFAULT_MAX_STEP,
            max_transition: DEFAULT_MAX_TRANSITION,
            max_duration: Some(Duration::from_secs(DEFAULT_MAX_MINUTES * 60)),
            threshold_a: DEFAULT_THRESHOLD_A,
            threshold_k: DEFAULT_THRESHOLD_K,
            global_actions: vec![GlobalAction::Back],
            tie_break: TieBreak::default(),
            llm_max_attempts: DEFAULT_LLM_MAX_ATTEMPTS,
            llm_concurrency: DEFAULT_LLM_CONCURRENCY,
            rate_limit_backoff_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
            restore_tolerance: DEFAULT_RESTORE_TOLERANCE,
            restore_attempts: DEFAULT_RESTORE_ATTEMPTS,
            default_input_text: DEFAULT_INPUT_TEXT.to_string(),
            ignored_packages: vec![
                "com.android.systemui".to_string(),
                "com.github.uiautomator".to_string(),
            ],
        }
    }
}

impl ExploreConfig {
    /// Reject parameter combinations the search cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold_a == 0 {
            return Err(ConfigError::ZeroThreshold { name: "threshold_a", value: 0 });
        }
        if self.threshold_k == 0 {
            return Err(ConfigError::ZeroThreshold { name: "threshold_k", value: 0 });
        }
        if self.max_step == 0 {
            return Err(ConfigError::ZeroBudget("max_step"));
        }
        if self.max_transition == 0 {
            return Err(ConfigError::ZeroBudget("max_transition"));
        }
        if self.llm_max_attempts == 0 {
            return Err(ConfigError::ZeroBudget("llm_max_attempts"));
        }
        if !(0.0..=1.0).contains(&self.restore_tolerance) {
            return Err(ConfigError::Tolerance(self.restore_tolerance));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.llm_max_attempts,
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
        }
    }
}

/// Parse a comma-separated global action list (e.g. "back,enter,swipe-up")
pub fn parse_global_actions(list: &str) -> Result<Vec<GlobalAction>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| ConfigError::UnknownGlobalAction(s.to_string())))
        .collect()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Get the result directory (convenience function)
pub fn result_dir() -> PathBuf {
    get().output.result_dir.clone()
}

/// Get the bug report directory (convenience function)
pub fn bugs_dir() -> PathBuf {
    get().output.bugs_dir.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.llm.endpoint, DEFAULT_LLM_ENDPOINT);
        assert_eq!(config.llm.model, DEFAULT_LLM_MODEL);
        assert_eq!(config.device.serial, DEFAULT_SERIAL);
        assert_eq!(config.output.result_dir, PathBuf::from(DEFAULT_RESULT_DIR));
    }

    #[test]
    fn test_explore_config_rejects_zero_thresholds() {
        let config = ExploreConfig { threshold_a: 0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroThreshold { name: "threshold_a", .. })
        ));

        let config = ExploreConfig { threshold_k: 0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroThreshold { name: "threshold_k", .. })
        ));

        assert!(ExploreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_global_actions() {
        let actions = parse_global_actions("back, enter,swipe-up,rotate-landscape").unwrap();
        assert_eq!(
            actions,
            vec![
                GlobalAction::Back,
                GlobalAction::Enter,
                GlobalAction::Swipe(crate::explore::action::Direction::Up),
                GlobalAction::Rotate(crate::explore::action::Orientation::Landscape),
            ]
        );
        assert!(parse_global_actions("back,jump").is_err());
    }

    #[test]
    fn test_tie_break_from_str() {
        assert_eq!("enumeration-order".parse::<TieBreak>(), Ok(TieBreak::EnumerationOrder));
        assert_eq!("delta".parse::<TieBreak>(), Ok(TieBreak::LargestScreenDelta));
        assert!("random".parse::<TieBreak>().is_err());
    }

    #[test]
    fn test_explore_config_serde_roundtrip_keeps_duration() {
        let config = ExploreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ExploreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_duration, config.max_duration);
        assert_eq!(back.global_actions, config.global_actions);
    }
}
