//! Process-wide configuration for agpool.
//!
//! Environment variables are read exactly once at startup into [`AppConfig`];
//! per-request overrides are passed explicitly by the caller. Per-group quota
//! thresholds are the one exception: they live in the settings table and are
//! reread on demand by the pool.

use serde::{Deserialize, Serialize};

pub mod models;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// How OpenAI-dialect responses carry model thinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingOutput {
    /// `choices[].delta.reasoning_content` frames (default).
    ReasoningContent,
    /// Inline `<think>…</think>` tags in the content stream.
    Tags,
    /// Both of the above.
    Both,
}

impl ThinkingOutput {
    pub fn wants_reasoning_field(self) -> bool {
        matches!(self, ThinkingOutput::ReasoningContent | ThinkingOutput::Both)
    }

    pub fn wants_tags(self) -> bool {
        matches!(self, ThinkingOutput::Tags | ThinkingOutput::Both)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub admin_password: Option<String>,
    /// Downstream API keys. Empty set means `admin_password` is accepted.
    pub api_keys: Vec<String>,
    pub outbound_proxy: Option<String>,

    // Fingerprint transport.
    pub use_tls_fingerprint: bool,
    pub helper_path: String,
    pub tls_config_path: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub stream_read_timeout_ms: u64,

    // Retry orchestration.
    pub same_account_retries: u32,
    pub same_account_retry_delay_ms: u64,
    pub upstream_capacity_retry_delay_ms: u64,
    pub retry_total_timeout_ms: u64,
    pub error_count_to_disable: u32,

    // Pool.
    pub max_concurrent_per_account: i32,
    pub capacity_cooldown_default_ms: u64,
    pub capacity_cooldown_max_ms: u64,
    pub quota_threshold_default: f64,

    // Translator.
    pub tool_result_max_chars: usize,
    pub tool_result_total_max_chars: usize,
    pub tool_result_tail_chars: usize,
    pub max_output_tokens_with_tools: u32,
    pub openai_thinking_output: ThinkingOutput,
    pub official_system_prompt: bool,
    pub replay_space_fallback: bool,

    // Signature cache.
    pub claude_thinking_signature_ttl_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8317,
            db_path: "agpool.db".to_string(),
            admin_password: None,
            api_keys: Vec::new(),
            outbound_proxy: None,
            use_tls_fingerprint: true,
            helper_path: "bin/fingerprint".to_string(),
            tls_config_path: "bin/tls_config.json".to_string(),
            connect_timeout_ms: 30_000,
            read_timeout_ms: 120_000,
            stream_read_timeout_ms: 300_000,
            same_account_retries: 1,
            same_account_retry_delay_ms: 1_000,
            upstream_capacity_retry_delay_ms: 2_000,
            retry_total_timeout_ms: 30_000,
            error_count_to_disable: 3,
            max_concurrent_per_account: 3,
            capacity_cooldown_default_ms: 30_000,
            capacity_cooldown_max_ms: 15 * 60_000,
            quota_threshold_default: 0.2,
            tool_result_max_chars: 50_000,
            tool_result_total_max_chars: 200_000,
            tool_result_tail_chars: 2_000,
            max_output_tokens_with_tools: 16_384,
            openai_thinking_output: ThinkingOutput::ReasoningContent,
            official_system_prompt: false,
            replay_space_fallback: true,
            claude_thinking_signature_ttl_ms: 24 * 3_600_000,
        }
    }
}

impl AppConfig {
    /// Build the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (tests inject maps here).
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = get("HOST") {
            cfg.host = v;
        }
        if let Some(v) = get("PORT") {
            cfg.port = parse(&v, "PORT")?;
        }
        if let Some(v) = get("DB_PATH") {
            cfg.db_path = v;
        }
        cfg.admin_password = get("ADMIN_PASSWORD").filter(|v| !v.is_empty());
        if let Some(v) = get("API_KEY") {
            cfg.api_keys = v
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }
        cfg.outbound_proxy = get("OUTBOUND_PROXY")
            .or_else(|| get("HTTPS_PROXY"))
            .or_else(|| get("HTTP_PROXY"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if let Some(v) = get("USE_TLS_FINGERPRINT") {
            cfg.use_tls_fingerprint = parse_bool(&v, "USE_TLS_FINGERPRINT")?;
        }
        if let Some(v) = get("FINGERPRINT_HELPER_PATH") {
            cfg.helper_path = v;
        }
        if let Some(v) = get("TLS_CONFIG_PATH") {
            cfg.tls_config_path = v;
        }
        if let Some(v) = get("CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = parse(&v, "CONNECT_TIMEOUT_MS")?;
        }
        if let Some(v) = get("READ_TIMEOUT_MS") {
            cfg.read_timeout_ms = parse(&v, "READ_TIMEOUT_MS")?;
        }
        if let Some(v) = get("STREAM_READ_TIMEOUT_MS") {
            cfg.stream_read_timeout_ms = parse(&v, "STREAM_READ_TIMEOUT_MS")?;
        }

        if let Some(v) = get("SAME_ACCOUNT_RETRIES") {
            cfg.same_account_retries = parse(&v, "SAME_ACCOUNT_RETRIES")?;
        }
        if let Some(v) = get("SAME_ACCOUNT_RETRY_DELAY_MS") {
            cfg.same_account_retry_delay_ms = parse(&v, "SAME_ACCOUNT_RETRY_DELAY_MS")?;
        }
        if let Some(v) = get("UPSTREAM_CAPACITY_RETRY_DELAY_MS") {
            cfg.upstream_capacity_retry_delay_ms = parse(&v, "UPSTREAM_CAPACITY_RETRY_DELAY_MS")?;
        }
        if let Some(v) = get("RETRY_TOTAL_TIMEOUT_MS") {
            cfg.retry_total_timeout_ms = parse(&v, "RETRY_TOTAL_TIMEOUT_MS")?;
        }
        if let Some(v) = get("ERROR_COUNT_TO_DISABLE") {
            cfg.error_count_to_disable = parse(&v, "ERROR_COUNT_TO_DISABLE")?;
        }

        if let Some(v) = get("MAX_CONCURRENT_PER_ACCOUNT") {
            cfg.max_concurrent_per_account = parse(&v, "MAX_CONCURRENT_PER_ACCOUNT")?;
        }
        if let Some(v) = get("CAPACITY_COOLDOWN_DEFAULT_MS") {
            cfg.capacity_cooldown_default_ms = parse(&v, "CAPACITY_COOLDOWN_DEFAULT_MS")?;
        }
        if let Some(v) = get("CAPACITY_COOLDOWN_MAX_MS") {
            cfg.capacity_cooldown_max_ms = parse(&v, "CAPACITY_COOLDOWN_MAX_MS")?;
        }
        if let Some(v) = get("QUOTA_THRESHOLD_DEFAULT") {
            cfg.quota_threshold_default = parse(&v, "QUOTA_THRESHOLD_DEFAULT")?;
        }

        if let Some(v) = get("TOOL_RESULT_MAX_CHARS") {
            cfg.tool_result_max_chars = parse(&v, "TOOL_RESULT_MAX_CHARS")?;
        }
        if let Some(v) = get("TOOL_RESULT_TOTAL_MAX_CHARS") {
            cfg.tool_result_total_max_chars = parse(&v, "TOOL_RESULT_TOTAL_MAX_CHARS")?;
        }
        if let Some(v) = get("TOOL_RESULT_TAIL_CHARS") {
            cfg.tool_result_tail_chars = parse(&v, "TOOL_RESULT_TAIL_CHARS")?;
        }
        if let Some(v) = get("MAX_OUTPUT_TOKENS_WITH_TOOLS") {
            cfg.max_output_tokens_with_tools = parse(&v, "MAX_OUTPUT_TOKENS_WITH_TOOLS")?;
        }
        if let Some(v) = get("OPENAI_THINKING_OUTPUT") {
            cfg.openai_thinking_output = match v.trim() {
                "reasoning_content" => ThinkingOutput::ReasoningContent,
                "tags" => ThinkingOutput::Tags,
                "both" => ThinkingOutput::Both,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "OPENAI_THINKING_OUTPUT",
                        value: other.to_string(),
                    });
                }
            };
        }
        if let Some(v) = get("OFFICIAL_SYSTEM_PROMPT") {
            cfg.official_system_prompt = parse_bool(&v, "OFFICIAL_SYSTEM_PROMPT")?;
        }
        if let Some(v) = get("CLAUDE_REPLAY_SPACE_FALLBACK") {
            cfg.replay_space_fallback = parse_bool(&v, "CLAUDE_REPLAY_SPACE_FALLBACK")?;
        }
        if let Some(v) = get("CLAUDE_THINKING_SIGNATURE_TTL_MS") {
            cfg.claude_thinking_signature_ttl_ms = parse(&v, "CLAUDE_THINKING_SIGNATURE_TTL_MS")?;
        }

        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.port, 8317);
        assert_eq!(cfg.quota_threshold_default, 0.2);
        assert_eq!(cfg.openai_thinking_output, ThinkingOutput::ReasoningContent);
        assert!(cfg.api_keys.is_empty());
    }

    #[test]
    fn api_key_list_splits_on_commas() {
        let cfg =
            AppConfig::from_lookup(lookup(&[("API_KEY", "sk-a, sk-b ,,sk-c")])).unwrap();
        assert_eq!(cfg.api_keys, vec!["sk-a", "sk-b", "sk-c"]);
    }

    #[test]
    fn proxy_falls_back_through_standard_vars() {
        let cfg = AppConfig::from_lookup(lookup(&[("HTTPS_PROXY", "socks5://127.0.0.1:1080")]))
            .unwrap();
        assert_eq!(cfg.outbound_proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
    }

    #[test]
    fn bad_thinking_output_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("OPENAI_THINKING_OUTPUT", "loud")]));
        assert!(err.is_err());
    }
}
