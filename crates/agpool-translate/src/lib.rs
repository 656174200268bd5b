//! Dialect translation: OpenAI / Anthropic / Gemini ↔ the canonical
//! upstream request, plus the streaming re-encoders for each dialect.

pub mod claude;
pub mod finish;
pub mod gemini;
pub mod limits;
pub mod openai;
pub mod safety;
pub mod thinking;

use agpool_common::{AppConfig, ThinkingOutput};
use agpool_protocol::upstream::Envelope;

pub type TranslateResult<T> = Result<T, TranslateError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("{0}")]
    BadRequest(String),
}

/// Knobs the translator reads; built once from the process config.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub tool_result_max_chars: usize,
    pub tool_result_total_max_chars: usize,
    pub tool_result_tail_chars: usize,
    pub max_output_tokens_with_tools: u32,
    pub thinking_output: ThinkingOutput,
    pub official_system_prompt: bool,
    pub replay_space_fallback: bool,
}

impl TranslateOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            tool_result_max_chars: cfg.tool_result_max_chars,
            tool_result_total_max_chars: cfg.tool_result_total_max_chars,
            tool_result_tail_chars: cfg.tool_result_tail_chars,
            max_output_tokens_with_tools: cfg.max_output_tokens_with_tools,
            thinking_output: cfg.openai_thinking_output,
            official_system_prompt: cfg.official_system_prompt,
            replay_space_fallback: cfg.replay_space_fallback,
        }
    }
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Sentinel accepted by upstream tool validation when no real signature is
/// cached for a replayed Gemini functionCall.
pub const SENTINEL_SIGNATURE: &str = "skip_thought_signature_validator";

/// Lookup/record interface over the thought-signature cache. The concrete
/// cache lives in the core crate; tests use [`NoSignatures`].
pub trait ThoughtSignatures: Send + Sync {
    fn tool_signature(&self, tool_call_id: &str) -> Option<String>;
    /// (signature, thought_text)
    fn claude_thinking(&self, tool_call_id: &str) -> Option<(String, String)>;
    fn remember_tool_signature(&self, tool_call_id: &str, signature: &str);
    fn remember_claude_thinking(&self, tool_call_id: &str, signature: &str, thought_text: &str);
}

/// Empty cache; replays degrade exactly as they would on a cold start.
#[derive(Debug, Default)]
pub struct NoSignatures;

impl ThoughtSignatures for NoSignatures {
    fn tool_signature(&self, _tool_call_id: &str) -> Option<String> {
        None
    }

    fn claude_thinking(&self, _tool_call_id: &str) -> Option<(String, String)> {
        None
    }

    fn remember_tool_signature(&self, _tool_call_id: &str, _signature: &str) {}

    fn remember_claude_thinking(&self, _tool_call_id: &str, _signature: &str, _thought_text: &str) {
    }
}

/// A translated request plus what the translation had to give up.
#[derive(Debug)]
pub struct BuiltRequest {
    pub envelope: Envelope,
    /// Thinking was requested but had to be disabled for this turn
    /// (signature-cache miss on a tool replay).
    pub thinking_downgraded: bool,
}

/// Official client preamble injected when OFFICIAL_SYSTEM_PROMPT is on.
pub(crate) const OFFICIAL_PREAMBLE: &str = "You are Antigravity, an agentic coding assistant \
developed by Google, working inside a user's IDE.";

/// Whether a replayed tool-call id belongs to the target model family.
/// `toolu_*` ids are minted by the Claude family; anything else is generic.
pub(crate) fn tool_id_matches_family(id: &str, is_claude: bool) -> bool {
    id.starts_with("toolu_") == is_claude
}
