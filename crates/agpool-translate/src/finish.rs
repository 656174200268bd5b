//! Upstream finish-reason mapping for each dialect.

use agpool_protocol::claude::StopReason;

const FILTER_REASONS: [&str; 7] = [
    "SAFETY",
    "RECITATION",
    "MALFORMED_FUNCTION_CALL",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

pub fn to_openai(upstream: Option<&str>, has_tool_calls: bool) -> String {
    if has_tool_calls {
        return "tool_calls".to_string();
    }
    let Some(reason) = upstream else {
        return "stop".to_string();
    };
    let upper = reason.to_ascii_uppercase();
    if upper.starts_with("MAX_TOKENS") || upper == "MAX_OUTPUT_TOKENS" {
        return "length".to_string();
    }
    if upper == "PAUSE" {
        return "pause_turn".to_string();
    }
    if FILTER_REASONS.contains(&upper.as_str()) {
        return "content_filter".to_string();
    }
    // STOP, OTHER, and anything the upstream invents later.
    "stop".to_string()
}

pub fn to_claude(upstream: Option<&str>, has_tool_use: bool) -> StopReason {
    if has_tool_use {
        return StopReason::ToolUse;
    }
    let Some(reason) = upstream else {
        return StopReason::EndTurn;
    };
    let upper = reason.to_ascii_uppercase();
    if upper.starts_with("MAX_TOKENS") || upper == "MAX_OUTPUT_TOKENS" {
        return StopReason::MaxTokens;
    }
    if upper == "PAUSE" {
        return StopReason::PauseTurn;
    }
    if FILTER_REASONS.contains(&upper.as_str()) {
        return StopReason::Refusal;
    }
    StopReason::EndTurn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_map_covers_the_families() {
        assert_eq!(to_openai(Some("STOP"), false), "stop");
        assert_eq!(to_openai(Some("OTHER"), false), "stop");
        assert_eq!(to_openai(Some("MAX_TOKENS"), false), "length");
        assert_eq!(to_openai(Some("PAUSE"), false), "pause_turn");
        assert_eq!(to_openai(Some("SAFETY"), false), "content_filter");
        assert_eq!(to_openai(Some("RECITATION"), false), "content_filter");
        assert_eq!(to_openai(Some("NEW_REASON"), false), "stop");
        assert_eq!(to_openai(Some("STOP"), true), "tool_calls");
    }

    #[test]
    fn claude_map_covers_the_families() {
        assert_eq!(to_claude(Some("STOP"), false), StopReason::EndTurn);
        assert_eq!(to_claude(Some("MAX_TOKENS"), false), StopReason::MaxTokens);
        assert_eq!(to_claude(Some("SAFETY"), false), StopReason::Refusal);
        assert_eq!(to_claude(Some("STOP"), true), StopReason::ToolUse);
    }
}
