//! When thinking turns on, and with what budget.

use agpool_common::models::ModelRoute;
use agpool_protocol::gemini::ThinkingConfig;

pub const DEFAULT_THINKING_BUDGET: u32 = 8192;
pub const CLAUDE_MIN_THINKING_BUDGET: u32 = 1024;

/// The client's explicit thinking request, normalised across dialects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThinkingAsk {
    #[default]
    Unspecified,
    Enabled {
        budget: Option<u32>,
    },
    Adaptive {
        budget: Option<u32>,
    },
    Disabled,
}

pub fn effort_budget(effort: &str) -> Option<u32> {
    match effort.to_ascii_lowercase().as_str() {
        "minimal" => Some(1024),
        "low" => Some(2048),
        "medium" => Some(4096),
        "high" => Some(8192),
        "max" | "xhigh" => Some(16384),
        _ => None,
    }
}

/// Resolve to a budget (None = thinking off).
///
/// Thinking is on when the model is in the thinking set, the client asked
/// for it explicitly, a positive budget was given, or an effort level was
/// given. An explicit disable always wins.
pub fn resolve(route: &ModelRoute, ask: ThinkingAsk, effort: Option<&str>) -> Option<u32> {
    if matches!(ask, ThinkingAsk::Disabled) {
        return None;
    }
    let asked_budget = match ask {
        ThinkingAsk::Enabled { budget } | ThinkingAsk::Adaptive { budget } => budget,
        _ => None,
    };
    let effort_budget = effort.and_then(effort_budget);

    let explicit = !matches!(ask, ThinkingAsk::Unspecified)
        || asked_budget.is_some_and(|b| b > 0)
        || effort.is_some();
    if !route.thinking_default && !explicit {
        return None;
    }

    let budget = asked_budget
        .filter(|b| *b > 0)
        .or(effort_budget)
        .unwrap_or(DEFAULT_THINKING_BUDGET);
    Some(budget)
}

/// Claude thinking requires budget ≥ 1024 and maxOutputTokens > budget.
/// Returns the (budget, max_output_tokens) pair actually sent upstream.
pub fn clamp_for_claude(budget: u32, max_output_tokens: u32) -> (u32, u32) {
    let budget = budget.max(CLAUDE_MIN_THINKING_BUDGET);
    if max_output_tokens > budget {
        (budget, max_output_tokens)
    } else {
        (budget, budget + CLAUDE_MIN_THINKING_BUDGET)
    }
}

pub fn to_config(budget: u32) -> ThinkingConfig {
    ThinkingConfig {
        include_thoughts: true,
        thinking_budget: Some(budget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agpool_common::models::resolve_model;

    #[test]
    fn thinking_set_models_default_on() {
        let route = resolve_model("gemini-2.5-pro");
        assert_eq!(
            resolve(&route, ThinkingAsk::Unspecified, None),
            Some(DEFAULT_THINKING_BUDGET)
        );
    }

    #[test]
    fn non_thinking_models_default_off() {
        let route = resolve_model("gemini-2.5-flash");
        assert_eq!(resolve(&route, ThinkingAsk::Unspecified, None), None);
    }

    #[test]
    fn effort_enables_and_sizes_thinking() {
        let route = resolve_model("gemini-2.5-flash");
        assert_eq!(
            resolve(&route, ThinkingAsk::Unspecified, Some("medium")),
            Some(4096)
        );
        assert_eq!(
            resolve(&route, ThinkingAsk::Unspecified, Some("max")),
            Some(16384)
        );
    }

    #[test]
    fn explicit_disable_wins_over_thinking_set() {
        let route = resolve_model("gemini-2.5-pro");
        assert_eq!(resolve(&route, ThinkingAsk::Disabled, None), None);
    }

    #[test]
    fn explicit_budget_is_used() {
        let route = resolve_model("claude-sonnet-4-6");
        assert_eq!(
            resolve(&route, ThinkingAsk::Enabled { budget: Some(2048) }, None),
            Some(2048)
        );
    }

    #[test]
    fn claude_clamp_enforces_floor_and_headroom() {
        assert_eq!(clamp_for_claude(512, 8192), (1024, 8192));
        assert_eq!(clamp_for_claude(4096, 4096), (4096, 5120));
        assert_eq!(clamp_for_claude(2048, 8192), (2048, 8192));
    }
}
