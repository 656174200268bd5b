//! Exposed-model catalog and routing keys.
//!
//! Routing, cooldowns and thresholds key on the quota *group* derived from
//! the mapped upstream model, not on the model itself, so every variant of a
//! family shares capacity decisions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaGroup {
    Flash,
    Pro,
    Claude,
    Image,
}

impl QuotaGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaGroup::Flash => "flash",
            QuotaGroup::Pro => "pro",
            QuotaGroup::Claude => "claude",
            QuotaGroup::Image => "image",
        }
    }

    /// The model whose per-account quota row stands in for the whole group.
    pub fn representative_model(&self) -> &'static str {
        match self {
            QuotaGroup::Flash => "gemini-2.5-flash",
            QuotaGroup::Pro => "gemini-2.5-pro",
            QuotaGroup::Claude => "claude-sonnet-4-6",
            QuotaGroup::Image => "gemini-3-pro-image-preview",
        }
    }

    pub fn all() -> [QuotaGroup; 4] {
        [
            QuotaGroup::Flash,
            QuotaGroup::Pro,
            QuotaGroup::Claude,
            QuotaGroup::Image,
        ]
    }
}

impl fmt::Display for QuotaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared key for stickiness and cooldowns: a group for known families, the
/// raw mapped model otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectionKey {
    Group(QuotaGroup),
    Model(String),
}

impl SelectionKey {
    pub fn is_group(&self) -> bool {
        matches!(self, SelectionKey::Group(_))
    }

    /// The model the selection query joins quota rows against.
    pub fn join_model(&self) -> &str {
        match self {
            SelectionKey::Group(group) => group.representative_model(),
            SelectionKey::Model(model) => model.as_str(),
        }
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionKey::Group(group) => write!(f, "group:{group}"),
            SelectionKey::Model(model) => f.write_str(model),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRoute {
    /// The model id the client asked for.
    pub exposed: String,
    /// The model id sent upstream.
    pub upstream_model: String,
    pub group: Option<QuotaGroup>,
    pub selection_key: SelectionKey,
    /// Model belongs to the thinking set (thinking on unless disabled).
    pub thinking_default: bool,
    /// `requesttype` header / envelope field value.
    pub request_type: &'static str,
}

impl ModelRoute {
    pub fn is_claude(&self) -> bool {
        self.group == Some(QuotaGroup::Claude)
    }

    pub fn is_image(&self) -> bool {
        self.group == Some(QuotaGroup::Image)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExposedModel {
    pub id: &'static str,
    pub display_name: &'static str,
    pub upstream: &'static str,
    pub group: QuotaGroup,
    pub thinking: bool,
}

/// Every model the proxy serves on its model-list endpoints.
pub const EXPOSED_MODELS: &[ExposedModel] = &[
    ExposedModel {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        upstream: "gemini-2.5-flash",
        group: QuotaGroup::Flash,
        thinking: false,
    },
    ExposedModel {
        id: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        upstream: "gemini-2.5-flash-lite",
        group: QuotaGroup::Flash,
        thinking: false,
    },
    ExposedModel {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        upstream: "gemini-2.5-pro",
        group: QuotaGroup::Pro,
        thinking: true,
    },
    ExposedModel {
        id: "gemini-3-pro-preview",
        display_name: "Gemini 3 Pro Preview",
        upstream: "gemini-3-pro-preview",
        group: QuotaGroup::Pro,
        thinking: true,
    },
    ExposedModel {
        id: "claude-sonnet-4-6",
        display_name: "Claude Sonnet 4.6",
        upstream: "claude-sonnet-4-6",
        group: QuotaGroup::Claude,
        thinking: false,
    },
    ExposedModel {
        id: "claude-sonnet-4-6-thinking",
        display_name: "Claude Sonnet 4.6 (Thinking)",
        upstream: "claude-sonnet-4-6",
        group: QuotaGroup::Claude,
        thinking: true,
    },
    ExposedModel {
        id: "claude-opus-4-5",
        display_name: "Claude Opus 4.5",
        upstream: "claude-opus-4-5",
        group: QuotaGroup::Claude,
        thinking: false,
    },
    ExposedModel {
        id: "gemini-3-pro-image-preview",
        display_name: "Gemini 3 Pro Image Preview",
        upstream: "gemini-3-pro-image-preview",
        group: QuotaGroup::Image,
        thinking: false,
    },
    ExposedModel {
        id: "gemini-2.5-flash-image",
        display_name: "Gemini 2.5 Flash Image",
        upstream: "gemini-2.5-flash-image",
        group: QuotaGroup::Image,
        thinking: false,
    },
];

/// Map an incoming model id to its route. Unknown models still resolve (the
/// upstream is the authority); family inference keeps group routing working
/// for new variants.
pub fn resolve_model(model: &str) -> ModelRoute {
    let trimmed = model.strip_prefix("models/").unwrap_or(model).trim();

    if let Some(entry) = EXPOSED_MODELS.iter().find(|m| m.id == trimmed) {
        return ModelRoute {
            exposed: trimmed.to_string(),
            upstream_model: entry.upstream.to_string(),
            group: Some(entry.group),
            selection_key: SelectionKey::Group(entry.group),
            thinking_default: entry.thinking,
            request_type: request_type_for(entry.group),
        };
    }

    let lower = trimmed.to_ascii_lowercase();
    let group = if lower.contains("image") {
        Some(QuotaGroup::Image)
    } else if lower.contains("claude") {
        Some(QuotaGroup::Claude)
    } else if lower.contains("flash") {
        Some(QuotaGroup::Flash)
    } else if lower.contains("gemini") && lower.contains("pro") {
        Some(QuotaGroup::Pro)
    } else {
        None
    };

    ModelRoute {
        exposed: trimmed.to_string(),
        upstream_model: trimmed.to_string(),
        group,
        selection_key: match group {
            Some(group) => SelectionKey::Group(group),
            None => SelectionKey::Model(trimmed.to_string()),
        },
        thinking_default: group == Some(QuotaGroup::Pro) || lower.ends_with("-thinking"),
        request_type: group.map(request_type_for).unwrap_or("agent"),
    }
}

fn request_type_for(group: QuotaGroup) -> &'static str {
    match group {
        QuotaGroup::Image => "image_gen",
        _ => "agent",
    }
}

/// Settings key carrying a per-group quota threshold override.
pub fn threshold_setting_key(group: QuotaGroup) -> String {
    format!("quota_threshold:{group}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve_to_their_group() {
        let route = resolve_model("gemini-2.5-flash");
        assert_eq!(route.group, Some(QuotaGroup::Flash));
        assert_eq!(route.selection_key.to_string(), "group:flash");
        assert!(!route.thinking_default);

        let route = resolve_model("models/claude-sonnet-4-6-thinking");
        assert_eq!(route.upstream_model, "claude-sonnet-4-6");
        assert!(route.thinking_default);
        assert!(route.is_claude());
    }

    #[test]
    fn unknown_flash_variant_shares_the_flash_group() {
        let route = resolve_model("gemini-2.0-flash-exp");
        assert_eq!(route.group, Some(QuotaGroup::Flash));
        assert_eq!(route.selection_key.join_model(), "gemini-2.5-flash");
        assert_eq!(route.upstream_model, "gemini-2.0-flash-exp");
    }

    #[test]
    fn unknown_model_uses_raw_selection_key() {
        let route = resolve_model("text-embedding-004");
        assert_eq!(route.group, None);
        assert_eq!(route.selection_key, SelectionKey::Model("text-embedding-004".into()));
    }

    #[test]
    fn image_models_use_image_gen_request_type() {
        let route = resolve_model("gemini-3-pro-image-preview");
        assert_eq!(route.request_type, "image_gen");
        assert!(route.is_image());
    }
}
