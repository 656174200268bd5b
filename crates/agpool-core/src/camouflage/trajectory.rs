//! Fake interaction traces.
//!
//! The payload mirrors what the official client reports about an agent
//! turn. The upstream schema has drifted across versions, so everything is
//! built as a loose JSON tree and nothing here asserts a fixed shape.

use agpool_common::now_ms;
use rand::Rng;

/// The model name the trace reports, keyed by what was actually served.
fn placeholder_model(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.contains("claude") {
        "claude-sonnet-4-6"
    } else if lower.contains("image") {
        "gemini-3-pro-image-preview"
    } else if lower.contains("pro") {
        "gemini-3-pro-preview"
    } else {
        "gemini-2.5-flash"
    }
}

pub fn build(trajectory_id: &str, model: &str, project: &str) -> serde_json::Value {
    let mut rng = rand::rng();
    let prompt_tokens: u64 = rng.random_range(400..6_000);
    let output_tokens: u64 = rng.random_range(80..1_800);
    let thinking_tokens: u64 = rng.random_range(0..900);
    let step_latency_ms: u64 = rng.random_range(900..7_500);

    let now_ns = (now_ms() as i128) * 1_000_000 + rng.random_range(0..1_000_000) as i128;
    let started_ns = now_ns - (step_latency_ms as i128) * 1_000_000;

    serde_json::json!({
        "project": project,
        "trajectoryId": trajectory_id,
        "model": placeholder_model(model),
        "steps": [{
            "stepId": format!("step-{}", rng.random_range(1..=4u32)),
            "startTimestampNs": started_ns.to_string(),
            "endTimestampNs": now_ns.to_string(),
            "plannerResponse": {
                "selectedAction": "RESPOND_TO_USER",
                "confidence": rng.random_range(0.62..0.99f64),
            },
            "generatorMetadata": {
                "tokenCounts": {
                    "promptTokens": prompt_tokens,
                    "outputTokens": output_tokens,
                    "thinkingTokens": thinking_tokens,
                },
                "thinkingSignature": format!("ts-{:016x}", rng.random::<u64>()),
            },
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_table_covers_model_families() {
        assert_eq!(placeholder_model("claude-sonnet-4-6"), "claude-sonnet-4-6");
        assert_eq!(placeholder_model("gemini-2.5-pro"), "gemini-3-pro-preview");
        assert_eq!(placeholder_model("gemini-2.5-flash"), "gemini-2.5-flash");
        assert_eq!(
            placeholder_model("gemini-2.5-flash-image"),
            "gemini-3-pro-image-preview"
        );
    }

    #[test]
    fn payload_carries_trajectory_and_nanos() {
        let payload = build("traj-1", "gemini-2.5-flash", "proj");
        assert_eq!(payload["trajectoryId"], "traj-1");
        let start: i128 = payload["steps"][0]["startTimestampNs"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let end: i128 = payload["steps"][0]["endTimestampNs"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(end > start);
    }
}
