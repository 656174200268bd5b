//! Fixed safety-settings blocks.
//!
//! Most models accept the full 11-category list (the five current harm
//! categories plus the six legacy ones). A small set rejects the legacy
//! categories and gets the 5-category subset.

use agpool_protocol::gemini::SafetySetting;

const BASIC_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

const LEGACY_CATEGORIES: [&str; 6] = [
    "HARM_CATEGORY_DEROGATORY",
    "HARM_CATEGORY_TOXICITY",
    "HARM_CATEGORY_VIOLENCE",
    "HARM_CATEGORY_SEXUAL",
    "HARM_CATEGORY_MEDICAL",
    "HARM_CATEGORY_DANGEROUS",
];

/// Models that reject the legacy categories outright.
fn wants_basic_only(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("image") || lower.starts_with("gemini-3")
}

pub fn safety_settings_for(model: &str) -> Vec<SafetySetting> {
    let categories: Vec<&str> = if wants_basic_only(model) {
        BASIC_CATEGORIES.to_vec()
    } else {
        BASIC_CATEGORIES
            .iter()
            .chain(LEGACY_CATEGORIES.iter())
            .copied()
            .collect()
    };
    categories
        .into_iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: "BLOCK_NONE".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_has_eleven_categories() {
        let block = safety_settings_for("gemini-2.5-flash");
        assert_eq!(block.len(), 11);
        assert!(block.iter().all(|s| s.threshold == "BLOCK_NONE"));
    }

    #[test]
    fn restricted_models_get_five() {
        assert_eq!(safety_settings_for("gemini-3-pro-preview").len(), 5);
        assert_eq!(safety_settings_for("gemini-2.5-flash-image").len(), 5);
    }
}
