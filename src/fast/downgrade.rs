//! Faster sibling models for latency-sensitive requests

use crate::rate_limit::{plan_for, UserType};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static FASTER_MODELS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o", "gpt-4o-mini"),
        ("o1-preview", "gpt-4o-mini"),
        ("gpt-4o-mini", "gpt-3.5-turbo"),
        ("claude-3-opus", "claude-3-5-sonnet"),
        ("claude-3-5-sonnet", "claude-3-haiku"),
        ("gemini-1.5-pro", "gemini-1.5-flash"),
    ])
});

/// Faster substitute for `model_id` that the user's plan allows
pub fn faster_model(model_id: &str, user_type: UserType) -> Option<&'static str> {
    FASTER_MODELS
        .get(model_id)
        .copied()
        .filter(|candidate| plan_for(user_type).allows_model(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downgrade_respects_plan() {
        assert_eq!(faster_model("gpt-4o", UserType::Regular), Some("gpt-4o-mini"));
        assert_eq!(faster_model("claude-3-opus", UserType::Premium), Some("claude-3-5-sonnet"));
        // free plans cannot use the sonnet fallback
        assert_eq!(faster_model("claude-3-opus", UserType::Free), None);
        assert_eq!(faster_model("claude-3-haiku", UserType::Enterprise), None);
    }
}
