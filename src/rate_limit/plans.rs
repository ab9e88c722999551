//! User plans: daily message quota and model allow-lists

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Subscription tier of a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Free,
    Regular,
    Premium,
    Enterprise,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Free => "free",
            UserType::Regular => "regular",
            UserType::Premium => "premium",
            UserType::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(UserType::Free),
            "regular" => Ok(UserType::Regular),
            "premium" => Ok(UserType::Premium),
            "enterprise" => Ok(UserType::Enterprise),
            other => Err(format!("unknown user type: {}", other)),
        }
    }
}

/// Entitlements attached to a user type
#[derive(Debug, Clone)]
pub struct PlanLimits {
    pub max_messages_per_day: usize,
    pub allowed_models: Vec<&'static str>,
}

impl PlanLimits {
    pub fn allows_model(&self, model_id: &str) -> bool {
        self.allowed_models.iter().any(|m| *m == model_id)
    }

    pub fn allowed_model_ids(&self) -> Vec<String> {
        self.allowed_models.iter().map(|m| m.to_string()).collect()
    }
}

const BASIC_MODELS: [&str; 4] = ["gpt-4o-mini", "gpt-3.5-turbo", "claude-3-haiku", "gemini-1.5-flash"];
const ADVANCED_MODELS: [&str; 3] = ["gpt-4o", "claude-3-5-sonnet", "gemini-1.5-pro"];
const FRONTIER_MODELS: [&str; 2] = ["o1-preview", "claude-3-opus"];

static PLANS: Lazy<HashMap<UserType, PlanLimits>> = Lazy::new(|| {
    let basic: Vec<&'static str> = BASIC_MODELS.to_vec();
    let advanced: Vec<&'static str> = basic.iter().chain(ADVANCED_MODELS.iter()).copied().collect();
    let all: Vec<&'static str> = advanced.iter().chain(FRONTIER_MODELS.iter()).copied().collect();

    let mut plans = HashMap::new();
    plans.insert(
        UserType::Free,
        PlanLimits {
            max_messages_per_day: 20,
            allowed_models: basic,
        },
    );
    plans.insert(
        UserType::Regular,
        PlanLimits {
            max_messages_per_day: 200,
            allowed_models: advanced,
        },
    );
    plans.insert(
        UserType::Premium,
        PlanLimits {
            max_messages_per_day: 1000,
            allowed_models: all.clone(),
        },
    );
    plans.insert(
        UserType::Enterprise,
        PlanLimits {
            max_messages_per_day: 10_000,
            allowed_models: all,
        },
    );
    plans
});

/// Look up the plan for a user type
pub fn plan_for(user_type: UserType) -> &'static PlanLimits {
    // Every variant is inserted above.
    &PLANS[&user_type]
}
