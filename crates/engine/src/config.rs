//! Per-application publishing configuration.

use hatch_core::bucket::DEFAULT_TOTAL_CAPACITY;
use hatch_core::{Application, RandomizationUnit};
use serde::{Deserialize, Serialize};

/// How one application publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub application: Application,
    /// Remote collection holding this application's records.
    pub collection: String,
    /// Overrides the application's default randomization unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomization_unit: Option<RandomizationUnit>,
    /// When false, pushes are signed directly instead of going to review.
    #[serde(default = "default_review_required")]
    pub review_required: bool,
    /// Capacity of newly created isolation group instances.
    #[serde(default = "default_total_capacity")]
    pub total_capacity: u32,
}

fn default_review_required() -> bool {
    true
}

fn default_total_capacity() -> u32 {
    DEFAULT_TOTAL_CAPACITY
}

impl ApplicationConfig {
    /// Defaults for `application`: collection `hatch-<application>`, human
    /// review, default capacity.
    pub fn new(application: Application) -> Self {
        Self {
            application,
            collection: format!("hatch-{}", application.as_str().replace('_', "-")),
            randomization_unit: None,
            review_required: default_review_required(),
            total_capacity: default_total_capacity(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_review_required(mut self, review_required: bool) -> Self {
        self.review_required = review_required;
        self
    }

    pub fn randomization_unit(&self) -> RandomizationUnit {
        self.randomization_unit
            .unwrap_or_else(|| self.application.default_randomization_unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_application() {
        let config = ApplicationConfig::new(Application::FocusAndroid);
        assert_eq!(config.collection, "hatch-focus-android");
        assert!(config.review_required);
        assert_eq!(config.total_capacity, 10_000);
        assert_eq!(config.randomization_unit(), RandomizationUnit::NimbusId);
        assert_eq!(
            ApplicationConfig::new(Application::Desktop).randomization_unit(),
            RandomizationUnit::NormandyId
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ApplicationConfig = serde_json::from_str(
            r#"{"application": "fenix", "collection": "mobile", "randomization_unit": "group_id"}"#,
        )
        .unwrap();
        assert_eq!(config.collection, "mobile");
        assert_eq!(config.randomization_unit(), RandomizationUnit::GroupId);
        assert!(config.review_required);
        assert_eq!(config.total_capacity, 10_000);
    }
}
