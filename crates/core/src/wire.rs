//! The record shape published to the remote configuration store.

use serde::{Deserialize, Serialize};

use crate::types::{BucketRange, ExperimentRecord, IsolationGroup, RandomizationUnit};

/// Schema version of the published record format.
pub const WIRE_SCHEMA_VERSION: &str = "1.12.0";

/// Top-level wire keys computed from the record. Passthrough payload fields
/// with these names are dropped.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "schemaVersion",
    "slug",
    "appName",
    "appId",
    "application",
    "userFacingName",
    "userFacingDescription",
    "isEnrollmentPaused",
    "bucketConfig",
    "branches",
    "targeting",
    "featureIds",
];

pub fn is_reserved_field(key: &str) -> bool {
    RESERVED_FIELDS.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub randomization_unit: RandomizationUnit,
    pub namespace: String,
    pub start: u32,
    pub count: u32,
    pub total: u32,
}

impl BucketConfig {
    pub fn new(group: &IsolationGroup, range: &BucketRange) -> Self {
        Self {
            randomization_unit: group.randomization_unit,
            namespace: group.namespace(),
            start: range.start,
            count: range.count,
            total: group.total_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub id: String,
    pub schema_version: String,
    pub slug: String,
    pub app_name: String,
    pub app_id: String,
    pub application: String,
    pub user_facing_name: String,
    pub user_facing_description: String,
    pub is_enrollment_paused: bool,
    pub bucket_config: BucketConfig,
    pub branches: serde_json::Value,
    pub targeting: String,
    pub feature_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WireRecord {
    /// Build the published form of `record` from its allocated range.
    pub fn build(record: &ExperimentRecord, group: &IsolationGroup, range: &BucketRange) -> Self {
        let payload = &record.payload;
        let branches = match &payload.branches {
            serde_json::Value::Null => serde_json::Value::Array(Vec::new()),
            other => other.clone(),
        };
        Self {
            id: record.slug.clone(),
            schema_version: WIRE_SCHEMA_VERSION.to_string(),
            slug: record.slug.clone(),
            app_name: record.application.app_name().to_string(),
            app_id: record.application.app_id().to_string(),
            application: record.application.app_id().to_string(),
            user_facing_name: payload.name.clone(),
            user_facing_description: payload.description.clone(),
            is_enrollment_paused: payload.is_enrollment_paused,
            bucket_config: BucketConfig::new(group, range),
            branches,
            targeting: payload.targeting.clone(),
            feature_ids: payload.feature_ids.clone(),
            extra: payload
                .extra
                .iter()
                .filter(|(key, _)| !is_reserved_field(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
