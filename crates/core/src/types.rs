//! Experiment domain records and the enums that classify them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ──────────────────────────────────────────────
// Application
// ──────────────────────────────────────────────

/// Target application. Each application publishes into exactly one
/// remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Application {
    Desktop,
    Fenix,
    Ios,
    FocusAndroid,
    FocusIos,
}

string_enum!(Application, "application", {
    Desktop => "desktop",
    Fenix => "fenix",
    Ios => "ios",
    FocusAndroid => "focus_android",
    FocusIos => "focus_ios",
});

impl Application {
    /// Client-facing application name carried in the wire record.
    pub fn app_name(&self) -> &'static str {
        match self {
            Application::Desktop => "firefox_desktop",
            Application::Fenix => "fenix",
            Application::Ios => "firefox_ios",
            Application::FocusAndroid => "focus_android",
            Application::FocusIos => "focus_ios",
        }
    }

    /// Client-facing application id carried in the wire record.
    pub fn app_id(&self) -> &'static str {
        match self {
            Application::Desktop => "firefox-desktop",
            Application::Fenix => "org.mozilla.firefox",
            Application::Ios => "org.mozilla.ios.Firefox",
            Application::FocusAndroid => "org.mozilla.focus",
            Application::FocusIos => "org.mozilla.ios.Focus",
        }
    }

    pub fn default_randomization_unit(&self) -> RandomizationUnit {
        match self {
            Application::Desktop => RandomizationUnit::NormandyId,
            _ => RandomizationUnit::NimbusId,
        }
    }
}

// ──────────────────────────────────────────────
// RandomizationUnit
// ──────────────────────────────────────────────

/// Identifier the client hashes to decide bucket membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomizationUnit {
    NormandyId,
    NimbusId,
    UserId,
    GroupId,
}

string_enum!(RandomizationUnit, "randomization unit", {
    NormandyId => "normandy_id",
    NimbusId => "nimbus_id",
    UserId => "user_id",
    GroupId => "group_id",
});

// ──────────────────────────────────────────────
// Status / PublishStatus
// ──────────────────────────────────────────────

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Draft,
    Preview,
    Live,
    Complete,
}

string_enum!(Status, "status", {
    Draft => "DRAFT",
    Preview => "PREVIEW",
    Live => "LIVE",
    Complete => "COMPLETE",
});

/// Progress of an experiment through the publish queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    Idle,
    Review,
    Approved,
    Waiting,
    Dirty,
}

string_enum!(PublishStatus, "publish status", {
    Idle => "IDLE",
    Review => "REVIEW",
    Approved => "APPROVED",
    Waiting => "WAITING",
    Dirty => "DIRTY",
});

impl PublishStatus {
    /// Queued or already pushed; `status_next` is only meaningful here.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PublishStatus::Review | PublishStatus::Approved | PublishStatus::Waiting
        )
    }

    /// Pushed to the remote store and waiting for it to confirm.
    pub fn is_awaiting_remote(&self) -> bool {
        matches!(self, PublishStatus::Approved | PublishStatus::Waiting)
    }
}

// ──────────────────────────────────────────────
// Lifecycle
// ──────────────────────────────────────────────

/// The three lifecycle fields of a record, validated and changed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: Status,
    #[serde(default)]
    pub status_next: Option<Status>,
    pub publish_status: PublishStatus,
}

impl Lifecycle {
    pub const fn new(
        status: Status,
        status_next: Option<Status>,
        publish_status: PublishStatus,
    ) -> Self {
        Self {
            status,
            status_next,
            publish_status,
        }
    }

    /// A settled record: nothing queued.
    pub const fn idle(status: Status) -> Self {
        Self::new(status, None, PublishStatus::Idle)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_next {
            Some(next) => write!(f, "{} -> {} ({})", self.status, next, self.publish_status),
            None => write!(f, "{} ({})", self.status, self.publish_status),
        }
    }
}

// ──────────────────────────────────────────────
// ExperimentRecord
// ──────────────────────────────────────────────

/// Opaque fields needed to build the wire record. Produced by the
/// authoring layer and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub branches: serde_json::Value,
    #[serde(default)]
    pub targeting: String,
    #[serde(default)]
    pub feature_ids: Vec<String>,
    #[serde(default)]
    pub is_enrollment_paused: bool,
    /// Any further wire fields, copied verbatim into the published record.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An experiment as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub slug: String,
    pub application: Application,
    pub status: Status,
    #[serde(default)]
    pub status_next: Option<Status>,
    pub publish_status: PublishStatus,
    /// Percentage of the hash space to enroll, 0 to 100.
    pub population_fraction: f64,
    /// Isolation group name; the slug when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_group: Option<String>,
    #[serde(default)]
    pub payload: ExperimentPayload,
    /// Storage version for optimistic concurrency. Starts at 0.
    #[serde(default)]
    pub version: i64,
}

impl ExperimentRecord {
    /// A freshly created record: DRAFT, IDLE, nothing queued.
    pub fn new_draft(
        slug: impl Into<String>,
        application: Application,
        population_fraction: f64,
        payload: ExperimentPayload,
    ) -> Self {
        Self {
            slug: slug.into(),
            application,
            status: Status::Draft,
            status_next: None,
            publish_status: PublishStatus::Idle,
            population_fraction,
            isolation_group: None,
            payload,
            version: 0,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.status, self.status_next, self.publish_status)
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.status = lifecycle.status;
        self.status_next = lifecycle.status_next;
        self.publish_status = lifecycle.publish_status;
    }

    pub fn isolation_group_name(&self) -> &str {
        self.isolation_group.as_deref().unwrap_or(&self.slug)
    }
}

/// Check that a population fraction is a finite percentage.
pub fn validate_population_fraction(fraction: f64) -> Result<(), String> {
    if fraction.is_finite() && (0.0..=100.0).contains(&fraction) {
        Ok(())
    } else {
        Err(format!(
            "population fraction must be between 0 and 100, got {fraction}"
        ))
    }
}

// ──────────────────────────────────────────────
// IsolationGroup / BucketRange
// ──────────────────────────────────────────────

/// A named partition of the hash space. Identity is `(name, instance)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationGroup {
    pub name: String,
    pub instance: u32,
    pub total_capacity: u32,
    pub randomization_unit: RandomizationUnit,
}

impl IsolationGroup {
    /// Namespace clients hash into: `{name}-{instance}`.
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.name, self.instance)
    }
}

/// A contiguous slice `[start, start + count)` of one group instance,
/// owned by one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRange {
    pub group_name: String,
    pub group_instance: u32,
    pub start: u32,
    pub count: u32,
    pub experiment: String,
}

impl BucketRange {
    /// Last bucket in the range (inclusive). Equal to `start` for an empty range.
    pub fn end(&self) -> u32 {
        (self.start + self.count).saturating_sub(1).max(self.start)
    }

    /// Whether two ranges of the same group instance share any bucket.
    pub fn overlaps(&self, other: &BucketRange) -> bool {
        self.group_name == other.group_name
            && self.group_instance == other.group_instance
            && self.count > 0
            && other.count > 0
            && self.start < other.start + other.count
            && other.start < self.start + self.count
    }
}
