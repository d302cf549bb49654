//! Status conditions
//!
//! Conditions are independently settable by type. A condition's transition
//! time only moves when its status, reason or message change; its heartbeat
//! moves every time it is set.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types on the HostPathProvisioner status.
///
/// Other controllers may add their own condition types to the status; those
/// are kept as [`ConditionType::Other`] and written back untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
    Other(String),
}

impl ConditionType {
    /// The condition types this operator owns
    pub const MANAGED: [ConditionType; 3] = [
        ConditionType::Available,
        ConditionType::Progressing,
        ConditionType::Degraded,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ConditionType::Available => "Available",
            ConditionType::Progressing => "Progressing",
            ConditionType::Degraded => "Degraded",
            ConditionType::Other(name) => name,
        }
    }
}

impl From<String> for ConditionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Available" => ConditionType::Available,
            "Progressing" => ConditionType::Progressing,
            "Degraded" => ConditionType::Degraded,
            _ => ConditionType::Other(value),
        }
    }
}

impl From<ConditionType> for String {
    fn from(value: ConditionType) -> Self {
        match value {
            ConditionType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition status values; anything unrecognised reads as `Unknown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[serde(other)]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A single observed condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[schemars(with = "String")]
    pub r#type: ConditionType,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status, reason or message changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Last time the condition was evaluated
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Whether `other` carries the same status, reason and message
    pub fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &ConditionType) -> Option<&'a Condition> {
    conditions.iter().find(|c| &c.r#type == r#type)
}

/// Check whether a condition of the given type is present with status True
pub fn is_condition_true(conditions: &[Condition], r#type: &ConditionType) -> bool {
    find_condition(conditions, r#type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Set a condition, replacing an existing one of the same type
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
        if existing.status != status || existing.reason != reason || existing.message != message {
            existing.last_transition_time = Some(now);
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.last_heartbeat_time = Some(now);
    } else {
        conditions.push(Condition {
            r#type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(now),
            last_heartbeat_time: Some(now),
        });
    }
}
