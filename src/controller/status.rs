//! Status condition state machine
//!
//! The CR reports its health as a combination of the Available, Progressing
//! and Degraded conditions. Each `mark_*` helper moves all three at once and
//! returns whether any of them changed state.
//!
//! Writes are decided by [`changes`], a field-level change set between the
//! status read at the start of a reconcile and the one computed by it.
//! Heartbeats alone never make a condition count as changed.

use crate::crd::{
    find_condition, set_condition, Condition, ConditionStatus, ConditionType, DateTime,
    HostPathProvisioner, HostPathProvisionerStatus, Utc,
};
use crate::domain::{ReadinessGauge, NOT_READY, READY};
use k8s_openapi::api::apps::v1::DaemonSet;

pub const DEPLOY_STARTED_MESSAGE: &str = "Started Deployment";
pub const HEALTHY_REASON: &str = "Complete";
pub const HEALTHY_MESSAGE: &str = "Application Available";
pub const DEGRADED_REASON: &str = "Degraded";
pub const DEGRADED_MESSAGE: &str = "CR is deployed but DaemonSets are not ready";
pub const POOL_NOT_READY_REASON: &str = "StoragePoolNotReady";

// =============================================================================
// Readiness
// =============================================================================

/// A DaemonSet is ready when it has ready pods and no fewer than it wants.
///
/// Zero desired pods is not ready: an unscheduled DaemonSet serves nothing.
pub fn daemonset_ready(daemonset: &DaemonSet) -> bool {
    daemonset.status.as_ref().is_some_and(|status| {
        status.number_ready > 0 && status.number_ready >= status.desired_number_scheduled
    })
}

/// Readiness of the workloads the current mode requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadReadiness {
    /// Legacy DaemonSet, `None` in driver-only mode
    pub legacy: Option<bool>,
    pub csi: bool,
}

impl WorkloadReadiness {
    pub fn ready(&self) -> bool {
        self.legacy.unwrap_or(true) && self.csi
    }
}

/// Report the CR health as the readiness gauge.
///
/// Nothing is reported while the CR is neither available nor failed but still
/// progressing, so an install in progress never looks broken.
pub fn report_readiness<G: ReadinessGauge + ?Sized>(cr: &HostPathProvisioner, gauge: &G) {
    if cr.is_available() {
        gauge.set(READY);
    } else if !cr.is_progressing() {
        gauge.set(NOT_READY);
    }
}

// =============================================================================
// Phases
// =============================================================================

/// No version has been fully rolled out yet
pub fn is_deploying(cr: &HostPathProvisioner) -> bool {
    cr.observed_version().is_empty()
}

/// A rolled-out version differs from the one being converged to
pub fn is_upgrading(cr: &HostPathProvisioner) -> bool {
    cr.status
        .as_ref()
        .is_some_and(|s| !s.observed_version.is_empty() && s.observed_version != s.target_version)
}

type Target<'a> = (ConditionType, bool, &'a str, &'a str);

fn mark(status: &mut HostPathProvisionerStatus, targets: [Target<'_>; 3], now: DateTime<Utc>) -> bool {
    let mut changed = false;
    for (r#type, value, reason, message) in targets {
        let status_value = ConditionStatus::from(value);
        let same = find_condition(&status.conditions, &r#type)
            .is_some_and(|c| c.status == status_value && c.reason == reason && c.message == message);
        changed |= !same;
        set_condition(&mut status.conditions, r#type, status_value, reason, message, now);
    }
    changed
}

/// Fresh install in progress
pub fn mark_deploying(status: &mut HostPathProvisionerStatus, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
    mark(
        status,
        [
            (ConditionType::Available, false, reason, message),
            (ConditionType::Progressing, true, reason, message),
            (ConditionType::Degraded, false, "", ""),
        ],
        now,
    )
}

/// Upgrade in progress; the previous version keeps serving meanwhile
pub fn mark_upgrading(status: &mut HostPathProvisionerStatus, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
    mark(
        status,
        [
            (ConditionType::Available, true, "", ""),
            (ConditionType::Progressing, true, reason, message),
            (ConditionType::Degraded, true, reason, message),
        ],
        now,
    )
}

pub fn mark_healthy(status: &mut HostPathProvisionerStatus, now: DateTime<Utc>) -> bool {
    mark(
        status,
        [
            (ConditionType::Available, true, HEALTHY_REASON, HEALTHY_MESSAGE),
            (ConditionType::Progressing, false, "", ""),
            (ConditionType::Degraded, false, "", ""),
        ],
        now,
    )
}

/// Deployed but a required workload is not ready
pub fn mark_failed(status: &mut HostPathProvisionerStatus, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
    mark(
        status,
        [
            (ConditionType::Available, false, reason, message),
            (ConditionType::Progressing, false, "", ""),
            (ConditionType::Degraded, true, reason, message),
        ],
        now,
    )
}

/// A reconcile step failed; the next trigger retries it
pub fn mark_failed_healing(status: &mut HostPathProvisionerStatus, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
    mark(
        status,
        [
            (ConditionType::Available, false, reason, message),
            (ConditionType::Progressing, true, reason, message),
            (ConditionType::Degraded, true, reason, message),
        ],
        now,
    )
}

// =============================================================================
// Change Set
// =============================================================================

/// A status field that differs between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    OperatorVersion,
    TargetVersion,
    ObservedVersion,
    Condition(ConditionType),
    StoragePools,
}

/// Keep transition times of conditions whose state did not change.
///
/// A condition can flip and flip back within one reconcile; only its
/// heartbeat should move then.
pub fn settle(before: Option<&HostPathProvisionerStatus>, after: &mut HostPathProvisionerStatus) {
    let Some(before) = before else {
        return;
    };
    for condition in after.conditions.iter_mut() {
        if let Some(previous) = find_condition(&before.conditions, &condition.r#type) {
            if previous.same_state(condition) {
                condition.last_transition_time = previous.last_transition_time;
            }
        }
    }
}

fn condition_changed(before: Option<&Condition>, after: Option<&Condition>) -> bool {
    match (before, after) {
        (Some(b), Some(a)) => !b.same_state(a) || b.last_transition_time != a.last_transition_time,
        (None, None) => false,
        _ => true,
    }
}

/// Fields of `after` that differ from `before`, heartbeats ignored
pub fn changes(
    before: Option<&HostPathProvisionerStatus>,
    after: Option<&HostPathProvisionerStatus>,
) -> Vec<StatusChange> {
    let empty = HostPathProvisionerStatus::default();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    let mut changes = Vec::new();
    if before.operator_version != after.operator_version {
        changes.push(StatusChange::OperatorVersion);
    }
    if before.target_version != after.target_version {
        changes.push(StatusChange::TargetVersion);
    }
    if before.observed_version != after.observed_version {
        changes.push(StatusChange::ObservedVersion);
    }
    let mut types = ConditionType::MANAGED.to_vec();
    for condition in before.conditions.iter().chain(after.conditions.iter()) {
        if !types.contains(&condition.r#type) {
            types.push(condition.r#type.clone());
        }
    }
    for r#type in types {
        if condition_changed(
            find_condition(&before.conditions, &r#type),
            find_condition(&after.conditions, &r#type),
        ) {
            changes.push(StatusChange::Condition(r#type));
        }
    }
    if before.storage_pool_statuses != after.storage_pool_statuses {
        changes.push(StatusChange::StoragePools);
    }
    changes
}
