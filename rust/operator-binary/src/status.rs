//! Condition transitions and machine-level error summarization.

use k8s_openapi::chrono::Utc;
use strum::IntoEnumIterator;

use crate::{
    crd::{
        machine_api::{Machine, MachineSet},
        ConditionStatus, MachinePoolCondition, MachinePoolConditionType, MachineSetSummary,
    },
    sync::autoscaling_bounds,
};

pub const REASON_INITIALIZED: &str = "Initialized";
pub const REASON_ENOUGH_REPLICAS: &str = "EnoughReplicas";
pub const REASON_MIN_REPLICAS_TOO_SMALL: &str = "MinReplicasTooSmall";
pub const REASON_MULTIPLE_MACHINES_FAILED: &str = "MultipleMachinesFailed";

/// Seeds an Unknown entry for every recognized condition type. Returns true
/// when anything was added, in which case the caller persists and
/// re-enqueues before doing real work.
pub fn init_conditions(conditions: &mut Vec<MachinePoolCondition>) -> bool {
    let mut added = false;
    for type_ in MachinePoolConditionType::iter() {
        if !conditions.iter().any(|c| c.type_ == type_) {
            conditions.push(MachinePoolCondition {
                type_,
                status: ConditionStatus::Unknown,
                reason: Some(REASON_INITIALIZED.to_owned()),
                message: Some("Condition Initialized".to_owned()),
                last_transition_time: Some(Utc::now().to_rfc3339()),
            });
            added = true;
        }
    }
    added
}

/// Applies one condition transition in place. A write is emitted only when
/// status, reason or message would change, and the transition timestamp only
/// moves when the status itself flips. Returns true when the set changed and
/// needs persisting.
pub fn set_condition(
    conditions: &mut Vec<MachinePoolCondition>,
    type_: MachinePoolConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        None => {
            conditions.push(MachinePoolCondition {
                type_,
                status,
                reason: Some(reason.to_owned()),
                message: Some(message.to_owned()),
                last_transition_time: Some(Utc::now().to_rfc3339()),
            });
            true
        }
        Some(existing) => {
            let status_changed = existing.status != status;
            let detail_changed = existing.reason.as_deref() != Some(reason)
                || existing.message.as_deref() != Some(message);
            if !status_changed && !detail_changed {
                return false;
            }
            if status_changed {
                existing.last_transition_time = Some(Utc::now().to_rfc3339());
            }
            existing.status = status;
            existing.reason = Some(reason.to_owned());
            existing.message = Some(message.to_owned());
            true
        }
    }
}

/// Folds a machine set's observed state into the pool status entry.
pub fn machine_set_summary(machine_set: &MachineSet) -> MachineSetSummary {
    let bounds = autoscaling_bounds(machine_set);
    let status = machine_set.status.as_ref();
    MachineSetSummary {
        name: kube::ResourceExt::name_any(machine_set),
        replicas: machine_set.spec.replicas,
        min_replicas: bounds.map(|b| b.min),
        max_replicas: bounds.map(|b| b.max),
        ready_replicas: status.and_then(|s| s.ready_replicas),
        error_reason: status.and_then(|s| s.error_reason.clone()),
        error_message: status.and_then(|s| s.error_message.clone()),
    }
}

/// Summarizes failed machines into one (reason, message) pair.
///
/// A single failure is propagated as-is; several are rolled up under
/// `MultipleMachinesFailed` so the pool status stays bounded.
pub fn summarize_machine_failures(machines: &[Machine]) -> Option<(String, String)> {
    let failed: Vec<&Machine> = machines.iter().filter(|m| m.is_failed()).collect();
    match failed.as_slice() {
        [] => None,
        [machine] => {
            let status = machine.status.as_ref();
            Some((
                status
                    .and_then(|s| s.error_reason.clone())
                    .unwrap_or_else(|| "MachineFailed".to_owned()),
                status
                    .and_then(|s| s.error_message.clone())
                    .unwrap_or_default(),
            ))
        }
        many => {
            let message = many
                .iter()
                .map(|machine| {
                    let status = machine.status.as_ref();
                    format!(
                        "Machine {name} failed ({reason}): {message},",
                        name = kube::ResourceExt::name_any(*machine),
                        reason = status
                            .and_then(|s| s.error_reason.as_deref())
                            .unwrap_or("Unknown"),
                        message = status
                            .and_then(|s| s.error_message.as_deref())
                            .unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>()
                .join(" ");
            Some((REASON_MULTIPLE_MACHINES_FAILED.to_owned(), message))
        }
    }
}

/// A machine set is steady once its observed replicas match its spec and no
/// error is reported. Unsteady sets keep the pool on the short requeue.
pub fn machine_set_steady(machine_set: &MachineSet) -> bool {
    let Some(status) = machine_set.status.as_ref() else {
        return false;
    };
    status.error_reason.is_none()
        && machine_set.spec.replicas.is_some()
        && status.ready_replicas == machine_set.spec.replicas
}
