//! Extra reconcile triggers: the jittered periodic source and the
//! update-event filter on the pool watch.

use std::{hash::Hasher, time::Duration};

use fnv::FnvHasher;
use futures::{stream, Stream};
use rand::Rng;

use crate::crd::{ConditionStatus, MachinePool, MachinePoolConditionType};

/// Closed-loop convergence interval. No watch is wired back from the target
/// cluster, so every pool is re-reconciled this often.
pub const SYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

const JITTER: f64 = 0.10;

/// Ticks roughly every `period`, jittered by ±10% to desynchronize large
/// pool populations.
pub fn periodic_ticks(period: Duration) -> impl Stream<Item = ()> {
    stream::unfold(period, |period| async move {
        let factor = rand::thread_rng().gen_range(1.0 - JITTER..1.0 + JITTER);
        tokio::time::sleep(period.mul_f64(factor)).await;
        Some(((), period))
    })
}

/// Fingerprint of the error-class conditions of a pool.
///
/// Used as the watch predicate on pool updates: an update is admitted only
/// when this hash moves, i.e. when an error condition becomes true or
/// changes its reason or message. Status-only churn hashes identically and
/// never wakes the queue; ordinary spec edits arrive through the periodic
/// source instead.
pub fn error_condition_fingerprint(pool: &MachinePool) -> Option<u64> {
    let mut hasher = FnvHasher::with_key(0);
    for type_ in [
        MachinePoolConditionType::InvalidSubnets,
        MachinePoolConditionType::UnsupportedConfiguration,
    ] {
        let Some(condition) = pool.condition(type_) else {
            continue;
        };
        if condition.status != ConditionStatus::True {
            continue;
        }
        hasher.write(type_.to_string().as_bytes());
        hasher.write(condition.reason.as_deref().unwrap_or_default().as_bytes());
        hasher.write(condition.message.as_deref().unwrap_or_default().as_bytes());
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachinePoolCondition, MachinePoolStatus};

    fn pool() -> MachinePool {
        serde_yaml::from_str(
            r#"
            apiVersion: hive.openshift.io/v1
            kind: MachinePool
            metadata:
              name: prod-worker
              namespace: hive
            spec:
              clusterDeploymentRef:
                name: prod
              name: worker
              replicas: 3
              platform:
                aws:
                  instanceType: m5.large
            "#,
        )
        .expect("illegal test input")
    }

    fn with_condition(
        mut pool: MachinePool,
        type_: MachinePoolConditionType,
        status: ConditionStatus,
        reason: &str,
    ) -> MachinePool {
        pool.status
            .get_or_insert_with(MachinePoolStatus::default)
            .conditions
            .push(MachinePoolCondition {
                type_,
                status,
                reason: Some(reason.to_owned()),
                message: None,
                last_transition_time: None,
            });
        pool
    }

    #[test]
    fn status_noise_does_not_move_the_fingerprint() {
        let plain = pool();
        let mut noisy = pool();
        noisy.status = Some(MachinePoolStatus {
            replicas: Some(5),
            ..MachinePoolStatus::default()
        });
        // a false error condition is as quiet as none at all
        let noisy = with_condition(
            noisy,
            MachinePoolConditionType::InvalidSubnets,
            ConditionStatus::False,
            "ValidSubnets",
        );
        assert_eq!(
            error_condition_fingerprint(&plain),
            error_condition_fingerprint(&noisy)
        );
    }

    #[test]
    fn newly_true_error_conditions_are_admitted() {
        let before = pool();
        let after = with_condition(
            pool(),
            MachinePoolConditionType::InvalidSubnets,
            ConditionStatus::True,
            "SubnetCountMismatch",
        );
        assert_ne!(
            error_condition_fingerprint(&before),
            error_condition_fingerprint(&after)
        );
    }

    #[test]
    fn reason_changes_on_a_true_condition_are_admitted() {
        let first = with_condition(
            pool(),
            MachinePoolConditionType::UnsupportedConfiguration,
            ConditionStatus::True,
            "PlatformMismatch",
        );
        let second = with_condition(
            pool(),
            MachinePoolConditionType::UnsupportedConfiguration,
            ConditionStatus::True,
            "UnsupportedPlatform",
        );
        assert_ne!(
            error_condition_fingerprint(&first),
            error_condition_fingerprint(&second)
        );
    }

    #[test]
    fn non_error_conditions_never_wake_the_queue() {
        let before = pool();
        let after = with_condition(
            pool(),
            MachinePoolConditionType::NotEnoughReplicas,
            ConditionStatus::True,
            "MinReplicasTooSmall",
        );
        assert_eq!(
            error_condition_fingerprint(&before),
            error_condition_fingerprint(&after)
        );
    }
}
