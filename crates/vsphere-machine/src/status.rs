//! Provider status condition bookkeeping

use chrono::Utc;

use machine_api_common::crd::{ConditionStatus, ProviderCondition, VSphereMachineProviderStatus};

/// Insert or update a condition by type
///
/// `lastProbeTime` always moves forward. `lastTransitionTime` only moves when
/// the status flips, so a condition that keeps reporting the same status keeps
/// the time it first entered it.
pub fn set_condition(status: &mut VSphereMachineProviderStatus, condition: ProviderCondition) {
    let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition.type_)
    else {
        status.conditions.push(condition);
        return;
    };

    let now = Utc::now();
    if existing.status != condition.status {
        existing.last_transition_time = Some(now);
    }
    existing.status = condition.status;
    existing.reason = condition.reason;
    existing.message = condition.message;
    existing.last_probe_time = Some(now);
}

/// Condition of the given type, if present
pub fn condition<'a>(
    status: &'a VSphereMachineProviderStatus,
    type_: &str,
) -> Option<&'a ProviderCondition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is `True`
pub fn is_true(status: &VSphereMachineProviderStatus, type_: &str) -> bool {
    condition(status, type_).is_some_and(|c| c.status == ConditionStatus::True)
}
