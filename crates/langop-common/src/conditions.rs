//! Condition ledger
//!
//! Upsert semantics for status conditions keyed by type. A condition's
//! `lastTransitionTime` only moves when its status flips; reason, message
//! and observed generation are refreshed in place.

use crate::crd::{Condition, ConditionStatus};

/// Condition type every resource reports
pub const CONDITION_READY: &str = "Ready";
/// Whether the cluster's CNI enforces the compiled NetworkPolicy
pub const CONDITION_NETWORK_POLICY_ENFORCED: &str = "NetworkPolicyEnforced";
/// Whether every declared egress peer resolved on the last pass
pub const CONDITION_EGRESS_RESOLVED: &str = "EgressResolved";
/// Whether agent code synthesis succeeded
pub const CONDITION_SYNTHESIZED: &str = "Synthesized";
/// Whether a cluster's webhook domain is valid
pub const CONDITION_DNS_CONFIGURED: &str = "DNSConfigured";

/// Insert or update the condition of the given type
///
/// Returns `true` when anything about the ledger changed, so callers can
/// skip a status write on a no-op.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    generation: i64,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) if existing.status == status => {
            let changed = existing.reason != reason
                || existing.message != message
                || existing.observed_generation != generation;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = generation;
            changed
        }
        Some(existing) => {
            *existing = Condition::new(type_, status, reason, message, generation);
            true
        }
        None => {
            conditions.push(Condition::new(type_, status, reason, message, generation));
            true
        }
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn backdated(mut cond: Condition) -> Condition {
        cond.last_transition_time = Utc::now() - Duration::hours(1);
        cond
    }

    #[test]
    fn inserts_missing_condition() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            CONDITION_READY,
            ConditionStatus::True,
            "ReconcileSuccess",
            "ok",
            1
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(
            find_condition(&conditions, CONDITION_READY).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    /// Story: reason churn on a steady status never looks like a transition
    #[test]
    fn story_unchanged_status_preserves_transition_time() {
        let original = backdated(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ServiceError",
            "service apply failed",
            1,
        ));
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        let changed = set_condition(
            &mut conditions,
            CONDITION_READY,
            ConditionStatus::False,
            "NetworkPolicyError",
            "policy apply failed",
            2,
        );

        assert!(changed);
        let cond = find_condition(&conditions, CONDITION_READY).unwrap();
        assert_eq!(cond.last_transition_time, stamp);
        assert_eq!(cond.reason, "NetworkPolicyError");
        assert_eq!(cond.observed_generation, 2);
    }

    #[test]
    fn status_flip_refreshes_transition_time() {
        let original = backdated(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "ServiceError",
            "failed",
            1,
        ));
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(
            &mut conditions,
            CONDITION_READY,
            ConditionStatus::True,
            "ReconcileSuccess",
            "ok",
            1,
        );

        assert!(conditions[0].last_transition_time > stamp);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn identical_update_reports_no_change() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "X", ConditionStatus::Unknown, "R", "m", 4);
        assert!(!set_condition(
            &mut conditions,
            "X",
            ConditionStatus::Unknown,
            "R",
            "m",
            4
        ));
    }

    #[test]
    fn other_types_are_never_removed() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "A", ConditionStatus::True, "R", "m", 1);
        set_condition(&mut conditions, "B", ConditionStatus::False, "R", "m", 1);
        set_condition(&mut conditions, "A", ConditionStatus::False, "R2", "m2", 2);
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "B").is_some());
    }
}
