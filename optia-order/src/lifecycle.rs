//! The status state machine: strict single-step advancement, per-status
//! validation, milestone stamping and audit-event construction.
//!
//! These rules are pure so every `OrderStore` backend applies exactly the
//! same semantics inside its own transaction.

use chrono::{DateTime, Duration, Utc};
use optia_core::{Caller, CoreError, CoreResult};
use uuid::Uuid;

use crate::models::{LabKind, Order, OrderStatus, StatusEvent, TransitionCommand};

/// Default lead time stamped on `estimated_delivery_at` when a job comes out
/// of the lab without an explicit estimate.
pub const ESTIMATED_DELIVERY_DAYS: i64 = 3;

/// A validated transition, ready to be persisted atomically.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPlan {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub lab_kind: Option<LabKind>,
}

/// The caller's identity must be derivable before any transition is recorded;
/// audit rows always carry who acted.
pub fn ensure_identity(caller: &Caller) -> CoreResult<()> {
    if caller.user_id.is_nil() || caller.user_name.trim().is_empty() {
        return Err(CoreError::Unauthenticated);
    }
    Ok(())
}

/// Validate a requested status change against the current status.
///
/// Checks run in order: the destination must be a defined status, must be
/// exactly `current + 1` (no skipping, no regression, no lateral moves), and
/// SentToLab additionally requires a lab kind. Nothing is mutated here.
pub fn plan_transition(current: OrderStatus, cmd: &TransitionCommand) -> CoreResult<TransitionPlan> {
    let to = OrderStatus::try_from(cmd.to_status)?;

    if to.ordinal() != current.ordinal() + 1 {
        return Err(CoreError::IllegalTransition {
            current: current.ordinal(),
            expected: current.ordinal() + 1,
        });
    }

    let lab_kind = if to == OrderStatus::SentToLab {
        Some(require_lab_kind(cmd)?)
    } else {
        None
    };

    Ok(TransitionPlan {
        from: current,
        to,
        lab_kind,
    })
}

fn require_lab_kind(cmd: &TransitionCommand) -> CoreResult<LabKind> {
    match cmd.lab_kind.as_deref().map(str::trim) {
        None | Some("") => Err(CoreError::Validation(
            "LabKind is required for 'Sent to lab'".into(),
        )),
        Some("Internal") => Ok(LabKind::Internal),
        Some("External") => Ok(LabKind::External),
        Some(_) => Err(CoreError::Validation(
            "LabKind must be 'Internal' or 'External'".into(),
        )),
    }
}

/// Stamp the milestone timestamp associated with the destination status, if
/// any and if unset. First write wins; re-processing never overwrites.
pub fn stamp_milestones(order: &mut Order, to: OrderStatus, now: DateTime<Utc>) {
    match to {
        OrderStatus::SentToLab => {
            order.sent_to_lab_at.get_or_insert(now);
        }
        OrderStatus::ReadyAtLab => {
            order
                .estimated_delivery_at
                .get_or_insert(now + Duration::days(ESTIMATED_DELIVERY_DAYS));
        }
        OrderStatus::ReceivedAtBranch => {
            order.received_at_branch_at.get_or_insert(now);
        }
        OrderStatus::DeliveredToCustomer => {
            order.delivered_at.get_or_insert(now);
        }
        _ => {}
    }
}

/// Build the audit event for a planned transition. Lab fields are recorded
/// only when the destination is SentToLab.
pub fn build_event(
    order: &Order,
    caller: &Caller,
    plan: &TransitionPlan,
    cmd: &TransitionCommand,
    now: DateTime<Utc>,
) -> StatusEvent {
    let at_lab = plan.to == OrderStatus::SentToLab;
    StatusEvent {
        id: Uuid::new_v4(),
        tenant_id: order.tenant_id,
        order_id: order.id,
        from_status: plan.from,
        to_status: plan.to,
        user_id: caller.user_id,
        user_name: caller.user_name.clone(),
        branch_id: caller.branch_id,
        timestamp: now,
        note: cmd.note.clone(),
        lab_kind: plan.lab_kind,
        lab_id: if at_lab { cmd.lab_id } else { None },
        lab_name: if at_lab { cmd.lab_name.clone() } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optia_core::Role;
    use rust_decimal::Decimal;

    fn cmd(to: i16) -> TransitionCommand {
        TransitionCommand {
            to_status: to,
            note: None,
            lab_kind: None,
            lab_id: None,
            lab_name: None,
        }
    }

    fn order_at(status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            created_by: Uuid::new_v4(),
            created_by_name: "Ana Torres".into(),
            created_at: Utc::now(),
            status,
            observations: None,
            total: None,
            amount_paid: Decimal::ZERO,
            balance_due: Decimal::ZERO,
            sent_to_lab_at: None,
            estimated_delivery_at: None,
            received_at_branch_at: None,
            delivered_at: None,
        }
    }

    #[test]
    fn only_the_next_status_is_allowed() {
        // For every status, every destination except current + 1 must fail.
        for current_ord in 0..=10i16 {
            let current = OrderStatus::try_from(current_ord).unwrap();
            for attempted in 0..=10i16 {
                let result = plan_transition(current, &cmd(attempted));
                if attempted == current_ord + 1 && attempted != 5 {
                    assert!(result.is_ok(), "{current_ord} -> {attempted} should pass");
                } else if attempted == current_ord + 1 {
                    // SentToLab needs a lab kind, checked separately below.
                    assert!(matches!(result, Err(CoreError::Validation(_))));
                } else {
                    match result {
                        Err(CoreError::IllegalTransition { current, expected }) => {
                            assert_eq!(current, current_ord);
                            assert_eq!(expected, current_ord + 1);
                        }
                        other => panic!("{current_ord} -> {attempted}: {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn undefined_status_is_rejected_before_sequencing() {
        assert!(matches!(
            plan_transition(OrderStatus::Created, &cmd(11)),
            Err(CoreError::InvalidStatus(11))
        ));
        assert!(matches!(
            plan_transition(OrderStatus::Created, &cmd(-3)),
            Err(CoreError::InvalidStatus(-3))
        ));
    }

    #[test]
    fn sent_to_lab_requires_lab_kind() {
        let mut c = cmd(5);
        assert!(matches!(
            plan_transition(OrderStatus::ReceivedAtBranch, &c),
            Err(CoreError::Validation(_))
        ));

        c.lab_kind = Some("Offsite".into());
        assert!(matches!(
            plan_transition(OrderStatus::ReceivedAtBranch, &c),
            Err(CoreError::Validation(_))
        ));

        c.lab_kind = Some("Internal".into());
        let plan = plan_transition(OrderStatus::ReceivedAtBranch, &c).unwrap();
        assert_eq!(plan.lab_kind, Some(LabKind::Internal));
    }

    #[test]
    fn milestone_stamps_are_first_write_wins() {
        let mut order = order_at(OrderStatus::ReceivedAtBranch);
        let first = Utc::now();
        stamp_milestones(&mut order, OrderStatus::SentToLab, first);
        assert_eq!(order.sent_to_lab_at, Some(first));

        let later = first + Duration::hours(6);
        stamp_milestones(&mut order, OrderStatus::SentToLab, later);
        assert_eq!(order.sent_to_lab_at, Some(first), "must not overwrite");
    }

    #[test]
    fn ready_at_lab_defaults_estimated_delivery() {
        let mut order = order_at(OrderStatus::SentToLab);
        let now = Utc::now();
        stamp_milestones(&mut order, OrderStatus::ReadyAtLab, now);
        assert_eq!(
            order.estimated_delivery_at,
            Some(now + Duration::days(ESTIMATED_DELIVERY_DAYS))
        );

        // An estimate already on record is kept.
        let explicit = now + Duration::days(10);
        let mut order = order_at(OrderStatus::SentToLab);
        order.estimated_delivery_at = Some(explicit);
        stamp_milestones(&mut order, OrderStatus::ReadyAtLab, now);
        assert_eq!(order.estimated_delivery_at, Some(explicit));
    }

    #[test]
    fn event_carries_lab_fields_only_for_sent_to_lab() {
        let order = order_at(OrderStatus::ReceivedAtBranch);
        let caller = Caller {
            user_id: Uuid::new_v4(),
            user_name: "Ana Torres".into(),
            tenant_id: order.tenant_id,
            branch_id: order.branch_id,
            role: Role::Admin,
        };
        let lab_id = Uuid::new_v4();
        let mut c = cmd(5);
        c.lab_kind = Some("External".into());
        c.lab_id = Some(lab_id);
        c.lab_name = Some("VisionWorks".into());

        let plan = plan_transition(order.status, &c).unwrap();
        let event = build_event(&order, &caller, &plan, &c, Utc::now());
        assert_eq!(event.lab_kind, Some(LabKind::External));
        assert_eq!(event.lab_id, Some(lab_id));
        assert_eq!(event.lab_name.as_deref(), Some("VisionWorks"));

        // Any other destination drops the lab fields even if supplied.
        let order = order_at(OrderStatus::Created);
        let mut c = cmd(1);
        c.lab_id = Some(lab_id);
        c.lab_name = Some("VisionWorks".into());
        let plan = plan_transition(order.status, &c).unwrap();
        let event = build_event(&order, &caller, &plan, &c, Utc::now());
        assert_eq!(event.lab_kind, None);
        assert_eq!(event.lab_id, None);
        assert_eq!(event.lab_name, None);
    }

    #[test]
    fn blank_identity_is_unauthenticated() {
        let caller = Caller {
            user_id: Uuid::nil(),
            user_name: "Ana".into(),
            tenant_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(matches!(
            ensure_identity(&caller),
            Err(CoreError::Unauthenticated)
        ));

        let caller = Caller {
            user_id: Uuid::new_v4(),
            user_name: "  ".into(),
            ..caller
        };
        assert!(matches!(
            ensure_identity(&caller),
            Err(CoreError::Unauthenticated)
        ));
    }
}
