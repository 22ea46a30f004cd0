//! Visibility guard: narrows which orders a caller may read or mutate.
//!
//! The same scope is applied on every read and write path, so an order a
//! caller cannot see cannot be mutated by them either; out-of-scope lookups
//! surface as `NotFound` rather than leaking that the order exists.

use optia_core::Role;

use crate::models::{Order, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    /// Any order, any branch.
    Any,
    /// Orders belonging to one branch.
    Branch(uuid::Uuid),
    /// Orders currently in one status, regardless of branch.
    Status(OrderStatus),
}

impl OrderScope {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Admin => OrderScope::Any,
            Role::Courier => OrderScope::Status(OrderStatus::ReadyForDispatch),
            Role::BranchScoped(branch_id) => OrderScope::Branch(branch_id),
        }
    }

    /// In-process check used by the in-memory store; the SQL store expresses
    /// the same predicate as a WHERE clause.
    pub fn permits(&self, order: &Order) -> bool {
        match *self {
            OrderScope::Any => true,
            OrderScope::Branch(branch_id) => order.branch_id == branch_id,
            OrderScope::Status(status) => order.status == status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn order(branch_id: Uuid, status: OrderStatus) -> Order {
        Order {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            branch_id,
            patient_id: Uuid::new_v4(),
            created_by: Uuid::new_v4(),
            created_by_name: "Ana".into(),
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
    fn admin_sees_everything() {
        let scope = OrderScope::for_role(Role::Admin);
        assert!(scope.permits(&order(Uuid::new_v4(), OrderStatus::Created)));
        assert!(scope.permits(&order(Uuid::new_v4(), OrderStatus::DeliveredToCustomer)));
    }

    #[test]
    fn courier_sees_only_ready_for_dispatch() {
        let scope = OrderScope::for_role(Role::Courier);
        assert!(scope.permits(&order(Uuid::new_v4(), OrderStatus::ReadyForDispatch)));
        assert!(!scope.permits(&order(Uuid::new_v4(), OrderStatus::Created)));
        assert!(!scope.permits(&order(Uuid::new_v4(), OrderStatus::InTransitToBranch)));
    }

    #[test]
    fn branch_scope_matches_branch_only() {
        let home = Uuid::new_v4();
        let scope = OrderScope::for_role(Role::BranchScoped(home));
        assert!(scope.permits(&order(home, OrderStatus::Created)));
        assert!(!scope.permits(&order(Uuid::new_v4(), OrderStatus::Created)));
        // Status is irrelevant for branch scoping.
        assert!(scope.permits(&order(home, OrderStatus::ReadyForDispatch)));
    }
}
