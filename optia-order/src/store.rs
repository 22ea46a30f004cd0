//! The order store contract. Every method takes the explicit caller context
//! and applies the tenant filter plus the caller's visibility scope before
//! touching anything; mutations are atomic within a single backend
//! transaction.

use async_trait::async_trait;
use optia_core::{Caller, CoreResult, PagedResult};
use uuid::Uuid;

use crate::history::HistoryView;
use crate::models::{
    LabBoardRow, LineItemsView, NewLineItem, NewOrder, NewPayment, OrderDetail, OrderQuery,
    OrderRow, PatientVisitRow, Payment, StatusEvent, TransitionCommand,
};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Create an order in the initial status with empty financial fields
    /// (apart from an optional quoted total) and its clinical children.
    async fn create_order(&self, caller: &Caller, new: NewOrder) -> CoreResult<Uuid>;

    async fn get_order(&self, caller: &Caller, id: Uuid) -> CoreResult<OrderDetail>;

    /// Validate and apply one status transition atomically: status update,
    /// milestone stamps and the audit event all commit together or not at
    /// all.
    async fn transition(
        &self,
        caller: &Caller,
        id: Uuid,
        cmd: TransitionCommand,
    ) -> CoreResult<StatusEvent>;

    async fn get_history(&self, caller: &Caller, id: Uuid) -> CoreResult<HistoryView>;

    /// Wholesale replacement: delete-all, insert-all, recompute totals, in
    /// one transaction.
    async fn replace_line_items(
        &self,
        caller: &Caller,
        id: Uuid,
        items: Vec<NewLineItem>,
    ) -> CoreResult<LineItemsView>;

    /// Append payments and recompute amount-paid/balance-due atomically.
    async fn add_payments(
        &self,
        caller: &Caller,
        id: Uuid,
        payments: Vec<NewPayment>,
    ) -> CoreResult<()>;

    async fn list_payments(&self, caller: &Caller, id: Uuid) -> CoreResult<Vec<Payment>>;

    async fn list_orders(
        &self,
        caller: &Caller,
        query: OrderQuery,
    ) -> CoreResult<PagedResult<OrderRow>>;

    /// Orders currently dispatched to a lab, newest dispatch first.
    async fn list_at_lab(&self, caller: &Caller, limit: i64) -> CoreResult<Vec<LabBoardRow>>;

    /// A patient's most recent visits, newest first.
    async fn list_for_patient(
        &self,
        caller: &Caller,
        patient_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<PatientVisitRow>>;
}
