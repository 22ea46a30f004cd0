//! In-memory `OrderStore` used by unit and API tests. It applies the exact
//! same rule set as the SQL store: the pure lifecycle / reconciliation /
//! visibility modules, with a fault-injection switch for atomicity tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use optia_core::{Caller, CoreError, CoreResult, PagedResult};
use optia_shared::pii::Masked;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::history::{self, HistoryView};
use crate::lifecycle;
use crate::models::{
    LabBoardRow, LineItem, LineItemsView, NewLineItem, NewOrder, NewPayment, Order, OrderDetail,
    OrderQuery, OrderRow, OrderStatus, PatientSummary, PatientVisitRow, Payment, RxMeasurement,
    Selection, StatusEvent, TransitionCommand, VisualAcuity,
};
use crate::reconcile;
use crate::visibility::OrderScope;

#[derive(Clone)]
struct PatientRec {
    tenant_id: Uuid,
    name: String,
    phone: Option<String>,
}

#[derive(Clone)]
struct BranchRec {
    tenant_id: Uuid,
    name: String,
}

struct OrderRecord {
    order: Order,
    line_items: Vec<LineItem>,
    payments: Vec<Payment>,
    events: Vec<StatusEvent>,
    acuities: Vec<VisualAcuity>,
    rx: Vec<RxMeasurement>,
    selections: Vec<Selection>,
}

#[derive(Default)]
struct Inner {
    patients: HashMap<Uuid, PatientRec>,
    branches: HashMap<Uuid, BranchRec>,
    orders: HashMap<Uuid, OrderRecord>,
    fail_next_write: bool,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    inner: Mutex<Inner>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_patient(&self, tenant_id: Uuid, name: &str, phone: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().patients.insert(
            id,
            PatientRec {
                tenant_id,
                name: name.to_string(),
                phone: phone.map(str::to_string),
            },
        );
        id
    }

    pub fn seed_branch(&self, tenant_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().branches.insert(
            id,
            BranchRec {
                tenant_id,
                name: name.to_string(),
            },
        );
        id
    }

    /// Make the next mutating operation fail mid-write, as a store-level
    /// fault would; used to verify nothing partial survives a rollback.
    pub fn fail_next_write(&self) {
        self.lock().fail_next_write = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_write)
    }

    /// Resolve an order under the caller's tenant and visibility scope.
    /// Anything outside the scope reports `NotFound`, not `Forbidden`.
    fn visible_order(&self, caller: &Caller, id: Uuid) -> CoreResult<&OrderRecord> {
        let record = self.orders.get(&id).ok_or(CoreError::NotFound)?;
        if record.order.tenant_id != caller.tenant_id {
            return Err(CoreError::NotFound);
        }
        if !OrderScope::for_role(caller.role).permits(&record.order) {
            return Err(CoreError::NotFound);
        }
        Ok(record)
    }

    fn patient(&self, tenant_id: Uuid, id: Uuid) -> Option<&PatientRec> {
        self.patients
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id)
    }

    fn branch_name(&self, tenant_id: Uuid, id: Uuid) -> String {
        self.branches
            .get(&id)
            .filter(|b| b.tenant_id == tenant_id)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| "Branch unavailable".to_string())
    }
}

#[async_trait]
impl crate::store::OrderStore for MemoryOrderStore {
    async fn create_order(&self, caller: &Caller, new: NewOrder) -> CoreResult<Uuid> {
        lifecycle::ensure_identity(caller)?;
        let mut inner = self.lock();
        if inner.patient(caller.tenant_id, new.patient_id).is_none() {
            return Err(CoreError::Validation("Unknown patient".into()));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = Order {
            id: order_id,
            tenant_id: caller.tenant_id,
            branch_id: caller.branch_id,
            patient_id: new.patient_id,
            created_by: caller.user_id,
            created_by_name: caller.user_name.clone(),
            created_at: now,
            status: OrderStatus::Created,
            observations: new.observations,
            total: new.total,
            amount_paid: Decimal::ZERO,
            balance_due: reconcile::balance_due(new.total, Decimal::ZERO),
            sent_to_lab_at: None,
            estimated_delivery_at: None,
            received_at_branch_at: None,
            delivered_at: None,
        };

        let acuities = new
            .acuities
            .into_iter()
            .map(|a| VisualAcuity {
                id: Uuid::new_v4(),
                order_id,
                condition: a.condition,
                eye: a.eye,
                denominator: a.denominator.clamp(10, 200),
            })
            .collect();
        let rx = new
            .rx
            .into_iter()
            .map(|r| RxMeasurement {
                id: Uuid::new_v4(),
                order_id,
                eye: r.eye,
                distance: r.distance,
                sph: r.sph,
                cyl: r.cyl,
                axis: r.axis,
                add: r.add,
                pd: r.pd,
                seg_height: r.seg_height,
            })
            .collect();
        let selections = new
            .selections
            .into_iter()
            .map(|s| Selection {
                id: Uuid::new_v4(),
                order_id,
                kind: s.kind,
                reference_id: s.reference_id,
                brand: s.brand,
                model: s.model,
                note: s.note,
            })
            .collect();

        inner.orders.insert(
            order_id,
            OrderRecord {
                order,
                line_items: Vec::new(),
                payments: Vec::new(),
                events: Vec::new(),
                acuities,
                rx,
                selections,
            },
        );
        Ok(order_id)
    }

    async fn get_order(&self, caller: &Caller, id: Uuid) -> CoreResult<OrderDetail> {
        let inner = self.lock();
        let record = inner.visible_order(caller, id)?;
        let patient = inner
            .patient(caller.tenant_id, record.order.patient_id)
            .ok_or(CoreError::NotFound)?;
        Ok(OrderDetail {
            order: record.order.clone(),
            patient: PatientSummary {
                id: record.order.patient_id,
                name: patient.name.clone(),
                phone: patient.phone.clone().map(Masked),
            },
            branch_name: inner.branch_name(caller.tenant_id, record.order.branch_id),
            line_items: record.line_items.clone(),
            payments: record.payments.clone(),
            acuities: record.acuities.clone(),
            rx: record.rx.clone(),
            selections: record.selections.clone(),
        })
    }

    async fn transition(
        &self,
        caller: &Caller,
        id: Uuid,
        cmd: TransitionCommand,
    ) -> CoreResult<StatusEvent> {
        lifecycle::ensure_identity(caller)?;
        let mut inner = self.lock();
        let record = inner.visible_order(caller, id)?;

        let plan = lifecycle::plan_transition(record.order.status, &cmd)?;
        let now = Utc::now();
        let mut updated = record.order.clone();
        updated.status = plan.to;
        lifecycle::stamp_milestones(&mut updated, plan.to, now);
        let event = lifecycle::build_event(&updated, caller, &plan, &cmd, now);

        // All-or-nothing: a simulated store fault discards the staged order
        // and event together, leaving the record untouched.
        if inner.take_fault() {
            return Err(CoreError::TransitionFailed);
        }
        let record = inner
            .orders
            .get_mut(&id)
            .ok_or(CoreError::TransitionFailed)?;
        record.order = updated;
        record.events.push(event.clone());
        Ok(event)
    }

    async fn get_history(&self, caller: &Caller, id: Uuid) -> CoreResult<HistoryView> {
        let inner = self.lock();
        let record = inner.visible_order(caller, id)?;
        let patient = inner
            .patient(caller.tenant_id, record.order.patient_id)
            .ok_or(CoreError::NotFound)?;

        let mut events = record.events.clone();
        events.sort_by_key(|e| e.timestamp);
        Ok(HistoryView {
            patient_name: patient.name.clone(),
            patient_phone: patient.phone.clone().map(Masked),
            branch_name: inner.branch_name(caller.tenant_id, record.order.branch_id),
            created_by_name: record.order.created_by_name.clone(),
            visit_date: record.order.created_at,
            steps: history::build_steps(&events, Utc::now()),
        })
    }

    async fn replace_line_items(
        &self,
        caller: &Caller,
        id: Uuid,
        items: Vec<NewLineItem>,
    ) -> CoreResult<LineItemsView> {
        lifecycle::ensure_identity(caller)?;
        reconcile::validate_line_items(&items)?;

        let mut inner = self.lock();
        inner.visible_order(caller, id)?;
        if inner.take_fault() {
            return Err(CoreError::Persistence("injected store fault".into()));
        }

        let now = Utc::now();
        let total = reconcile::line_items_total(&items);
        let record = inner.orders.get_mut(&id).ok_or(CoreError::NotFound)?;
        record.line_items = items
            .into_iter()
            .map(|i| LineItem {
                id: Uuid::new_v4(),
                tenant_id: caller.tenant_id,
                order_id: id,
                label: i.label.trim().to_string(),
                amount: i.amount,
                user_id: caller.user_id,
                user_name: caller.user_name.clone(),
                branch_id: caller.branch_id,
                created_at: now,
                note: i.note.filter(|n| !n.trim().is_empty()),
            })
            .collect();

        // Re-pricing keeps existing payments in the reconciliation rather
        // than zeroing them out (see DESIGN.md).
        let paid = reconcile::payments_total(&record.payments);
        record.order.total = Some(total);
        record.order.amount_paid = paid;
        record.order.balance_due = reconcile::balance_due(Some(total), paid);

        Ok(LineItemsView {
            order_id: id,
            total,
            items: record.line_items.clone(),
        })
    }

    async fn add_payments(
        &self,
        caller: &Caller,
        id: Uuid,
        payments: Vec<NewPayment>,
    ) -> CoreResult<()> {
        let methods = reconcile::parse_payment_methods(&payments)?;

        let mut inner = self.lock();
        inner.visible_order(caller, id)?;
        if inner.take_fault() {
            return Err(CoreError::Persistence("injected store fault".into()));
        }

        let now = Utc::now();
        let record = inner.orders.get_mut(&id).ok_or(CoreError::NotFound)?;
        for (payment, method) in payments.into_iter().zip(methods) {
            record.payments.push(Payment {
                id: Uuid::new_v4(),
                tenant_id: caller.tenant_id,
                order_id: id,
                method,
                amount: payment.amount,
                authorization: payment.authorization,
                note: payment.note,
                created_at: now,
            });
        }
        let paid = reconcile::payments_total(&record.payments);
        record.order.amount_paid = paid;
        record.order.balance_due = reconcile::balance_due(record.order.total, paid);
        Ok(())
    }

    async fn list_payments(&self, caller: &Caller, id: Uuid) -> CoreResult<Vec<Payment>> {
        let inner = self.lock();
        let record = inner.visible_order(caller, id)?;
        let mut payments = record.payments.clone();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn list_orders(
        &self,
        caller: &Caller,
        query: OrderQuery,
    ) -> CoreResult<PagedResult<OrderRow>> {
        let inner = self.lock();
        let scope = OrderScope::for_role(caller.role);
        let needle = query
            .search
            .as_deref()
            .map(str::to_lowercase)
            .filter(|s| !s.is_empty());

        let mut matches: Vec<&OrderRecord> = inner
            .orders
            .values()
            .filter(|r| r.order.tenant_id == caller.tenant_id)
            .filter(|r| scope.permits(&r.order))
            .filter(|r| query.status.map_or(true, |s| r.order.status == s))
            .filter(|r| match &needle {
                Some(n) => inner
                    .patient(caller.tenant_id, r.order.patient_id)
                    .map_or(false, |p| p.name.to_lowercase().contains(n)),
                None => true,
            })
            .collect();
        matches.sort_by(|a, b| b.order.created_at.cmp(&a.order.created_at));

        let total = matches.len() as i64;
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let offset = ((page - 1) * page_size) as usize;

        let items = matches
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .map(|r| {
                let last = r.events.iter().max_by_key(|e| e.timestamp);
                OrderRow {
                    id: r.order.id,
                    created_at: r.order.created_at,
                    patient_name: inner
                        .patient(caller.tenant_id, r.order.patient_id)
                        .map(|p| p.name.clone())
                        .unwrap_or_default(),
                    user_name: r.order.created_by_name.clone(),
                    status: r.order.status,
                    total: r.order.total,
                    amount_paid: r.order.amount_paid,
                    balance_due: r.order.balance_due,
                    branch_name: inner.branch_name(caller.tenant_id, r.order.branch_id),
                    lab_kind: last.and_then(|e| e.lab_kind),
                    lab_name: last.and_then(|e| e.lab_name.clone()),
                    last_status_at: last.map(|e| e.timestamp),
                }
            })
            .collect();

        Ok(PagedResult::new(items, page, page_size, total))
    }

    async fn list_at_lab(&self, caller: &Caller, limit: i64) -> CoreResult<Vec<LabBoardRow>> {
        let inner = self.lock();
        let scope = OrderScope::for_role(caller.role);
        let mut rows: Vec<LabBoardRow> = inner
            .orders
            .values()
            .filter(|r| r.order.tenant_id == caller.tenant_id)
            .filter(|r| r.order.status == OrderStatus::SentToLab)
            .filter(|r| scope.permits(&r.order))
            .map(|r| {
                let total = r.order.total.unwrap_or(Decimal::ZERO);
                let paid = reconcile::payments_total(&r.payments);
                let patient = inner.patient(caller.tenant_id, r.order.patient_id);
                LabBoardRow {
                    id: r.order.id,
                    sent_to_lab_at: r.order.sent_to_lab_at,
                    patient_name: patient.map(|p| p.name.clone()).unwrap_or_default(),
                    patient_phone: patient.and_then(|p| p.phone.clone()).map(Masked),
                    total,
                    amount_paid: paid,
                    balance_due: total - paid,
                    observations: r.order.observations.clone(),
                    estimated_delivery_at: r.order.estimated_delivery_at,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.sent_to_lab_at.cmp(&a.sent_to_lab_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_for_patient(
        &self,
        caller: &Caller,
        patient_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<PatientVisitRow>> {
        let inner = self.lock();
        let scope = OrderScope::for_role(caller.role);
        let mut rows: Vec<PatientVisitRow> = inner
            .orders
            .values()
            .filter(|r| r.order.tenant_id == caller.tenant_id)
            .filter(|r| r.order.patient_id == patient_id)
            .filter(|r| scope.permits(&r.order))
            .map(|r| {
                let paid = reconcile::payments_total(&r.payments);
                PatientVisitRow {
                    id: r.order.id,
                    created_at: r.order.created_at,
                    status: r.order.status,
                    total: r.order.total,
                    amount_paid: paid,
                    balance_due: reconcile::balance_due(r.order.total, paid),
                    branch_name: inner.branch_name(caller.tenant_id, r.order.branch_id),
                    user_name: r.order.created_by_name.clone(),
                }
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
