//! Postgres-backed `OrderStore`. Visibility scoping is compiled into the
//! WHERE clause of every statement, and each mutation runs in one
//! transaction with the order row locked (`FOR UPDATE`) so concurrent
//! writers serialize on the same order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use optia_core::{Caller, CoreError, CoreResult, PagedResult};
use optia_order::history::{self, HistoryView};
use optia_order::models::{
    AvCondition, Eye, LabBoardRow, LabKind, LineItem, LineItemsView, NewLineItem, NewOrder,
    NewPayment, Order, OrderDetail, OrderQuery, OrderRow, OrderStatus, PatientSummary,
    PatientVisitRow, Payment, PaymentMethod, RxDistance, RxMeasurement, Selection, SelectionKind,
    StatusEvent, TransitionCommand, VisualAcuity,
};
use optia_order::store::OrderStore;
use optia_order::visibility::OrderScope;
use optia_order::{lifecycle, reconcile};
use optia_shared::pii::Masked;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn persistence(e: sqlx::Error) -> CoreError {
    CoreError::Persistence(e.to_string())
}

/// A post-validation write failure during a transition surfaces as
/// `TransitionFailed`; the sqlx detail goes to the log, not the caller.
fn transition_failed(e: sqlx::Error) -> CoreError {
    tracing::error!(error = %e, "status transition could not be persisted");
    CoreError::TransitionFailed
}

/// Append the caller's visibility scope to a statement whose orders table is
/// aliased `o`. The same predicate `OrderScope::permits` applies in memory.
fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: OrderScope) {
    match scope {
        OrderScope::Any => {}
        OrderScope::Branch(branch_id) => {
            qb.push(" AND o.branch_id = ");
            qb.push_bind(branch_id);
        }
        OrderScope::Status(status) => {
            qb.push(" AND o.status = ");
            qb.push_bind(status.ordinal());
        }
    }
}

// ============================================================================
// Row structs for type-safe querying
// ============================================================================

#[derive(sqlx::FromRow)]
struct OrderDb {
    id: Uuid,
    tenant_id: Uuid,
    branch_id: Uuid,
    patient_id: Uuid,
    created_by: Uuid,
    created_by_name: String,
    created_at: DateTime<Utc>,
    status: i16,
    observations: Option<String>,
    total: Option<Decimal>,
    amount_paid: Decimal,
    balance_due: Decimal,
    sent_to_lab_at: Option<DateTime<Utc>>,
    estimated_delivery_at: Option<DateTime<Utc>>,
    received_at_branch_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
}

impl OrderDb {
    fn into_order(self) -> CoreResult<Order> {
        Ok(Order {
            id: self.id,
            tenant_id: self.tenant_id,
            branch_id: self.branch_id,
            patient_id: self.patient_id,
            created_by: self.created_by,
            created_by_name: self.created_by_name,
            created_at: self.created_at,
            status: status_from_db(self.id, self.status)?,
            observations: self.observations,
            total: self.total,
            amount_paid: self.amount_paid,
            balance_due: self.balance_due,
            sent_to_lab_at: self.sent_to_lab_at,
            estimated_delivery_at: self.estimated_delivery_at,
            received_at_branch_at: self.received_at_branch_at,
            delivered_at: self.delivered_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventDb {
    id: Uuid,
    tenant_id: Uuid,
    order_id: Uuid,
    from_status: i16,
    to_status: i16,
    user_id: Uuid,
    user_name: String,
    branch_id: Uuid,
    timestamp: DateTime<Utc>,
    note: Option<String>,
    lab_kind: Option<String>,
    lab_id: Option<Uuid>,
    lab_name: Option<String>,
}

impl EventDb {
    fn into_event(self) -> CoreResult<StatusEvent> {
        Ok(StatusEvent {
            id: self.id,
            tenant_id: self.tenant_id,
            order_id: self.order_id,
            from_status: status_from_db(self.order_id, self.from_status)?,
            to_status: status_from_db(self.order_id, self.to_status)?,
            user_id: self.user_id,
            user_name: self.user_name,
            branch_id: self.branch_id,
            timestamp: self.timestamp,
            note: self.note,
            lab_kind: self.lab_kind.as_deref().and_then(LabKind::parse),
            lab_id: self.lab_id,
            lab_name: self.lab_name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LineItemDb {
    id: Uuid,
    tenant_id: Uuid,
    order_id: Uuid,
    label: String,
    amount: Decimal,
    user_id: Uuid,
    user_name: String,
    branch_id: Uuid,
    created_at: DateTime<Utc>,
    note: Option<String>,
}

impl LineItemDb {
    fn into_line_item(self) -> LineItem {
        LineItem {
            id: self.id,
            tenant_id: self.tenant_id,
            order_id: self.order_id,
            label: self.label,
            amount: self.amount,
            user_id: self.user_id,
            user_name: self.user_name,
            branch_id: self.branch_id,
            created_at: self.created_at,
            note: self.note,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentDb {
    id: Uuid,
    tenant_id: Uuid,
    order_id: Uuid,
    method: String,
    amount: Decimal,
    authorization_code: Option<String>,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

impl PaymentDb {
    fn into_payment(self) -> CoreResult<Payment> {
        let method = PaymentMethod::parse(&self.method).ok_or_else(|| {
            CoreError::Persistence(format!(
                "payment {} carries unknown method '{}'",
                self.id, self.method
            ))
        })?;
        Ok(Payment {
            id: self.id,
            tenant_id: self.tenant_id,
            order_id: self.order_id,
            method,
            amount: self.amount,
            authorization: self.authorization_code,
            note: self.note,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AcuityDb {
    id: Uuid,
    order_id: Uuid,
    condition: String,
    eye: String,
    denominator: i32,
}

impl AcuityDb {
    fn into_acuity(self) -> CoreResult<VisualAcuity> {
        Ok(VisualAcuity {
            condition: AvCondition::parse(&self.condition).ok_or_else(|| {
                CoreError::Persistence(format!("acuity {} carries unknown condition", self.id))
            })?,
            eye: eye_from_db(self.id, &self.eye)?,
            id: self.id,
            order_id: self.order_id,
            denominator: self.denominator,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RxDb {
    id: Uuid,
    order_id: Uuid,
    eye: String,
    distance: String,
    sph: Option<Decimal>,
    cyl: Option<Decimal>,
    axis: Option<i32>,
    add: Option<Decimal>,
    pd: Option<String>,
    seg_height: Option<Decimal>,
}

impl RxDb {
    fn into_rx(self) -> CoreResult<RxMeasurement> {
        Ok(RxMeasurement {
            eye: eye_from_db(self.id, &self.eye)?,
            distance: RxDistance::parse(&self.distance).ok_or_else(|| {
                CoreError::Persistence(format!("rx {} carries unknown distance", self.id))
            })?,
            id: self.id,
            order_id: self.order_id,
            sph: self.sph,
            cyl: self.cyl,
            axis: self.axis,
            add: self.add,
            pd: self.pd,
            seg_height: self.seg_height,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SelectionDb {
    id: Uuid,
    order_id: Uuid,
    kind: String,
    reference_id: Option<Uuid>,
    brand: Option<String>,
    model: Option<String>,
    note: Option<String>,
}

impl SelectionDb {
    fn into_selection(self) -> CoreResult<Selection> {
        Ok(Selection {
            kind: SelectionKind::parse(&self.kind).ok_or_else(|| {
                CoreError::Persistence(format!("selection {} carries unknown kind", self.id))
            })?,
            id: self.id,
            order_id: self.order_id,
            reference_id: self.reference_id,
            brand: self.brand,
            model: self.model,
            note: self.note,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PatientDb {
    name: String,
    phone: Option<String>,
}

#[derive(sqlx::FromRow)]
struct OrderListDb {
    id: Uuid,
    created_at: DateTime<Utc>,
    patient_name: String,
    created_by_name: String,
    status: i16,
    total: Option<Decimal>,
    amount_paid: Decimal,
    balance_due: Decimal,
    branch_name: String,
    lab_kind: Option<String>,
    lab_name: Option<String>,
    last_status_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct LabListDb {
    id: Uuid,
    sent_to_lab_at: Option<DateTime<Utc>>,
    patient_name: String,
    patient_phone: Option<String>,
    total: Decimal,
    amount_paid: Decimal,
    observations: Option<String>,
    estimated_delivery_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct PatientVisitDb {
    id: Uuid,
    created_at: DateTime<Utc>,
    status: i16,
    total: Option<Decimal>,
    amount_paid: Decimal,
    branch_name: String,
    created_by_name: String,
}

fn status_from_db(order_id: Uuid, value: i16) -> CoreResult<OrderStatus> {
    OrderStatus::try_from(value).map_err(|_| {
        CoreError::Persistence(format!("order {order_id} carries undefined status {value}"))
    })
}

fn eye_from_db(row_id: Uuid, value: &str) -> CoreResult<Eye> {
    Eye::parse(value)
        .ok_or_else(|| CoreError::Persistence(format!("row {row_id} carries unknown eye")))
}

const ORDER_COLUMNS: &str = "o.id, o.tenant_id, o.branch_id, o.patient_id, o.created_by, \
     o.created_by_name, o.created_at, o.status, o.observations, o.total, o.amount_paid, \
     o.balance_due, o.sent_to_lab_at, o.estimated_delivery_at, o.received_at_branch_at, \
     o.delivered_at";

impl PgOrderStore {
    /// Resolve an order under the caller's tenant and visibility scope.
    /// Anything outside the scope reports `NotFound`, not `Forbidden`.
    async fn fetch_order_scoped<'e, E>(
        executor: E,
        caller: &Caller,
        id: Uuid,
        lock: bool,
    ) -> CoreResult<Order>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let mut qb = QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.id = "));
        qb.push_bind(id);
        qb.push(" AND o.tenant_id = ");
        qb.push_bind(caller.tenant_id);
        push_scope(&mut qb, OrderScope::for_role(caller.role));
        if lock {
            qb.push(" FOR UPDATE");
        }

        let row: Option<OrderDb> = qb
            .build_query_as()
            .fetch_optional(executor)
            .await
            .map_err(persistence)?;
        row.ok_or(CoreError::NotFound)?.into_order()
    }

    async fn fetch_patient(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<PatientDb> {
        sqlx::query_as::<_, PatientDb>(
            "SELECT name, phone FROM patients WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?
        .ok_or(CoreError::NotFound)
    }

    async fn branch_name(&self, tenant_id: Uuid, id: Uuid) -> CoreResult<String> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM branches WHERE id = $1 AND tenant_id = $2")
                .bind(id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?;
        Ok(name.unwrap_or_else(|| "Branch unavailable".to_string()))
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create_order(&self, caller: &Caller, new: NewOrder) -> CoreResult<Uuid> {
        lifecycle::ensure_identity(caller)?;

        let patient_exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM patients WHERE id = $1 AND tenant_id = $2")
                .bind(new.patient_id)
                .bind(caller.tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?;
        if patient_exists.is_none() {
            return Err(CoreError::Validation("Unknown patient".into()));
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let balance = reconcile::balance_due(new.total, Decimal::ZERO);

        let mut tx = self.pool.begin().await.map_err(persistence)?;

        sqlx::query(
            "INSERT INTO orders (id, tenant_id, branch_id, patient_id, created_by, \
             created_by_name, created_at, status, observations, total, amount_paid, balance_due) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(order_id)
        .bind(caller.tenant_id)
        .bind(caller.branch_id)
        .bind(new.patient_id)
        .bind(caller.user_id)
        .bind(&caller.user_name)
        .bind(now)
        .bind(OrderStatus::Created.ordinal())
        .bind(&new.observations)
        .bind(new.total)
        .bind(Decimal::ZERO)
        .bind(balance)
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        for acuity in &new.acuities {
            sqlx::query(
                "INSERT INTO visual_acuities (id, tenant_id, order_id, condition, eye, denominator) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(caller.tenant_id)
            .bind(order_id)
            .bind(acuity.condition.as_str())
            .bind(acuity.eye.as_str())
            .bind(acuity.denominator.clamp(10, 200))
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        }

        for rx in &new.rx {
            sqlx::query(
                "INSERT INTO rx_measurements (id, tenant_id, order_id, eye, distance, sph, cyl, \
                 axis, \"add\", pd, seg_height) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(Uuid::new_v4())
            .bind(caller.tenant_id)
            .bind(order_id)
            .bind(rx.eye.as_str())
            .bind(rx.distance.as_str())
            .bind(rx.sph)
            .bind(rx.cyl)
            .bind(rx.axis)
            .bind(rx.add)
            .bind(&rx.pd)
            .bind(rx.seg_height)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        }

        for selection in &new.selections {
            sqlx::query(
                "INSERT INTO selections (id, tenant_id, order_id, kind, reference_id, brand, \
                 model, note) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(Uuid::new_v4())
            .bind(caller.tenant_id)
            .bind(order_id)
            .bind(selection.kind.as_str())
            .bind(selection.reference_id)
            .bind(&selection.brand)
            .bind(&selection.model)
            .bind(&selection.note)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        }

        tx.commit().await.map_err(persistence)?;
        Ok(order_id)
    }

    async fn get_order(&self, caller: &Caller, id: Uuid) -> CoreResult<OrderDetail> {
        let order = Self::fetch_order_scoped(&self.pool, caller, id, false).await?;
        let patient = self.fetch_patient(caller.tenant_id, order.patient_id).await?;
        let branch_name = self.branch_name(caller.tenant_id, order.branch_id).await?;

        let line_items = sqlx::query_as::<_, LineItemDb>(
            "SELECT id, tenant_id, order_id, label, amount, user_id, user_name, branch_id, \
             created_at, note FROM line_items WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(LineItemDb::into_line_item)
        .collect();

        let payments = sqlx::query_as::<_, PaymentDb>(
            "SELECT id, tenant_id, order_id, method, amount, authorization_code, note, \
             created_at FROM payments WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(PaymentDb::into_payment)
        .collect::<CoreResult<Vec<_>>>()?;

        let acuities = sqlx::query_as::<_, AcuityDb>(
            "SELECT id, order_id, condition, eye, denominator FROM visual_acuities \
             WHERE order_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(AcuityDb::into_acuity)
        .collect::<CoreResult<Vec<_>>>()?;

        let rx = sqlx::query_as::<_, RxDb>(
            "SELECT id, order_id, eye, distance, sph, cyl, axis, \"add\", pd, seg_height \
             FROM rx_measurements WHERE order_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(RxDb::into_rx)
        .collect::<CoreResult<Vec<_>>>()?;

        let selections = sqlx::query_as::<_, SelectionDb>(
            "SELECT id, order_id, kind, reference_id, brand, model, note FROM selections \
             WHERE order_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(SelectionDb::into_selection)
        .collect::<CoreResult<Vec<_>>>()?;

        Ok(OrderDetail {
            patient: PatientSummary {
                id: order.patient_id,
                name: patient.name,
                phone: patient.phone.map(Masked),
            },
            branch_name,
            order,
            line_items,
            payments,
            acuities,
            rx,
            selections,
        })
    }

    async fn transition(
        &self,
        caller: &Caller,
        id: Uuid,
        cmd: TransitionCommand,
    ) -> CoreResult<StatusEvent> {
        lifecycle::ensure_identity(caller)?;

        let mut tx = self.pool.begin().await.map_err(persistence)?;
        let order = Self::fetch_order_scoped(&mut *tx, caller, id, true).await?;

        let plan = lifecycle::plan_transition(order.status, &cmd)?;
        let now = Utc::now();
        let mut updated = order.clone();
        updated.status = plan.to;
        lifecycle::stamp_milestones(&mut updated, plan.to, now);
        let event = lifecycle::build_event(&updated, caller, &plan, &cmd, now);

        // The row is locked, so the status guard can only miss if something
        // slipped past the lock; treat that as a failed transition.
        let result = sqlx::query(
            "UPDATE orders SET status = $1, sent_to_lab_at = $2, estimated_delivery_at = $3, \
             received_at_branch_at = $4, delivered_at = $5 WHERE id = $6 AND status = $7",
        )
        .bind(updated.status.ordinal())
        .bind(updated.sent_to_lab_at)
        .bind(updated.estimated_delivery_at)
        .bind(updated.received_at_branch_at)
        .bind(updated.delivered_at)
        .bind(id)
        .bind(plan.from.ordinal())
        .execute(&mut *tx)
        .await
        .map_err(transition_failed)?;

        if result.rows_affected() != 1 {
            tracing::error!(order_id = %id, "order status changed underneath a locked transition");
            return Err(CoreError::TransitionFailed);
        }

        sqlx::query(
            "INSERT INTO status_events (id, tenant_id, order_id, from_status, to_status, user_id, \
             user_name, branch_id, timestamp, note, lab_kind, lab_id, lab_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.order_id)
        .bind(event.from_status.ordinal())
        .bind(event.to_status.ordinal())
        .bind(event.user_id)
        .bind(&event.user_name)
        .bind(event.branch_id)
        .bind(event.timestamp)
        .bind(&event.note)
        .bind(event.lab_kind.map(LabKind::as_str))
        .bind(event.lab_id)
        .bind(&event.lab_name)
        .execute(&mut *tx)
        .await
        .map_err(transition_failed)?;

        tx.commit().await.map_err(transition_failed)?;
        Ok(event)
    }

    async fn get_history(&self, caller: &Caller, id: Uuid) -> CoreResult<HistoryView> {
        let order = Self::fetch_order_scoped(&self.pool, caller, id, false).await?;
        let patient = self.fetch_patient(caller.tenant_id, order.patient_id).await?;
        let branch_name = self.branch_name(caller.tenant_id, order.branch_id).await?;

        let events = sqlx::query_as::<_, EventDb>(
            "SELECT id, tenant_id, order_id, from_status, to_status, user_id, user_name, \
             branch_id, timestamp, note, lab_kind, lab_id, lab_name FROM status_events \
             WHERE order_id = $1 ORDER BY timestamp",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(EventDb::into_event)
        .collect::<CoreResult<Vec<_>>>()?;

        Ok(HistoryView {
            patient_name: patient.name,
            patient_phone: patient.phone.map(Masked),
            branch_name,
            created_by_name: order.created_by_name,
            visit_date: order.created_at,
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

        let mut tx = self.pool.begin().await.map_err(persistence)?;
        Self::fetch_order_scoped(&mut *tx, caller, id, true).await?;

        sqlx::query("DELETE FROM line_items WHERE order_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;

        let now = Utc::now();
        let total = reconcile::line_items_total(&items);
        let stored: Vec<LineItem> = items
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

        for item in &stored {
            sqlx::query(
                "INSERT INTO line_items (id, tenant_id, order_id, label, amount, user_id, \
                 user_name, branch_id, created_at, note) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(item.id)
            .bind(item.tenant_id)
            .bind(item.order_id)
            .bind(&item.label)
            .bind(item.amount)
            .bind(item.user_id)
            .bind(&item.user_name)
            .bind(item.branch_id)
            .bind(item.created_at)
            .bind(&item.note)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        }

        // Re-pricing keeps existing payments in the reconciliation rather
        // than zeroing them out (see DESIGN.md).
        let paid: Option<Decimal> =
            sqlx::query_scalar("SELECT SUM(amount) FROM payments WHERE order_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(persistence)?;
        let paid = paid.unwrap_or(Decimal::ZERO);

        sqlx::query(
            "UPDATE orders SET total = $1, amount_paid = $2, balance_due = $3 WHERE id = $4",
        )
        .bind(total)
        .bind(paid)
        .bind(reconcile::balance_due(Some(total), paid))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        tx.commit().await.map_err(persistence)?;
        Ok(LineItemsView {
            order_id: id,
            total,
            items: stored,
        })
    }

    async fn add_payments(
        &self,
        caller: &Caller,
        id: Uuid,
        payments: Vec<NewPayment>,
    ) -> CoreResult<()> {
        let methods = reconcile::parse_payment_methods(&payments)?;

        let mut tx = self.pool.begin().await.map_err(persistence)?;
        let order = Self::fetch_order_scoped(&mut *tx, caller, id, true).await?;

        let now = Utc::now();
        for (payment, method) in payments.into_iter().zip(methods) {
            sqlx::query(
                "INSERT INTO payments (id, tenant_id, order_id, method, amount, \
                 authorization_code, note, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(Uuid::new_v4())
            .bind(caller.tenant_id)
            .bind(id)
            .bind(method.as_str())
            .bind(payment.amount)
            .bind(&payment.authorization)
            .bind(&payment.note)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        }

        // Amount paid is always re-summed from the payment rows, never
        // incremented, so a replay converges instead of drifting.
        let paid: Option<Decimal> =
            sqlx::query_scalar("SELECT SUM(amount) FROM payments WHERE order_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(persistence)?;
        let paid = paid.unwrap_or(Decimal::ZERO);

        sqlx::query("UPDATE orders SET amount_paid = $1, balance_due = $2 WHERE id = $3")
            .bind(paid)
            .bind(reconcile::balance_due(order.total, paid))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;

        tx.commit().await.map_err(persistence)?;
        Ok(())
    }

    async fn list_payments(&self, caller: &Caller, id: Uuid) -> CoreResult<Vec<Payment>> {
        Self::fetch_order_scoped(&self.pool, caller, id, false).await?;

        sqlx::query_as::<_, PaymentDb>(
            "SELECT id, tenant_id, order_id, method, amount, authorization_code, note, \
             created_at FROM payments WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?
        .into_iter()
        .map(PaymentDb::into_payment)
        .collect()
    }

    async fn list_orders(
        &self,
        caller: &Caller,
        query: OrderQuery,
    ) -> CoreResult<PagedResult<OrderRow>> {
        let scope = OrderScope::for_role(caller.role);
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));

        let mut count_qb =
            QueryBuilder::new(
                "SELECT COUNT(*) FROM orders o JOIN patients p ON p.id = o.patient_id \
                 WHERE o.tenant_id = ",
            );
        count_qb.push_bind(caller.tenant_id);
        push_scope(&mut count_qb, scope);
        if let Some(status) = query.status {
            count_qb.push(" AND o.status = ");
            count_qb.push_bind(status.ordinal());
        }
        if let Some(pattern) = &needle {
            count_qb.push(" AND p.name ILIKE ");
            count_qb.push_bind(pattern.clone());
        }
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(persistence)?;

        let mut qb = QueryBuilder::new(
            "SELECT o.id, o.created_at, p.name AS patient_name, o.created_by_name, o.status, \
             o.total, o.amount_paid, o.balance_due, b.name AS branch_name, \
             le.lab_kind, le.lab_name, le.timestamp AS last_status_at \
             FROM orders o \
             JOIN patients p ON p.id = o.patient_id \
             JOIN branches b ON b.id = o.branch_id \
             LEFT JOIN LATERAL (\
                 SELECT e.lab_kind, e.lab_name, e.timestamp FROM status_events e \
                 WHERE e.order_id = o.id ORDER BY e.timestamp DESC LIMIT 1\
             ) le ON TRUE \
             WHERE o.tenant_id = ",
        );
        qb.push_bind(caller.tenant_id);
        push_scope(&mut qb, scope);
        if let Some(status) = query.status {
            qb.push(" AND o.status = ");
            qb.push_bind(status.ordinal());
        }
        if let Some(pattern) = &needle {
            qb.push(" AND p.name ILIKE ");
            qb.push_bind(pattern.clone());
        }
        qb.push(" ORDER BY o.created_at DESC LIMIT ");
        qb.push_bind(page_size);
        qb.push(" OFFSET ");
        qb.push_bind((page - 1) * page_size);

        let rows: Vec<OrderListDb> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        let items = rows
            .into_iter()
            .map(|row| {
                Ok(OrderRow {
                    status: status_from_db(row.id, row.status)?,
                    id: row.id,
                    created_at: row.created_at,
                    patient_name: row.patient_name,
                    user_name: row.created_by_name,
                    total: row.total,
                    amount_paid: row.amount_paid,
                    balance_due: row.balance_due,
                    branch_name: row.branch_name,
                    lab_kind: row.lab_kind.as_deref().and_then(LabKind::parse),
                    lab_name: row.lab_name,
                    last_status_at: row.last_status_at,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(PagedResult::new(items, page, page_size, total))
    }

    async fn list_at_lab(&self, caller: &Caller, limit: i64) -> CoreResult<Vec<LabBoardRow>> {
        let mut qb = QueryBuilder::new(
            "SELECT o.id, o.sent_to_lab_at, p.name AS patient_name, p.phone AS patient_phone, \
             COALESCE(o.total, 0) AS total, COALESCE(pay.paid, 0) AS amount_paid, \
             o.observations, o.estimated_delivery_at \
             FROM orders o \
             JOIN patients p ON p.id = o.patient_id \
             LEFT JOIN LATERAL (\
                 SELECT SUM(amount) AS paid FROM payments WHERE order_id = o.id\
             ) pay ON TRUE \
             WHERE o.tenant_id = ",
        );
        qb.push_bind(caller.tenant_id);
        qb.push(" AND o.status = ");
        qb.push_bind(OrderStatus::SentToLab.ordinal());
        push_scope(&mut qb, OrderScope::for_role(caller.role));
        qb.push(" ORDER BY o.sent_to_lab_at DESC NULLS LAST LIMIT ");
        qb.push_bind(limit.max(0));

        let rows: Vec<LabListDb> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        Ok(rows
            .into_iter()
            .map(|row| LabBoardRow {
                id: row.id,
                sent_to_lab_at: row.sent_to_lab_at,
                patient_name: row.patient_name,
                patient_phone: row.patient_phone.map(Masked),
                total: row.total,
                amount_paid: row.amount_paid,
                balance_due: row.total - row.amount_paid,
                observations: row.observations,
                estimated_delivery_at: row.estimated_delivery_at,
            })
            .collect())
    }

    async fn list_for_patient(
        &self,
        caller: &Caller,
        patient_id: Uuid,
        limit: i64,
    ) -> CoreResult<Vec<PatientVisitRow>> {
        let mut qb = QueryBuilder::new(
            "SELECT o.id, o.created_at, o.status, o.total, COALESCE(pay.paid, 0) AS amount_paid, \
             b.name AS branch_name, o.created_by_name \
             FROM orders o \
             JOIN branches b ON b.id = o.branch_id \
             LEFT JOIN LATERAL (\
                 SELECT SUM(amount) AS paid FROM payments WHERE order_id = o.id\
             ) pay ON TRUE \
             WHERE o.tenant_id = ",
        );
        qb.push_bind(caller.tenant_id);
        qb.push(" AND o.patient_id = ");
        qb.push_bind(patient_id);
        push_scope(&mut qb, OrderScope::for_role(caller.role));
        qb.push(" ORDER BY o.created_at DESC LIMIT ");
        qb.push_bind(limit.max(0));

        let rows: Vec<PatientVisitDb> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        rows.into_iter()
            .map(|row| {
                Ok(PatientVisitRow {
                    status: status_from_db(row.id, row.status)?,
                    id: row.id,
                    created_at: row.created_at,
                    total: row.total,
                    amount_paid: row.amount_paid,
                    balance_due: reconcile::balance_due(row.total, row.amount_paid),
                    branch_name: row.branch_name,
                    user_name: row.created_by_name,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optia_core::Role;

    #[test]
    fn scope_compiles_into_where_clause() {
        let mut qb = QueryBuilder::new("SELECT 1 FROM orders o WHERE o.tenant_id = ");
        qb.push_bind(Uuid::new_v4());
        push_scope(&mut qb, OrderScope::for_role(Role::Admin));
        assert!(!qb.sql().contains("o.branch_id"));
        assert!(!qb.sql().contains("o.status"));

        let mut qb = QueryBuilder::new("SELECT 1 FROM orders o WHERE o.tenant_id = ");
        qb.push_bind(Uuid::new_v4());
        push_scope(&mut qb, OrderScope::for_role(Role::BranchScoped(Uuid::new_v4())));
        assert!(qb.sql().contains("AND o.branch_id ="));

        let mut qb = QueryBuilder::new("SELECT 1 FROM orders o WHERE o.tenant_id = ");
        qb.push_bind(Uuid::new_v4());
        push_scope(&mut qb, OrderScope::for_role(Role::Courier));
        assert!(qb.sql().contains("AND o.status ="));
    }
}
