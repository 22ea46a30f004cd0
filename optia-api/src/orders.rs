use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use optia_core::{Caller, PagedResult};
use optia_order::history::HistoryView;
use optia_order::models::{
    LabBoardRow, LineItemsView, NewLineItem, NewOrder, NewPayment, OrderDetail, OrderQuery,
    OrderRow, OrderStatus, PatientVisitRow, Payment, TransitionCommand,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListOrdersParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
    /// Status ordinal filter; undefined ordinals are rejected, not ignored.
    pub status: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub order_id: Uuid,
    pub from_status: OrderStatus,
    pub to_status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/orders", post(create_order).get(list_orders))
        .route("/api/orders/at-lab", get(list_at_lab))
        .route("/api/orders/patient/{patient_id}", get(list_for_patient))
        .route("/api/orders/{id}", get(get_order))
        .route("/api/orders/{id}/status", post(change_status))
        .route("/api/orders/{id}/status-history", get(status_history))
        .route("/api/orders/{id}/line-items", put(replace_line_items))
        .route("/api/orders/{id}/payments", post(add_payments).get(list_payments))
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(new): Json<NewOrder>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let id = state.store.create_order(&caller, new).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetail>, AppError> {
    Ok(Json(state.store.get_order(&caller, id).await?))
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<ListOrdersParams>,
) -> Result<Json<PagedResult<OrderRow>>, AppError> {
    let status = params.status.map(OrderStatus::try_from).transpose()?;
    let query = OrderQuery {
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(20),
        search: params.search,
        status,
    };
    Ok(Json(state.store.list_orders(&caller, query).await?))
}

async fn change_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(cmd): Json<TransitionCommand>,
) -> Result<Json<TransitionResponse>, AppError> {
    let event = state.store.transition(&caller, id, cmd).await?;
    Ok(Json(TransitionResponse {
        order_id: event.order_id,
        from_status: event.from_status,
        to_status: event.to_status,
        timestamp: event.timestamp,
    }))
}

async fn status_history(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryView>, AppError> {
    Ok(Json(state.store.get_history(&caller, id).await?))
}

async fn replace_line_items(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(items): Json<Vec<NewLineItem>>,
) -> Result<Json<LineItemsView>, AppError> {
    Ok(Json(state.store.replace_line_items(&caller, id, items).await?))
}

async fn add_payments(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(payments): Json<Vec<NewPayment>>,
) -> Result<StatusCode, AppError> {
    state.store.add_payments(&caller, id, payments).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_payments(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, AppError> {
    Ok(Json(state.store.list_payments(&caller, id).await?))
}

async fn list_at_lab(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<LabBoardRow>>, AppError> {
    let limit = params.limit.unwrap_or(50);
    Ok(Json(state.store.list_at_lab(&caller, limit).await?))
}

async fn list_for_patient(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(patient_id): Path<Uuid>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<PatientVisitRow>>, AppError> {
    let limit = params.limit.unwrap_or(20);
    Ok(Json(
        state.store.list_for_patient(&caller, patient_id, limit).await?,
    ))
}
