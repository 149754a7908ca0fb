use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ServiceIdentity, SERVICE_NAME};
use crate::middleware;
use crate::models::{CreateOrderRequest, NewOrder, Order};
use crate::store::{OrderStore, LIST_LIMIT};
use crate::tasks::{InventoryCheck, TaskDispatch};
use crate::telemetry::Metrics;

/// Milliseconds of simulated downstream work before an order is written.
const PROCESSING_DELAY_MS: std::ops::Range<u64> = 50..150;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub tasks: Arc<dyn TaskDispatch>,
    pub metrics: Metrics,
    pub identity: ServiceIdentity,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: String,
    pub pod_name: String,
    pub database: &'static str,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ListOrdersResponse {
    pub orders: Vec<Order>,
    pub count: usize,
    pub pod_name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order: Order,
    pub message: &'static str,
    pub pod_name: String,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Failed to fetch orders")]
    FetchOrders,

    #[error("Failed to create order")]
    CreateOrder,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::FetchOrders | ApiError::CreateOrder => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    let identity = state.identity.clone();
    let metrics = state.metrics.clone();

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/orders", get(list_orders).post(create_order))
        .with_state(state);

    middleware::instrument(router, &identity, metrics)
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            warn!("Database health probe failed: {:#}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    (
        code,
        Json(HealthResponse {
            status,
            service: SERVICE_NAME,
            version: state.identity.version.clone(),
            pod_name: state.identity.pod_name.clone(),
            database: status,
            timestamp: Utc::now().timestamp(),
        }),
    )
}

pub async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn list_orders(State(state): State<AppState>) -> Result<Json<ListOrdersResponse>, ApiError> {
    let orders = state.store.list_recent(LIST_LIMIT).await.map_err(|e| {
        error!("Failed to query orders: {:#}", e);
        ApiError::FetchOrders
    })?;

    Ok(Json(ListOrdersResponse {
        count: orders.len(),
        orders,
        pod_name: state.identity.pod_name.clone(),
        version: state.identity.version.clone(),
    }))
}

pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request.validate().map_err(ApiError::BadRequest)?;

    let delay_ms = rand::thread_rng().gen_range(PROCESSING_DELAY_MS);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let new_order = NewOrder::from(&request);
    let order_id = state.store.create(new_order.clone()).await.map_err(|e| {
        error!("Failed to create order: {:#}", e);
        ApiError::CreateOrder
    })?;

    state.metrics.order_created();
    // Not awaited; the check may still be running, or be dropped, after we respond.
    state.tasks.dispatch(InventoryCheck { order_id });
    info!(order_id, user_id = request.user_id, product_id = request.product_id, "Order created");

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order: new_order.into_order(order_id, Utc::now().naive_utc()),
            message: "Order created successfully",
            pod_name: state.identity.pod_name.clone(),
            version: state.identity.version.clone(),
        }),
    ))
}
