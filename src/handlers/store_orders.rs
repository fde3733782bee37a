use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::common::{success_response, ActingUser},
    services::store_orders::{AcceptInput, PaymentMethod},
    AppState,
};

/// Store order workflow endpoints
pub fn store_orders_routes() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_store_order))
        .route("/:id/escrow", get(get_escrow))
        .route("/:id/accept", post(accept))
        .route("/:id/reject", post(reject))
        .route("/:id/pay", post(pay))
        .route("/:id/out-for-delivery", post(out_for_delivery))
        .route("/:id/deliver", post(deliver))
        .route("/:id/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct DeliverRequest {
    code: String,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn get_store_order(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state
        .services
        .orders
        .store_order_for_seller(seller_id, id)
        .await?;
    Ok(success_response(details))
}

/// Escrow of a store order, visible to its buyer and seller
async fn get_escrow(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let so = state.services.store_orders.find(id).await?;
    if so.buyer_id != user_id && so.seller_id != user_id {
        return Err(ServiceError::Forbidden(format!(
            "Store order {} belongs to someone else",
            id
        )));
    }
    let escrow = state
        .services
        .escrow
        .find_by_store_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Escrow for store order {} not found", id)))?;
    Ok(success_response(escrow))
}

async fn accept(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let so = state
        .services
        .store_orders
        .accept(seller_id, id, payload)
        .await?;
    Ok(success_response(so))
}

async fn reject(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<RejectRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let so = state
        .services
        .store_orders
        .reject(seller_id, id, &payload.reason)
        .await?;
    Ok(success_response(so))
}

async fn pay(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<PaymentMethod>,
) -> Result<impl IntoResponse, ServiceError> {
    let receipt = state.services.store_orders.pay(buyer_id, id, payload).await?;
    Ok(success_response(receipt))
}

async fn out_for_delivery(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let so = state
        .services
        .store_orders
        .mark_out_for_delivery(seller_id, id)
        .await?;
    Ok(success_response(so))
}

async fn deliver(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeliverRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let so = state
        .services
        .store_orders
        .deliver(seller_id, id, &payload.code)
        .await?;
    Ok(success_response(so))
}

async fn cancel(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(payload) = payload.unwrap_or_default();
    let so = state
        .services
        .store_orders
        .cancel(buyer_id, id, payload.reason)
        .await?;
    Ok(success_response(so))
}
