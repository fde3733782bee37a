use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::common::{no_content_response, success_response, ActingUser, PaginationParams},
    AppState,
};

/// Buyer-facing order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/archive", post(archive_order))
}

/// Seller-facing listing of a store's store orders
pub fn stores_routes() -> Router<AppState> {
    Router::new().route("/:store_id/orders", get(list_store_orders))
}

async fn list_orders(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .services
        .orders
        .list_for_buyer(buyer_id, params.page, params.per_page)
        .await?;
    Ok(success_response(orders))
}

async fn get_order(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get(buyer_id, id).await?;
    Ok(success_response(order))
}

async fn archive_order(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.orders.archive(buyer_id, id).await?;
    Ok(no_content_response())
}

async fn list_store_orders(
    State(state): State<AppState>,
    ActingUser(seller_id): ActingUser,
    Path(store_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let store_orders = state
        .services
        .orders
        .list_for_store(seller_id, store_id)
        .await?;
    Ok(success_response(store_orders))
}
