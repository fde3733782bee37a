use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    handlers::common::{no_content_response, success_response, validate_input, ActingUser},
    services::cart::AddCartItemInput,
    AppState,
};

/// Creates the router for the acting buyer's cart
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/", delete(clear_cart))
        .route("/items", post(add_item))
        .route("/items/:item_id", put(update_item))
        .route("/items/:item_id", delete(remove_item))
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateItemRequest {
    #[validate(range(min = 1, max = 1000))]
    quantity: i32,
}

async fn get_cart(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.get(buyer_id).await?;
    Ok(success_response(cart))
}

async fn add_item(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Json(payload): Json<AddCartItemInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state.services.cart.add_item(buyer_id, payload).await?;
    Ok(success_response(cart))
}

async fn update_item(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state
        .services
        .cart
        .update_item(buyer_id, item_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.remove_item(buyer_id, item_id).await?;
    Ok(success_response(cart))
}

async fn clear_cart(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.cart.clear(buyer_id).await?;
    Ok(no_content_response())
}
