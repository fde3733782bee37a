use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    errors::ServiceError,
    handlers::common::{created_response, success_response, validate_input, ActingUser},
    services::checkout::PlaceOrderInput,
    AppState,
};

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(place_order))
        .route("/coupon-preview", post(preview_coupon))
}

#[derive(Debug, Deserialize)]
struct CouponPreviewRequest {
    code: String,
    subtotal: Decimal,
}

/// Places an order from the acting buyer's cart
async fn place_order(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Json(payload): Json<PlaceOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let placed = state.services.checkout.place_order(buyer_id, payload).await?;
    Ok(created_response(placed))
}

/// Tells the buyer what a coupon would take off a subtotal, without using it
async fn preview_coupon(
    State(state): State<AppState>,
    ActingUser(buyer_id): ActingUser,
    Json(payload): Json<CouponPreviewRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let validation = state
        .services
        .coupons
        .validate(&payload.code, buyer_id, payload.subtotal)
        .await?;
    Ok(success_response(validation))
}
