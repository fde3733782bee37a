use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    errors::ServiceError,
    handlers::common::{created_response, success_response, ActingUser},
    AppState,
};

/// Wallet and loyalty points of the acting user
pub fn wallet_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_wallet))
        .route("/transactions", get(list_transactions))
        .route("/top-up", post(top_up))
        .route("/points", get(points_balance))
}

#[derive(Debug, Deserialize)]
struct TopUpRequest {
    amount: Decimal,
}

#[derive(Debug, Serialize)]
struct PointsBalance {
    available: i64,
}

async fn get_wallet(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    let wallet = state.services.wallet.wallet(user_id).await?;
    Ok(success_response(wallet))
}

async fn list_transactions(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    let transactions = state.services.wallet.transactions(user_id).await?;
    Ok(success_response(transactions))
}

async fn top_up(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Json(payload): Json<TopUpRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let transaction = state.services.wallet.top_up(user_id, payload.amount).await?;
    Ok(created_response(transaction))
}

async fn points_balance(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    let available = state.services.points.available_balance(user_id).await?;
    Ok(success_response(PointsBalance { available }))
}
