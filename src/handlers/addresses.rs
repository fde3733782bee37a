use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get},
    Router,
};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::common::{
        created_response, no_content_response, success_response, validate_input, ActingUser,
    },
    services::addresses::CreateAddressInput,
    AppState,
};

pub fn addresses_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_addresses).post(create_address))
        .route("/:id", delete(delete_address))
}

async fn list_addresses(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
) -> Result<impl IntoResponse, ServiceError> {
    let addresses = state.services.addresses.list(user_id).await?;
    Ok(success_response(addresses))
}

async fn create_address(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Json(payload): Json<CreateAddressInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let address = state.services.addresses.create(user_id, payload).await?;
    Ok(created_response(address))
}

async fn delete_address(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.addresses.delete(user_id, id).await?;
    Ok(no_content_response())
}
