use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::store_order::StoreOrderStatus;

/// Error body returned by the HTTP layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Taxonomy bucket the failure belongs to
    pub kind: ErrorKind,
    /// Human-readable error description
    pub message: String,
    /// Current store order state for conflict errors, so callers can reconcile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<StoreOrderStatus>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// Coarse classification shared by every settlement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected before any mutation
    Validation,
    /// Referenced entity is missing (or tombstoned)
    NotFound,
    /// Acting user does not own the resource
    Forbidden,
    /// State-machine guard violation
    Conflict,
    /// Stock, wallet balance or points balance too low
    InsufficientResource,
    /// A collaborator failed underneath us
    ExternalCollaborator,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Product {product_id} is not available")]
    ProductUnavailable { product_id: Uuid },

    #[error("Insufficient stock for product {product_id}: wanted {requested}, have {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Insufficient points: wanted {requested}, have {available}")]
    InsufficientPoints { requested: i64, available: i64 },

    #[error("Insufficient wallet balance: wanted {requested}, have {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Store order {store_order_id} cannot {action} while {current}")]
    InvalidTransition {
        store_order_id: Uuid,
        action: &'static str,
        current: StoreOrderStatus,
    },

    #[error("Store order {store_order_id} has not been accepted (currently {current})")]
    OrderNotAccepted {
        store_order_id: Uuid,
        current: StoreOrderStatus,
    },

    #[error("Store order {store_order_id} is already paid (currently {current})")]
    AlreadyPaid {
        store_order_id: Uuid,
        current: StoreOrderStatus,
    },

    #[error("Invalid delivery code for store order {0}")]
    InvalidDeliveryCode(Uuid),

    #[error("Delivery code for store order {0} is locked after too many failed attempts")]
    DeliveryCodeLocked(Uuid),

    #[error("Escrow already exists for store order {0}")]
    EscrowAlreadyExists(Uuid),

    #[error("Escrow {0} is not locked")]
    EscrowNotLocked(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Maps the variant onto the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) | Self::EmptyCart => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::ProductUnavailable { .. }
            | Self::InsufficientStock { .. }
            | Self::InsufficientPoints { .. }
            | Self::InsufficientBalance { .. } => ErrorKind::InsufficientResource,
            Self::InvalidTransition { .. }
            | Self::OrderNotAccepted { .. }
            | Self::AlreadyPaid { .. }
            | Self::InvalidDeliveryCode(_)
            | Self::DeliveryCodeLocked(_)
            | Self::EscrowAlreadyExists(_)
            | Self::EscrowNotLocked(_)
            | Self::Conflict(_) => ErrorKind::Conflict,
            Self::ExternalServiceError(_) => ErrorKind::ExternalCollaborator,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// The store order state observed when a guard rejected the call.
    pub fn current_status(&self) -> Option<StoreOrderStatus> {
        match self {
            Self::InvalidTransition { current, .. }
            | Self::OrderNotAccepted { current, .. }
            | Self::AlreadyPaid { current, .. } => Some(*current),
            _ => None,
        }
    }

    /// Wraps a collaborator failure, keeping its cause in the message.
    pub fn external(collaborator: &str, cause: impl std::fmt::Display) -> Self {
        ServiceError::ExternalServiceError(format!("{collaborator}: {cause}"))
    }

    /// Re-labels an infrastructure failure raised inside a collaborator call.
    /// Domain outcomes such as `InsufficientPoints` pass through unchanged.
    pub fn in_collaborator(self, collaborator: &str) -> Self {
        match self {
            Self::DatabaseError(e) => Self::external(collaborator, e),
            Self::Other(e) => Self::external(collaborator, e),
            other => other,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InsufficientResource => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ExternalCollaborator => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            kind: self.kind(),
            message: self.response_message(),
            current_status: self.current_status(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
