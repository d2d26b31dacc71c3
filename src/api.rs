use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::error;

use crate::db::DbHandle;
use crate::engine;
use crate::errors::ReconcileError;
use crate::models::{IdentifyRequest, IdentifyResponse};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        if err.is_bad_request() {
            ApiError::BadRequest(err.to_string())
        } else {
            error!("Reconciliation failed: {}", err);
            ApiError::Internal(err.to_string())
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/identify", post(identify))
        .route("/contacts", get(list_contacts))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn identify(
    State(state): State<SharedState>,
    Json(req): Json<IdentifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Reject before touching the store; the engine re-checks as a guard.
    if req.email.is_none() && req.phone_number.is_none() {
        return Err(ReconcileError::MissingIdentifiers.into());
    }

    let IdentifyRequest { email, phone_number } = req;
    let contact = state
        .db
        .call(move |db| {
            // The whole decision procedure runs under the store mutex:
            // overlapping identify calls serialize here.
            Ok(engine::identify(db, email.as_deref(), phone_number.as_deref()))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(IdentifyResponse { contact }))
}

async fn list_contacts(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let contacts = state
        .db
        .call(move |db| db.list_all())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "contacts": contacts })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_errors_map_to_http_classes() {
        let bad: ApiError = ReconcileError::MissingIdentifiers.into();
        assert!(matches!(bad, ApiError::BadRequest(_)));

        let fault: ApiError = ReconcileError::BrokenLink { id: 1, linked_id: 2 }.into();
        assert!(matches!(fault, ApiError::Internal(_)));
    }
}
