//! [MODULE C6] Control Plane — synchronous request/response operations over
//! the queue and accounts, exposed as a small `axum::Router`.

pub mod broadcast;
pub mod routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::accounts::AccountsStore;
use crate::config::Config;
use crate::error::{AccountError, QueueError};
use crate::processor::CancelHandle;
use crate::queue::QueueState;
use crate::store::StateStore;

use broadcast::Broadcaster;

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<tokio::sync::Mutex<QueueState>>,
    pub store: Arc<StateStore>,
    pub accounts: Arc<AccountsStore>,
    pub broadcaster: Broadcaster,
    pub cancel_handle: CancelHandle,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/queue/status", get(routes::get_status))
        .route("/queue/prompts", get(routes::list_prompts).post(routes::enqueue))
        .route("/queue/prompts/{id}", delete(routes::cancel_prompt))
        .route("/accounts", get(routes::list_accounts))
        .route("/accounts/use/{name}", post(routes::use_account))
        .route("/accounts/save", post(routes::save_account))
        .route("/accounts/new", post(routes::new_account))
        .route("/accounts/{name}", delete(routes::delete_account).get(routes::get_account))
        .route("/health", get(routes::health))
        .route("/events", get(routes::events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps domain errors to HTTP status, sanitizing the body the way the
/// teacher's `SquallError::user_message()` keeps internals out of responses
/// — internal detail stays in the `tracing::error!` log only.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let status = match &e {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::AlreadyExecuting => StatusCode::CONFLICT,
            QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
            QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %e, "queue operation failed");
        Self {
            status,
            message: e.user_message(),
        }
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        let status = match &e {
            AccountError::NotFound(_) => StatusCode::NOT_FOUND,
            AccountError::AlreadyExists(_) => StatusCode::CONFLICT,
            AccountError::InvalidName(_) => StatusCode::BAD_REQUEST,
            AccountError::NoActiveCredentials => StatusCode::BAD_REQUEST,
            AccountError::Io(_) | AccountError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %e, "account operation failed");
        Self {
            status,
            message: e.user_message(),
        }
    }
}
