//! HTTP request handlers
//!
//! The handlers parse and validate requests, then hand the blocking
//! orchestrator work to the runtime's blocking pool. A drop guard wired to
//! the request future propagates client disconnects to the generation loop
//! as a cancellation flag.

use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionChoice,
    CompletionUsage, ErrorResponse,
};
use crate::AppState;
use arbor_types::ArborError;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sets the cancellation flag unless disarmed; the handler future dropping
/// mid-flight (client disconnect) is what triggers it.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

/// Handler for POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Malformed chat completion request: {}", rejection);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("Invalid request: {}", rejection),
            );
        }
    };

    if !state.engine.is_loaded() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "model_not_loaded",
            "Model is not loaded",
        );
    }
    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "messages must not be empty",
        );
    }

    let prompt = match state.tokenizer.tokenize_chat(&request.messages) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!("Tokenization failed: {}", err);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("Tokenization failed: {}", err),
            );
        }
    };

    let prompt_tokens = prompt.len();
    let max_tokens = request.max_tokens.unwrap_or(state.default_max_tokens);
    let temperature = request.temperature.unwrap_or(0.0);
    info!(prompt_tokens, max_tokens, "Processing chat completion");

    let cancel = Arc::new(AtomicBool::new(false));
    let guard = CancelOnDrop::new(Arc::clone(&cancel));

    let orchestrator = Arc::clone(&state.orchestrator);
    let joined = tokio::task::spawn_blocking(move || {
        orchestrator.generate(&prompt, max_tokens, temperature, &cancel)
    })
    .await;
    guard.disarm();

    let generation = match joined {
        Ok(Ok(generation)) => generation,
        Ok(Err(err)) => {
            error!("Chat completion failed: {}", err);
            return error_response(status_for(&err), "generation_error", err.to_string());
        }
        Err(join_err) => {
            error!("Generation task panicked: {}", join_err);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "generation task failed",
            );
        }
    };

    let content = match state.tokenizer.decode(&generation.tokens) {
        Ok(content) => content,
        Err(err) => {
            // Mirror of the usage block still matters even if the text is
            // undecodable; respond with empty content.
            warn!("Failed to decode generated tokens: {}", err);
            String::new()
        }
    };

    let completion_tokens = generation.tokens.len();
    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: state.model_id.clone(),
        choices: vec![CompletionChoice {
            index: 0,
            message: ChatMessage::new("assistant", content),
            finish_reason: generation.finish_reason.as_str().to_string(),
        }],
        usage: CompletionUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Handler for GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    if state.engine.is_loaded() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable"})),
        )
            .into_response()
    }
}

fn status_for(err: &ArborError) -> StatusCode {
    match err {
        ArborError::InvalidRequest { .. } | ArborError::Tokenizer { .. } => {
            StatusCode::BAD_REQUEST
        }
        ArborError::CacheCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
        ArborError::ModelNotLoaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(
    status: StatusCode,
    error_type: &str,
    message: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error_type, message))).into_response()
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
