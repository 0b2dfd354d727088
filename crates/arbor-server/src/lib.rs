//! # Arbor Server
//!
//! The HTTP front-end and request orchestrator: an OpenAI-compatible chat
//! completions endpoint in front of the RadixAttention cache manager. The
//! front-end parses requests and drives the autoregressive loop; every
//! caching decision lives in `arbor-radix`.

pub mod handlers;
pub mod openai;
pub mod orchestrator;
pub mod tokenizer;

use arbor_engine::CacheEngine;
use axum::routing::{get, post};
use axum::Router;
use orchestrator::Orchestrator;
use std::sync::Arc;
use tokenizer::ChatTokenizer;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Default generation ceiling when a request omits `max_tokens`.
pub const DEFAULT_MAX_TOKENS: usize = 256;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tokenizer: Arc<ChatTokenizer>,
    pub engine: Arc<dyn CacheEngine>,
    pub model_id: String,
    pub default_max_tokens: usize,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        tokenizer: Arc<ChatTokenizer>,
        engine: Arc<dyn CacheEngine>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            tokenizer,
            engine,
            model_id: model_id.into(),
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/health", get(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
