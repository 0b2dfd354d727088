//! Arbor server binary
//!
//! Startup: parse flags, configure logging, build the engine (mock when no
//! model path is given), assemble the cache manager and orchestrator, and
//! serve until SIGINT/SIGTERM.

use arbor_engine::{CacheEngine, MockEngine};
use arbor_radix::RadixTree;
use arbor_server::orchestrator::Orchestrator;
use arbor_server::tokenizer::ChatTokenizer;
use arbor_server::{build_router, AppState};
use arbor_types::{ArborError, CacheConfig, Config, LoggingConfig, ModelConfig, Result,
    ServerConfig};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Prefix-caching inference coordinator for Metal-backed LLM serving")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Path to the model weights directory; empty runs the mock engine
    #[arg(long, default_value = "")]
    model: String,

    /// Tokenizer vocabulary size
    #[arg(long, default_value_t = 32000)]
    vocab_size: usize,

    /// Maximum number of tokens held in the prefix cache
    #[arg(long, default_value_t = 100_000)]
    max_cache_size: usize,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            server: ServerConfig { addr: self.addr },
            model: ModelConfig {
                path: self.model,
                vocab_size: self.vocab_size,
            },
            cache: CacheConfig {
                max_tokens: self.max_cache_size,
            },
            logging: LoggingConfig {
                level: self.log_level,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Cli::parse().into_config();
    if let Err(err) = config.validate() {
        eprintln!("Error: {}", err);
        process::exit(1);
    }

    setup_logging(&config.logging.level);

    if let Err(err) = run(config).await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        addr = %config.server.addr,
        model = %config.model.path,
        vocab_size = config.model.vocab_size,
        max_cache_tokens = config.cache.max_tokens,
        "Starting Arbor server"
    );

    let engine = build_engine(&config.model)?;
    let tree = RadixTree::new(Arc::clone(&engine), config.cache.max_tokens);
    let tokenizer = Arc::new(ChatTokenizer::new(config.model.vocab_size));
    let orchestrator = Arc::new(Orchestrator::new(tree, Arc::clone(&engine)));
    info!("Initialized radix tree for prefix caching");

    let state = AppState::new(orchestrator, tokenizer, engine, "arbor");
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .map_err(|err| {
            ArborError::config(format!("failed to bind {}: {}", config.server.addr, err))
        })?;
    info!(addr = %config.server.addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| ArborError::internal(format!("server error: {}", err)))?;

    info!("Shutdown complete");
    Ok(())
}

fn build_engine(config: &ModelConfig) -> Result<Arc<dyn CacheEngine>> {
    if config.path.is_empty() {
        info!("No model path given; using the mock engine");
        return Ok(Arc::new(MockEngine::new(config.vocab_size)));
    }

    #[cfg(feature = "metal")]
    {
        let engine = arbor_engine::MetalEngine::new(config.path.clone(), config.vocab_size);
        engine.load_model()?;
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "metal"))]
    Err(ArborError::config(
        "built without Metal support; rebuild with --features metal or run with an empty --model",
    ))
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
