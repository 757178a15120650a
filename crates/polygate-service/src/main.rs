//! Binary entry point: wires [`polygate_core`] into an axum HTTP service
//! exposing the Anthropic Messages API and the OpenAI Chat Completions API
//! behind the IDE-compatibility middleware, mirroring the shape of the
//! teacher's `querymt-service` binary (CLI args via `clap`, `tracing`
//! init, a flat `Router::new().route(...)` table, `axum::serve`).

mod credentials;
mod handlers;
mod ide_compat;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use polygate_core::config::GatewayConfig;

use crate::credentials::StaticCredentialManager;
use crate::ide_compat::ide_compat_layer;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, env = "POLYGATE_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the gateway's TOML config file
    #[arg(long, env = "POLYGATE_CONFIG", default_value = "polygate.toml")]
    config: PathBuf,
    /// Optional auth key required for requests (Bearer token)
    #[arg(long, env = "POLYGATE_AUTH_KEY")]
    auth_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polygate_service=info,polygate_core=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();

    info!(
        addr = %args.addr,
        config = %args.config.display(),
        auth = %args.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting polygate gateway"
    );

    let mut config = GatewayConfig::load(&args.config).await?;
    config.apply_env_overrides();

    let backend_names: Vec<String> = config.backends.iter().map(|b| b.name.clone()).collect();
    let credentials = Arc::new(StaticCredentialManager::from_env(&backend_names));

    let state = AppState::build(config, credentials, args.auth_key).await?;

    let chat_routes = Router::new()
        .route("/v1/messages", post(handlers::messages_handler))
        .route("/antigravity/v1/messages", post(handlers::messages_handler))
        .route("/v1/chat/completions", post(handlers::chat_completions_handler))
        .route("/antigravity/v1/chat/completions", post(handlers::chat_completions_handler))
        .layer(from_fn_with_state(state.clone(), ide_compat_layer));

    let app = Router::new()
        .merge(chat_routes)
        .route("/v1/messages/count_tokens", post(handlers::count_tokens_handler))
        .route("/v1/models", get(handlers::models_handler))
        .route("/gateway/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
