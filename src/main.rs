use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::info;

mod backends;
mod config;
mod conversation;
mod council;
mod error;
mod fanout;
mod gateway;
mod markdown;
mod model_client;
mod state;

pub use error::AppError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Invoked as a Docker HEALTHCHECK: hit /health and exit immediately,
    // avoiding a curl/wget dependency in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lm_council=info,tower_http=warn".into()),
        )
        .init();

    let overlay_path = std::env::var("CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/council_config.json"));

    let config_store = config::ConfigStore::load(overlay_path.clone()).await;
    let startup_config = config_store.get();
    info!(
        council_size = startup_config.council_models.len(),
        chairman = %startup_config.chairman_model,
        backend_mode = %startup_config.backend_mode,
        "lm-council starting"
    );

    let state = Arc::new(state::AppState {
        config_store,
        conversations: conversation::ConversationStore::new(),
    });

    tokio::spawn(preload_council(state.clone()));

    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let mut layer = CorsLayer::new();
            for origin in origins.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if let Ok(value) = origin.parse::<axum::http::HeaderValue>() {
                    layer = layer.allow_origin(value);
                }
            }
            layer
        }
        _ => CorsLayer::permissive(),
    };

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = gateway::router(state).layer(cors).layer(trace_layer);

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Best-effort warm-up: preload every council member plus the chairman so
/// the first real request doesn't pay a cold-start cost. Failures are
/// logged, never propagated (spec §1(d)).
async fn preload_council(state: Arc<state::AppState>) {
    let config = state.config_store.get();
    let client = model_client::ModelClient::from_config(&config);

    let mut models = config.council_models.clone();
    if !config.chairman_model.is_empty() {
        models.push(config.chairman_model.clone());
    }
    if models.is_empty() {
        return;
    }

    let calls = models
        .iter()
        .map(|m| client.preload(m, Duration::from_secs(30)));
    futures_util::future::join_all(calls).await;
    info!(count = models.len(), "council preload complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000);
    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
