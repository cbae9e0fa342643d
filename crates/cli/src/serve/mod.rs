//! `remit serve` -- HTTP JSON API for the billing engine.
//!
//! Exposes grant issuance, activation, charging, revocation, and
//! subscription lookup as an async HTTP service using `axum` + `tokio`.
//!
//! Security features:
//! - CORS headers on all responses (permissive for local dev)
//! - Per-IP rate limiting (default: 60 req/min, configurable)
//! - Optional API key authentication via REMIT_API_KEY env var
//!
//! Endpoints:
//! - GET  /health                        - Server status (exempt from auth)
//! - POST /subscriptions                 - Record a grant, mint a delegate credential
//! - POST /subscriptions/{id}/activate   - Idempotent activation after approval
//! - POST /subscriptions/{id}/charge     - Execute one due charge
//! - POST /subscriptions/{id}/revoke     - Cancel a grant
//! - GET  /subscriptions/{id}            - Subscription view (never credentials)
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_activate, handle_charge, handle_create_grant, handle_get_subscription, handle_health,
    handle_not_found, handle_revoke,
};
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use crate::config::RemitConfig;
use crate::context::EngineContext;

/// Maximum request body size: 1 MB. Requests here are small JSON
/// documents; anything larger is garbage.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Default rate limit: 60 requests per minute per IP.
const DEFAULT_RATE_LIMIT: u64 = 60;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Start the HTTP server on the given port.
///
/// When TLS cert/key paths are provided, the server listens over HTTPS
/// using `axum-server` with rustls. Otherwise it uses plain HTTP.
pub async fn start_server(
    config: RemitConfig,
    port: u16,
    _tls_cert: Option<PathBuf>,
    _tls_key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = EngineContext::build(&config);

    if context.mock.is_some() {
        eprintln!("Ledger: in-process mock (demo mode)");
    } else if let Some(url) = &config.ledger_url {
        eprintln!("Ledger: {}", url);
    }
    match &config.store_path {
        Some(path) => eprintln!("Store: {}", path.display()),
        None => eprintln!("Store: in-memory"),
    }

    // Rate limit: from REMIT_RATE_LIMIT env var, or default
    let rate_limit = std::env::var("REMIT_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT);

    // API key: from REMIT_API_KEY env var (None = no auth)
    let api_key = std::env::var("REMIT_API_KEY")
        .ok()
        .filter(|k| !k.is_empty());

    if api_key.is_some() {
        eprintln!("API key authentication enabled");
    }
    eprintln!("Rate limit: {} requests per minute per IP", rate_limit);

    let state = Arc::new(AppState {
        store: context.store,
        issuer: context.issuer,
        executor: context.executor,
        mock: context.mock,
        asset_decimals: config.asset_decimals,
        default_period_amount: config.default_period_amount,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    });

    // CORS: permissive for local dev; tighten for production.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/subscriptions", post(handle_create_grant))
        .route("/subscriptions/{id}", get(handle_get_subscription))
        .route("/subscriptions/{id}/activate", post(handle_activate))
        .route("/subscriptions/{id}/charge", post(handle_charge))
        .route("/subscriptions/{id}/revoke", post(handle_revoke))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);

    // TLS support via axum-server + rustls (requires `tls` feature)
    #[cfg(feature = "tls")]
    if let (Some(cert_path), Some(key_path)) = (&_tls_cert, &_tls_key) {
        let config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let socket_addr: std::net::SocketAddr = addr.parse()?;
        eprintln!("Billing engine listening on https://0.0.0.0:{}", port);
        axum_server::bind_rustls(socket_addr, config)
            .serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("Billing engine listening on http://0.0.0.0:{}", port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    eprintln!("\nServer shut down.");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    eprintln!("\nReceived shutdown signal...");
}
