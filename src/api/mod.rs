use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ Context, Result };
use axum::http::{ header, Method };
use axum::middleware;
use axum::routing::{ get, post };
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{ Any, CorsLayer };
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::runtime::Runtime;
use crate::storage::EmailStore;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ratelimit;

/// Shared handler state: the store both planes coordinate through and the
/// domain used to format user-facing `<addr>@<domain>` strings.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EmailStore>,
    pub domain: String,
}

/// Assemble the API router. Layer order (outermost first): trace, CORS,
/// then per-route rate limiting and signature auth on the protected group.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/register/{address}", post(handlers::register_address))
        .route(
            "/api/inbox/{address}",
            get(handlers::get_inbox).delete(handlers::clear_inbox)
        )
        .route(
            "/api/inbox/{address}/{email_id}",
            get(handlers::get_email).delete(handlers::delete_email)
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::signature_auth))
        .route_layer(middleware::from_fn_with_state(state.clone(), ratelimit::inbox_rate_limit));

    let identity = Router::new()
        .route(
            "/api/identity/generate",
            post(handlers::generate_identity).route_layer(
                middleware::from_fn_with_state(state.clone(), ratelimit::generate_rate_limit)
            )
        )
        .route("/api/identity/derive", post(handlers::derive_address))
        .route("/api/identity/validate/{address}", get(handlers::validate_address));

    Router::new()
        .merge(protected)
        .merge(identity)
        .route("/api/health", get(handlers::health))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-public-key"),
            header::HeaderName::from_static("x-signature"),
            header::HeaderName::from_static("x-timestamp"),
            header::HeaderName::from_static("x-nonce"),
        ])
}

pub async fn run_api(runtime: Arc<Runtime>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let state = AppState {
        store: runtime.store.clone(),
        domain: runtime.config.domain.clone(),
    };
    let app = router(state);

    let addr = runtime.config.http_listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await
        .with_context(|| format!("HTTP bind {} failed", addr))?;
    info!("HTTP API server listening on {}", addr);

    axum
        ::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("HTTP server shutting down");
        }).await?;
    Ok(())
}
