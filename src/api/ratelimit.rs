use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ ConnectInfo, Request, State };
use axum::http::{ Method, StatusCode };
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use super::error::{ ApiError, ERR_RATE_LIMIT_EXCEEDED };
use super::AppState;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy)]
struct RateLimitClass {
    prefix: &'static str,
    limit: u32,
}

const READS: RateLimitClass = RateLimitClass { prefix: "inbox", limit: 60 };
const MUTATIONS: RateLimitClass = RateLimitClass { prefix: "delete", limit: 30 };
const GENERATE: RateLimitClass = RateLimitClass { prefix: "generate", limit: 10 };

/// Inbox routes: 60 reads or 30 mutations per minute per client IP.
pub async fn inbox_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next
) -> Result<Response, ApiError> {
    let class = if request.method() == Method::GET { READS } else { MUTATIONS };
    limit_request(&state, class, request, next).await
}

/// Identity generation: 10 per minute per client IP.
pub async fn generate_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next
) -> Result<Response, ApiError> {
    limit_request(&state, GENERATE, request, next).await
}

async fn limit_request(
    state: &AppState,
    class: RateLimitClass,
    request: Request,
    next: Next
) -> Result<Response, ApiError> {
    let ip = client_ip(&request);
    let key = format!("{}:{}", class.prefix, ip);

    match state.store.check_rate_limit(&key, class.limit, WINDOW).await {
        Ok((true, _)) => Ok(next.run(request).await),
        Ok((false, _)) => Err(
            ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                ERR_RATE_LIMIT_EXCEEDED,
                "Rate limit exceeded"
            )
        ),
        Err(e) => {
            // The counter is non-authoritative: fail open on store errors.
            warn!("Rate limit check error for {}: {}", key, e);
            Ok(next.run(request).await)
        }
    }
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
