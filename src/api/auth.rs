use std::time::Duration;

use axum::body::Body;
use axum::extract::{ RawPathParams, Request, State };
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use sha2::{ Digest, Sha256 };
use tracing::{ debug, warn };
use uuid::Uuid;

use crate::identity;
use super::error::{ ApiError, ERR_UNAUTHORIZED };
use super::AppState;

/// Signed requests are valid for this long on either side of the server
/// clock; spent nonces are remembered for the same window.
pub const SIGNATURE_WINDOW: Duration = Duration::from_secs(5 * 60);

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the canonical string a client signs. Clients must reproduce it
/// byte for byte: raw request path, decimal timestamp, lowercase-hex
/// SHA-256 of the exact body bytes (empty body hashes the empty string).
pub fn message_to_sign(
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    nonce: &str
) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{}:{}:{}:{}:{}", method, path, timestamp, body_hash, nonce)
}

/// Per-request signature authentication.
///
/// Verification order is fixed and every failure message is generic; the
/// middleware never reveals which step failed beyond the status class:
/// header presence, nonce shape, timestamp freshness, key/signature shape,
/// pubkey-to-path binding, signature over the canonical payload, and
/// finally the one-time nonce burn.
pub async fn signature_auth(
    State(state): State<AppState>,
    params: RawPathParams,
    request: Request,
    next: Next
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let pubkey_hex = header_value(headers, "X-Public-Key");
    let sig_hex = header_value(headers, "X-Signature");
    let ts_str = header_value(headers, "X-Timestamp");
    let nonce = header_value(headers, "X-Nonce");

    let (Some(pubkey_hex), Some(sig_hex), Some(ts_str), Some(nonce)) =
        (pubkey_hex, sig_hex, ts_str, nonce)
    else {
        return Err(ApiError::unauthorized("Missing authentication headers"));
    };

    if Uuid::parse_str(&nonce).is_err() {
        return Err(ApiError::unauthorized("Invalid nonce format"));
    }

    let Ok(ts) = ts_str.parse::<i64>() else {
        return Err(ApiError::unauthorized("Invalid timestamp format"));
    };
    if (Utc::now().timestamp() - ts).abs() > SIGNATURE_WINDOW.as_secs() as i64 {
        return Err(ApiError::unauthorized("Request expired or invalid timestamp"));
    }

    let pubkey = match hex::decode(&pubkey_hex) {
        Ok(bytes) if bytes.len() == 32 => bytes,
        _ => {
            return Err(ApiError::unauthorized("Invalid public key format"));
        }
    };
    let signature = match hex::decode(&sig_hex) {
        Ok(bytes) if bytes.len() == 64 => bytes,
        _ => {
            return Err(ApiError::unauthorized("Invalid signature format"));
        }
    };

    let derived_address = identity::address_from_pubkey(&pubkey);
    let Some(address) = params
        .iter()
        .find(|(name, _)| *name == "address")
        .map(|(_, value)| value.to_string())
    else {
        return Err(
            ApiError::new(StatusCode::BAD_REQUEST, ERR_UNAUTHORIZED, "Missing address parameter")
        );
    };
    if address != derived_address {
        return Err(
            ApiError::new(
                StatusCode::FORBIDDEN,
                ERR_UNAUTHORIZED,
                "Access denied: address does not match public key"
            )
        );
    }

    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await
        .map_err(|_| ApiError::internal("Failed to read request body"))?;

    let payload = message_to_sign(
        parts.method.as_str(),
        parts.uri.path(),
        &ts_str,
        &body_bytes,
        &nonce
    );
    debug!("Verifying signature for {} {}", parts.method, parts.uri.path());

    if identity::verify_signature(&pubkey, payload.as_bytes(), &signature).is_err() {
        return Err(ApiError::unauthorized("Invalid cryptographic signature"));
    }

    // Nonce store failures fail closed.
    match state.store.check_and_store_nonce(&nonce, SIGNATURE_WINDOW).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(ApiError::unauthorized("Nonce already used"));
        }
        Err(e) => {
            warn!("Nonce check error: {}", e);
            return Err(ApiError::internal("Failed to verify nonce"));
        }
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}

fn header_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}
