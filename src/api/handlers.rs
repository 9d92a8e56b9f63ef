use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{ Path, State };
use axum::http::StatusCode;
use axum::Json;
use chrono::SecondsFormat;
use serde::{ Deserialize, Serialize };
use tracing::error;

use crate::identity;
use crate::storage::Email;
use super::error::{ ApiError, ERR_NOT_FOUND };
use super::AppState;

/// Registration window; inbox keys share the same 24-hour lifetime.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Serialize)]
pub struct EmailResponse {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: String,
}

impl From<Email> for EmailResponse {
    fn from(email: Email) -> Self {
        Self {
            id: email.id,
            from: email.from,
            to: email.to,
            subject: email.subject,
            body: email.body,
            received_at: email.received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Serialize)]
pub struct InboxResponse {
    pub address: String,
    pub email: String,
    pub count: usize,
    pub emails: Vec<EmailResponse>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub registered: bool,
    pub address: String,
    pub expires_in: u64,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

#[derive(Serialize)]
pub struct GenerateMnemonicResponse {
    pub mnemonic: String,
    pub address: String,
    pub public_key: String,
    pub email: String,
}

#[derive(Deserialize)]
pub struct DeriveAddressRequest {
    pub mnemonic: String,
}

#[derive(Serialize)]
pub struct DeriveAddressResponse {
    pub address: String,
    pub email: String,
    pub public_key: String,
    pub valid: bool,
}

#[derive(Serialize)]
pub struct ValidateAddressResponse {
    pub address: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: BTreeMap<String, String>,
}

fn require_valid_address(address: &str) -> Result<(), ApiError> {
    if identity::is_valid_address(address) {
        Ok(())
    } else {
        Err(ApiError::invalid_address(address))
    }
}

pub async fn register_address(
    State(state): State<AppState>,
    Path(address): Path<String>
) -> Result<Json<RegisterResponse>, ApiError> {
    require_valid_address(&address)?;

    state.store
        .register_address(&address, REGISTRATION_TTL).await
        .map_err(|e| {
            error!("Error registering address: {}", e);
            ApiError::internal("Failed to register address")
        })?;

    Ok(
        Json(RegisterResponse {
            registered: true,
            address,
            expires_in: REGISTRATION_TTL.as_secs(),
        })
    )
}

pub async fn get_inbox(
    State(state): State<AppState>,
    Path(address): Path<String>
) -> Result<Json<InboxResponse>, ApiError> {
    require_valid_address(&address)?;

    let emails = state.store
        .get_emails(&address).await
        .map_err(|e| {
            error!("Error getting emails: {}", e);
            ApiError::internal("Failed to retrieve emails")
        })?;

    let emails: Vec<EmailResponse> = emails.into_iter().map(Into::into).collect();
    Ok(
        Json(InboxResponse {
            email: format!("{}@{}", address, state.domain),
            count: emails.len(),
            address,
            emails,
        })
    )
}

pub async fn get_email(
    State(state): State<AppState>,
    Path((address, email_id)): Path<(String, String)>
) -> Result<Json<EmailResponse>, ApiError> {
    require_valid_address(&address)?;

    let email = state.store
        .get_email(&address, &email_id).await
        .map_err(|e| {
            error!("Error getting email: {}", e);
            ApiError::internal("Failed to retrieve email")
        })?;

    match email {
        Some(email) => Ok(Json(email.into())),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, ERR_NOT_FOUND, "Email not found")),
    }
}

pub async fn delete_email(
    State(state): State<AppState>,
    Path((address, email_id)): Path<(String, String)>
) -> Result<Json<DeleteResponse>, ApiError> {
    require_valid_address(&address)?;

    state.store
        .delete_email(&address, &email_id).await
        .map_err(|e| {
            error!("Error deleting email: {}", e);
            ApiError::internal("Failed to delete email")
        })?;

    Ok(
        Json(DeleteResponse {
            deleted: true,
            id: Some(email_id),
            count: None,
        })
    )
}

pub async fn clear_inbox(
    State(state): State<AppState>,
    Path(address): Path<String>
) -> Result<Json<DeleteResponse>, ApiError> {
    require_valid_address(&address)?;

    let count = state.store
        .clear_inbox(&address).await
        .map_err(|e| {
            error!("Error clearing inbox: {}", e);
            ApiError::internal("Failed to clear inbox")
        })?;

    Ok(
        Json(DeleteResponse {
            deleted: true,
            id: None,
            count: Some(count),
        })
    )
}

pub async fn generate_identity(
    State(state): State<AppState>
) -> Result<Json<GenerateMnemonicResponse>, ApiError> {
    let mnemonic = identity::generate_mnemonic();
    let (_, pubkey) = identity::derive_keypair(&mnemonic).map_err(|e| {
        error!("Error deriving keypair: {}", e);
        ApiError::internal("Failed to derive keys")
    })?;

    let address = identity::address_from_pubkey(pubkey.as_bytes());
    Ok(
        Json(GenerateMnemonicResponse {
            mnemonic,
            email: format!("{}@{}", address, state.domain),
            public_key: hex::encode(pubkey.as_bytes()),
            address,
        })
    )
}

pub async fn derive_address(
    State(state): State<AppState>,
    Json(request): Json<DeriveAddressRequest>
) -> Json<DeriveAddressResponse> {
    let (address, public_key, valid) = match identity::derive_keypair(&request.mnemonic) {
        Ok((_, pubkey)) => (
            identity::address_from_pubkey(pubkey.as_bytes()),
            hex::encode(pubkey.as_bytes()),
            true,
        ),
        Err(_) => (String::new(), String::new(), false),
    };

    Json(DeriveAddressResponse {
        email: format!("{}@{}", address, state.domain),
        address,
        public_key,
        valid,
    })
}

pub async fn validate_address(Path(address): Path<String>) -> Json<ValidateAddressResponse> {
    let valid = identity::is_valid_address(&address.to_lowercase());
    Json(ValidateAddressResponse {
        address,
        valid,
        reason: (!valid).then(|| {
            format!("Address must be exactly {} hexadecimal characters", identity::ADDRESS_LENGTH)
        }),
    })
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let redis_status = match state.store.ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };

    let mut services = BTreeMap::new();
    services.insert("redis".to_string(), redis_status.to_string());
    services.insert("smtp".to_string(), "running".to_string());

    let status = if redis_status == "connected" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(HealthResponse { status: redis_status.to_string(), services }))
}
