use axum::http::StatusCode;
use axum::response::{ IntoResponse, Response };
use axum::Json;
use serde::Serialize;
use serde_json::Value;

pub const ERR_INVALID_ADDRESS: &str = "INVALID_ADDRESS";
pub const ERR_NOT_FOUND: &str = "NOT_FOUND";
pub const ERR_INTERNAL_ERROR: &str = "INTERNAL_ERROR";
pub const ERR_SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
pub const ERR_RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const ERR_UNAUTHORIZED: &str = "UNAUTHORIZED";

#[derive(Serialize)]
struct ErrorDetails {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

/// Structured error envelope: every failing response carries
/// `{"error":{"code","message","details?"}}` and the class in the status.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ERR_UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ERR_INTERNAL_ERROR, message)
    }

    pub fn invalid_address(provided: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ERR_INVALID_ADDRESS, "Invalid address format")
            .with_details(serde_json::json!({
                "provided": provided,
                "expected_length": crate::identity::ADDRESS_LENGTH,
            }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetails {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
