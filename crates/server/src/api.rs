//! Shared JSON-API plumbing: the error envelope and the opaque cursor codec.

use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;

use taskdeck_core::audit::Cursor;
use taskdeck_core::errors::ToolError;

use crate::auth::AuthError;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub type Reject = (StatusCode, Json<ApiError>);

pub fn bad_request(message: impl Into<String>) -> Reject {
    (StatusCode::BAD_REQUEST, Json(ApiError { error: message.into(), code: None }))
}

pub fn not_found(message: impl Into<String>) -> Reject {
    (StatusCode::NOT_FOUND, Json(ApiError { error: message.into(), code: None }))
}

pub fn forbidden(message: impl Into<String>, code: &str) -> Reject {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError { error: message.into(), code: Some(code.to_string()) }),
    )
}

pub fn conflict(message: impl Into<String>, code: &str) -> Reject {
    (
        StatusCode::CONFLICT,
        Json(ApiError { error: message.into(), code: Some(code.to_string()) }),
    )
}

pub fn internal(message: impl Into<String>) -> Reject {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError { error: message.into(), code: None }),
    )
}

pub fn auth_reject(error: AuthError) -> Reject {
    let status = match error {
        AuthError::UnknownRole => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    };
    (status, Json(ApiError { error: error.to_string(), code: None }))
}

pub fn tool_reject(error: &ToolError) -> Reject {
    let status = match error {
        ToolError::RoleForbidden(_) => StatusCode::FORBIDDEN,
        ToolError::Provider(_) => StatusCode::BAD_GATEWAY,
        ToolError::HandlerNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(ApiError {
            error: error.user_message().to_string(),
            code: Some(error.code().to_string()),
        }),
    )
}

/// Surface encoding of pagination cursors. The internal `{rfc3339}:{id}`
/// form is wrapped in base64url so callers treat it as opaque.
pub fn encode_cursor(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(token.as_bytes())
}

/// Malformed tokens are rejected, never silently treated as page one.
pub fn decode_cursor(token: &str) -> Result<Cursor, Reject> {
    let cursor = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|plain| Cursor::decode(&plain).ok());
    cursor.ok_or_else(|| bad_request("malformed pagination cursor"))
}
