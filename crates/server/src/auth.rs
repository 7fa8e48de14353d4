//! Bearer-token verification.
//!
//! The token is an HS256 JWT. Tenant, user, and role come exclusively from
//! verified claims; request bodies are never consulted for identity.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use taskdeck_core::identity::{ActorRole, RequestContext, TenantId, UserId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed bearer token")]
    Malformed,
    #[error("token signature verification failed")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token role is not recognized")]
    UnknownRole,
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    tenant_id: String,
    role: String,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies the `Authorization: Bearer` token and derives the request
/// identity from its claims.
pub fn authenticate(
    headers: &HeaderMap,
    secret: &SecretString,
) -> Result<RequestContext, AuthError> {
    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let token = header_value.strip_prefix("Bearer ").ok_or(AuthError::MissingToken)?;

    verify_token(token, secret)
}

pub fn verify_token(token: &str, secret: &SecretString) -> Result<RequestContext, AuthError> {
    let mut segments = token.split('.');
    let (header_b64, claims_b64, signature_b64) =
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(AuthError::Malformed),
        };

    let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| AuthError::Malformed)?;

    // Constant-time comparison via the Mac verifier, not a byte equality.
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| AuthError::BadSignature)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature).map_err(|_| AuthError::BadSignature)?;

    let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| AuthError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
    if header.alg != "HS256" {
        return Err(AuthError::Malformed);
    }

    let claims_bytes = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| AuthError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::Malformed)?;

    if let Some(exp) = claims.exp {
        if exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
    }

    let role = ActorRole::parse(&claims.role).ok_or(AuthError::UnknownRole)?;

    Ok(RequestContext {
        tenant_id: TenantId(claims.tenant_id),
        user_id: UserId(claims.sub),
        role,
    })
}
