//! Access-token authentication.
//!
//! Bearer credentials are HS256 JWTs carrying the user id in `sub`.
//! Signature and expiry are both verified; a bad signature, an expired
//! token, and a malformed token all yield the same `Unauthorized` —
//! callers learn nothing about which check failed.

use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::UserId;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, stringified (JWT convention).
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Access-token lifetime: 7 days.
const TOKEN_TTL_SECS: i64 = 60 * 60 * 24 * 7;

/// Issue an access token for a user. Used by the (out-of-scope) login
/// service and by tests.
pub fn issue_access_token(secret: &str, user_id: UserId) -> Result<String, BridgeError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| BridgeError::Unauthorized)
}

/// Decode a bearer credential into a user id.
pub fn decode_access_token(secret: &str, token: &str) -> Result<UserId, BridgeError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| BridgeError::Unauthorized)?;
    data.claims
        .sub
        .parse::<UserId>()
        .map_err(|_| BridgeError::Unauthorized)
}

/// Pick the credential for a connection attempt: the `token` query
/// parameter wins, otherwise the Authorization header with any
/// `Bearer ` prefix stripped.
pub fn extract_credential<'a>(
    query_token: Option<&'a str>,
    auth_header: Option<&'a str>,
) -> Option<&'a str> {
    match query_token {
        Some(t) if !t.is_empty() => Some(t),
        _ => auth_header
            .map(|h| h.strip_prefix("Bearer ").unwrap_or(h))
            .filter(|t| !t.is_empty()),
    }
}

/// Resolve the authenticated user for an HTTP request from its
/// Authorization header.
pub fn authenticate(secret: &str, headers: &HeaderMap) -> Result<UserId, BridgeError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let token = extract_credential(None, auth_header).ok_or(BridgeError::Unauthorized)?;
    decode_access_token(secret, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn round_trip() {
        let token = issue_access_token(SECRET, 42).unwrap();
        assert_eq!(decode_access_token(SECRET, &token).unwrap(), 42);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_access_token(SECRET, 42).unwrap();
        assert!(matches!(
            decode_access_token("other-secret", &token),
            Err(BridgeError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "42".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            decode_access_token(SECRET, &token),
            Err(BridgeError::Unauthorized)
        ));
    }

    #[test]
    fn garbage_token_rejected() {
        assert!(decode_access_token(SECRET, "not-a-jwt").is_err());
    }

    #[test]
    fn query_param_wins_over_header() {
        assert_eq!(
            extract_credential(Some("qtok"), Some("Bearer htok")),
            Some("qtok")
        );
        assert_eq!(
            extract_credential(None, Some("Bearer htok")),
            Some("htok")
        );
        assert_eq!(extract_credential(Some(""), Some("htok")), Some("htok"));
        assert_eq!(extract_credential(None, None), None);
    }
}
