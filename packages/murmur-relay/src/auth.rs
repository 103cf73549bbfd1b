//! Handshake authentication.
//!
//! The WebSocket upgrade is authorised before any relay event runs. The
//! token comes from the `token` query parameter or an
//! `Authorization: Bearer` header.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
}

/// Result of authorising a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    /// The credentials name this identity; `identity_announce` must match.
    Identity(String),
    /// No credentials checked; the announced identity is trusted.
    Unchecked,
}

impl Verified {
    /// Whether a connection verified this way may announce `identity`.
    pub fn permits(&self, identity: &str) -> bool {
        match self {
            Self::Identity(verified) => verified == identity,
            Self::Unchecked => true,
        }
    }
}

pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, token: Option<&str>) -> Result<Verified, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// The identity the token was issued to.
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
}

/// HS256 JWT verification.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: Option<&str>) -> Result<Verified, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(Verified::Identity(data.claims.sub))
    }
}

/// Accepts every connection. For local development only.
pub struct DevVerifier;

impl IdentityVerifier for DevVerifier {
    fn verify(&self, _token: Option<&str>) -> Result<Verified, AuthError> {
        Ok(Verified::Unchecked)
    }
}

/// Pick the token from the query string, falling back to the bearer header.
pub fn extract_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    query_token.filter(|t| !t.is_empty()).or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, secret: &str, ttl_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now as usize,
            exp: (now + ttl_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let verifier = JwtVerifier::new(SECRET);
        let verified = verifier.verify(Some(&token("alice", SECRET, 3600))).unwrap();
        assert_eq!(verified, Verified::Identity("alice".to_string()));
        assert!(verified.permits("alice"));
        assert!(!verified.permits("mallory"));
    }

    #[test]
    fn test_rejections() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(verifier.verify(None), Err(AuthError::MissingToken)));
        assert!(matches!(
            verifier.verify(Some(&token("alice", "other-secret", 3600))),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            verifier.verify(Some(&token("alice", SECRET, -3600))),
            Err(AuthError::TokenExpired)
        ));
        assert!(matches!(
            verifier.verify(Some("not-a-jwt")),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_dev_verifier_trusts_announcement() {
        let verified = DevVerifier.verify(None).unwrap();
        assert!(verified.permits("anyone"));
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, None), None);
        assert_eq!(extract_token(&headers, Some("q")), Some("q"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def"),
        );
        assert_eq!(extract_token(&headers, None), Some("abc.def"));
        assert_eq!(extract_token(&headers, Some("")), Some("abc.def"));
        assert_eq!(extract_token(&headers, Some("q")), Some("q"));
    }
}
