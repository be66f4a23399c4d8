//! Credentials and bearer tokens.
//!
//! Tokens are self-validating signed strings, so no session state is held
//! in memory or in the database: every request re-verifies the signature
//! and expiry. Format: `role.subject.expires.sig` where `sig` is the
//! SHA-256 digest of the payload concatenated with the server secret.

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::api::{ApiError, SharedState};
use crate::errors::AuthError;
use crate::models::Role;

/// Token lifetime in seconds (12 hours).
pub const TOKEN_TTL_SECS: i64 = 12 * 60 * 60;

pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password) == stored_hash
}

#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub role: Role,
    pub subject: i64,
    pub expires_at: i64,
}

impl Claims {
    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(AuthError::WrongRole {
                actual: self.role.as_str().to_string(),
            })
        }
    }
}

fn signature(secret: &str, payload: &str) -> String {
    format!("{:x}", Sha256::digest(format!("{payload}.{secret}").as_bytes()))
}

/// Mint a signed bearer token for the given principal. Returns the token
/// and its expiry as a unix timestamp.
pub fn mint_token(secret: &str, role: Role, subject: i64, now: i64) -> (String, i64) {
    let expires_at = now + TOKEN_TTL_SECS;
    let payload = format!("{}.{}.{}", role.as_str(), subject, expires_at);
    let sig = signature(secret, &payload);
    (format!("{payload}.{sig}"), expires_at)
}

/// Verify a bearer token statelessly: parse, check the signature against
/// the server secret, then check expiry.
pub fn verify_token(secret: &str, token: &str, now: i64) -> Result<Claims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [role, subject, expires_at, sig] = parts.as_slice() else {
        return Err(AuthError::Malformed);
    };
    let role = Role::from_str(role).map_err(|_| AuthError::Malformed)?;
    let subject: i64 = subject.parse().map_err(|_| AuthError::Malformed)?;
    let expires_at: i64 = expires_at.parse().map_err(|_| AuthError::Malformed)?;

    let payload = format!("{}.{}.{}", role.as_str(), subject, expires_at);
    if signature(secret, &payload) != *sig {
        return Err(AuthError::BadSignature);
    }
    if expires_at <= now {
        return Err(AuthError::Expired);
    }
    Ok(Claims {
        role,
        subject,
        expires_at,
    })
}

/// Extractor for authenticated requests. Any valid token (admin or driver)
/// passes; handlers that are admin-only call `Claims::require_admin`.
pub struct AuthUser(pub Claims);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        let token = value.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
        let claims = verify_token(&state.token_secret, token, Utc::now().timestamp())?;
        Ok(AuthUser(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_stable_and_distinct() {
        assert_eq!(hash_password("secret"), hash_password("secret"));
        assert_ne!(hash_password("secret"), hash_password("secret2"));
        assert!(verify_password("secret", &hash_password("secret")));
        assert!(!verify_password("wrong", &hash_password("secret")));
    }

    #[test]
    fn token_round_trips() {
        let now = 1_700_000_000;
        let (token, expires_at) = mint_token("s3cret", Role::Driver, 7, now);
        assert_eq!(expires_at, now + TOKEN_TTL_SECS);

        let claims = verify_token("s3cret", &token, now + 10).unwrap();
        assert_eq!(claims.role, Role::Driver);
        assert_eq!(claims.subject, 7);
        assert_eq!(claims.expires_at, expires_at);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let now = 1_700_000_000;
        let (token, _) = mint_token("s3cret", Role::Driver, 7, now);
        // Promote the driver to admin without re-signing.
        let forged = token.replacen("driver", "admin", 1);
        assert!(matches!(
            verify_token("s3cret", &forged, now + 10),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let now = 1_700_000_000;
        let (token, _) = mint_token("other", Role::Admin, 1, now);
        assert!(matches!(
            verify_token("s3cret", &token, now + 10),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = 1_700_000_000;
        let (token, expires_at) = mint_token("s3cret", Role::Admin, 1, now);
        assert!(matches!(
            verify_token("s3cret", &token, expires_at),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for bad in ["", "a.b", "admin.x.123.sig", "ghost.1.123.sig"] {
            assert!(matches!(
                verify_token("s3cret", bad, 0),
                Err(AuthError::Malformed)
            ));
        }
    }

    #[test]
    fn role_gate_rejects_drivers() {
        let claims = Claims {
            role: Role::Driver,
            subject: 3,
            expires_at: i64::MAX,
        };
        assert!(claims.require_admin().is_err());

        let claims = Claims {
            role: Role::Admin,
            ..claims
        };
        assert!(claims.require_admin().is_ok());
    }
}
