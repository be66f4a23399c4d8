//! Typed error hierarchy for the fleet backend.
//!
//! `AuthError` covers credential and token failures at the auth seam; the
//! API layer maps these to 401/403. Database access uses `anyhow` with
//! context and is mapped to HTTP status codes in `api.rs`.

use thiserror::Error;

/// Errors from credential checks and bearer-token verification.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingToken,

    #[error("Malformed bearer token")]
    Malformed,

    #[error("Token expired")]
    Expired,

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Role '{actual}' may not access this resource")]
    WrongRole { actual: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_variants_are_matchable() {
        let err = AuthError::WrongRole {
            actual: "driver".to_string(),
        };
        match &err {
            AuthError::WrongRole { actual } => assert_eq!(actual, "driver"),
            _ => panic!("Expected WrongRole variant"),
        }
        assert!(err.to_string().contains("driver"));
    }

    #[test]
    fn auth_error_implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AuthError::MissingToken);
        assert_std_error(&AuthError::Expired);
    }

    #[test]
    fn token_errors_have_distinct_messages() {
        assert_ne!(
            AuthError::Malformed.to_string(),
            AuthError::BadSignature.to_string()
        );
    }
}
