//! Bearer-token identity.
//!
//! Tokens are HS256 JWTs carrying `user_id`, `username`, `role` and `exp`.
//! Expiry is checked against the application [`Clock`] rather than the
//! system time, so tests can pin "now". Logged-out tokens are kept in
//! [`TokenRevocations`] until they would have expired anyway.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use storefront_core::UserId;
use thiserror::Error;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Tokens closer than this to expiry are renewed.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 12 * 3600;

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Buyer id
    pub user_id: i64,
    /// Display name
    pub username: String,
    /// Role name
    pub role: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Token errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("Missing bearer token")]
    MissingToken,

    /// Header present but not `Bearer <token>`.
    #[error("Malformed authorization header")]
    MalformedHeader,

    /// Signature or claims invalid.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// `exp` is in the past.
    #[error("Token expired")]
    Expired,

    /// Token was logged out.
    #[error("Token revoked")]
    Revoked,

    /// Token could not be signed.
    #[error("Token generation failed: {0}")]
    Generation(String),
}

/// Authenticated caller, available to handlers through
/// [`Extension`](axum::Extension) once [`require_auth`](crate::middleware::require_auth) ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Buyer id
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Role name
    pub role: String,
    /// Raw bearer token, needed for logout
    pub token: String,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
}

/// HS256 signing and verification keys plus lifetime policy.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    refresh_threshold: Duration,
}

impl fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtKeys")
            .field("ttl", &self.ttl)
            .field("refresh_threshold", &self.refresh_threshold)
            .finish_non_exhaustive()
    }
}

impl JwtKeys {
    /// Keys derived from a shared secret with default lifetimes.
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            refresh_threshold: Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS),
        }
    }

    /// Override token lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the renewal threshold.
    #[must_use]
    pub const fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Sign a token for `user` valid from `now` for the configured lifetime.
    ///
    /// # Errors
    ///
    /// [`AuthError::Generation`] if signing fails.
    pub fn issue(
        &self,
        user_id: UserId,
        username: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user_id.get(),
            username: username.to_string(),
            role: role.to_string(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Generation(e.to_string()))
    }

    /// Verify signature and expiry at `now`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidToken`] or [`AuthError::Expired`].
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AuthUser, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp"]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .claims;
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::InvalidToken("exp out of range".into()))?;
        if expires_at <= now {
            return Err(AuthError::Expired);
        }

        Ok(AuthUser {
            user_id: UserId::new(claims.user_id),
            username: claims.username,
            role: claims.role,
            token: token.to_string(),
            expires_at,
        })
    }

    /// A fresh token for `user` if theirs expires within the threshold.
    ///
    /// # Errors
    ///
    /// [`AuthError::Generation`] if signing fails.
    pub fn renewal(&self, user: &AuthUser, now: DateTime<Utc>) -> Result<Option<String>, AuthError> {
        if user.expires_at - now >= self.refresh_threshold {
            return Ok(None);
        }
        self.issue(user.user_id, &user.username, &user.role, now)
            .map(Some)
    }
}

/// The token part of an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Logged-out tokens, keyed by token with their original expiry.
#[derive(Debug, Default)]
pub struct TokenRevocations {
    revoked: DashMap<String, DateTime<Utc>>,
}

impl TokenRevocations {
    /// Empty revocation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `token` until `expires_at`.
    pub fn revoke(&self, token: &str, expires_at: DateTime<Utc>) {
        self.revoked.insert(token.to_string(), expires_at);
    }

    /// Whether `token` is revoked at `now`. Expired entries are evicted.
    #[must_use]
    pub fn is_revoked(&self, token: &str, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.revoked.get(token).map(|e| *e.value()) else {
            return false;
        };
        if expires_at <= now {
            self.revoked.remove(token);
            return false;
        }
        true
    }

    /// Drop entries whose token has expired; returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.revoked.len();
        self.revoked.retain(|_, expires_at| *expires_at > now);
        before - self.revoked.len()
    }

    /// Number of tracked tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use storefront_testing::test_time;

    fn keys() -> JwtKeys {
        JwtKeys::from_secret(b"an-adequately-long-test-secret-value")
    }

    #[test]
    fn issued_tokens_verify() {
        let now = test_time();
        let token = keys().issue(UserId::new(7), "ada", "buyer", now).unwrap();

        let user = keys().verify(&token, now).unwrap();

        assert_eq!(user.user_id, UserId::new(7));
        assert_eq!(user.username, "ada");
        assert_eq!(user.expires_at, now + Duration::hours(24));
    }

    #[test]
    fn expiry_uses_the_supplied_clock() {
        let now = test_time();
        let token = keys().issue(UserId::new(7), "ada", "buyer", now).unwrap();

        assert_eq!(
            keys().verify(&token, now + Duration::hours(24)),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let now = test_time();
        let token = JwtKeys::from_secret(b"someone-else")
            .issue(UserId::new(7), "ada", "buyer", now)
            .unwrap();

        assert!(matches!(
            keys().verify(&token, now),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn renewal_only_near_expiry() {
        let keys = keys();
        let issued = test_time();
        let token = keys.issue(UserId::new(7), "ada", "buyer", issued).unwrap();
        let user = keys.verify(&token, issued).unwrap();

        assert_eq!(keys.renewal(&user, issued + Duration::hours(11)).unwrap(), None);

        let later = issued + Duration::hours(13);
        let renewed = keys.renewal(&user, later).unwrap().unwrap();
        let renewed_user = keys.verify(&renewed, later).unwrap();
        assert_eq!(renewed_user.expires_at, later + Duration::hours(24));
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn revocations_expire_with_their_token() {
        let now = test_time();
        let revocations = TokenRevocations::new();
        revocations.revoke("a", now + Duration::hours(1));
        revocations.revoke("b", now + Duration::hours(3));

        assert!(revocations.is_revoked("a", now));
        assert!(!revocations.is_revoked("c", now));

        let later = now + Duration::hours(2);
        assert!(!revocations.is_revoked("a", later));
        assert_eq!(revocations.len(), 1);

        assert_eq!(revocations.purge_expired(now + Duration::hours(4)), 1);
        assert!(revocations.is_empty());
    }
}
