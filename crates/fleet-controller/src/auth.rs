//! Auth & Identity (C7): password hashing, JWT minting/verification, agent
//! shared-secret checks, and login/registration rate limiting. Generalizes
//! the teacher's single static bearer-token `require_auth` middleware into a
//! full user/session model, since the spec's Controller distinguishes admin
//! and viewer roles rather than a single shared token.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use fleet_protocol::error::{ErrorKind, FleetError};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

const LOGIN_RATE_LIMIT: u32 = 5;
const REGISTER_RATE_LIMIT: u32 = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    pub role: String,
    pub exp: i64,
}

pub fn hash_password(plain: &str) -> Result<String, FleetError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST)
        .map_err(|e| FleetError::new(ErrorKind::Fatal, e.to_string()))
}

pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

pub fn mint_token(secret: &str, user_id: i64, username: &str, role: &str) -> Result<String, FleetError> {
    let exp = chrono::Utc::now() + chrono::Duration::from_std(fleet_protocol::constants::DEFAULT_TOKEN_TTL).unwrap();
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role: role.to_string(),
        exp: exp.timestamp(),
    };
    jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| FleetError::new(ErrorKind::Fatal, e.to_string()))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, FleetError> {
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| FleetError::new(ErrorKind::AuthFailed, "invalid or expired token"))
}

/// Constant-time comparison for the Agent's pre-shared shared secret,
/// mirroring the teacher's own token check.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Fixed-window rate limiter keyed by a caller-chosen string (source
/// address, username, ...). Shared between the login and registration
/// endpoints with different per-bucket limits.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, key: &str, limit: u32) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let entry = buckets.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) > RATE_LIMIT_WINDOW {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= limit
    }

    pub fn check_login(&self, key: &str) -> bool {
        self.check(key, LOGIN_RATE_LIMIT)
    }

    pub fn check_registration(&self, key: &str) -> bool {
        self.check(key, REGISTER_RATE_LIMIT)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum extractor pulling a validated bearer token out of the request and
/// resolving it to its claims. Any handler that takes `AuthUser` as an
/// argument requires a valid token; handlers that don't take it are public.
pub struct AuthUser(pub Claims);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, axum::Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header_value {
            Some(v) if v.starts_with("Bearer ") => &v[7..],
            _ => return Err(unauthorized("missing bearer token")),
        };

        verify_token(&state.jwt_secret, token)
            .map(AuthUser)
            .map_err(|_| unauthorized("invalid or expired token"))
    }
}

fn unauthorized(message: &str) -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": message, "code": "auth_failed" })),
    )
}

/// Requires the caller to hold the `admin` role; use as a second extraction
/// step after `AuthUser` in handlers that mutate shared configuration.
pub fn require_admin(claims: &Claims) -> Result<(), FleetError> {
    if claims.role == "admin" {
        Ok(())
    } else {
        Err(FleetError::new(ErrorKind::PermissionDenied, "admin role required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn token_roundtrip_and_rejects_tampering() {
        let token = mint_token("secret", 1, "admin", "admin").unwrap();
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.sub, 1);
        assert!(verify_token("wrong-secret", &token).is_err());
    }

    #[test]
    fn rate_limiter_blocks_after_threshold() {
        let limiter = RateLimiter::new();
        for _ in 0..LOGIN_RATE_LIMIT {
            assert!(limiter.check_login("1.2.3.4"));
        }
        assert!(!limiter.check_login("1.2.3.4"));
        assert!(limiter.check_login("5.6.7.8"));
    }

    #[test]
    fn constant_time_eq_matches_standard_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
