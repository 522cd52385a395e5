use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub username: String,
    /// Distinguishes access tokens (short-lived) from refresh tokens
    /// (long-lived). AuthUser and the WebSocket upgrade reject refresh
    /// tokens so they cannot be used as bearer credentials.
    pub token_type: TokenType,
}

impl Claims {
    fn new(user_id: u64, username: String, expiration_minutes: i64, token_type: TokenType) -> Self {
        let now = Utc::now();
        let exp = now + Duration::minutes(expiration_minutes);

        Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            username,
            token_type,
        }
    }

    /// The subject is a snowflake ID in decimal-string form.
    pub fn user_id(&self) -> AppResult<u64> {
        self.sub
            .parse()
            .map_err(|_| AppError::Auth("Invalid user ID in token".into()))
    }
}

// ============================================================================
// JWT Operations
// ============================================================================

pub fn create_access_token(user_id: u64, username: String, secret: &str) -> AppResult<String> {
    let claims = Claims::new(user_id, username, 15, TokenType::Access);

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!("Failed to create access token: {:?}", e);
        AppError::Auth("Failed to create token".into())
    })
}

pub fn create_refresh_token(user_id: u64, username: String, secret: &str) -> AppResult<String> {
    let claims = Claims::new(user_id, username, 10080, TokenType::Refresh); // 7 days

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!("Failed to create refresh token: {:?}", e);
        AppError::Auth("Failed to create refresh token".into())
    })
}

pub fn validate_token(token: &str, secret: &str) -> AppResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::warn!("Token validation failed: {:?}", e);
        AppError::Auth("Invalid or expired token".into())
    })
}

// ============================================================================
// Refresh Token Hashing
// ============================================================================

/// Hash a refresh token with SHA-256 for deterministic storage and lookup.
/// bcrypt is intentionally NOT used here because it is non-deterministic —
/// the same input produces different hashes on every call, making DB lookups
/// by hash impossible without scanning all rows.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Password Hashing
// ============================================================================

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, 12).map_err(|e| {
        tracing::error!("Failed to hash password: {:?}", e);
        AppError::Internal
    })
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| {
        tracing::error!("Failed to verify password: {:?}", e);
        AppError::Internal
    })
}

// ============================================================================
// Auth Middleware
// ============================================================================

/// Authenticated user extracted from a valid access-token bearer header.
///
/// Fields are private: the only valid constructor is the `FromRequestParts`
/// impl, preventing callers from forging an `AuthUser` via struct literal.
pub struct AuthUser {
    user_id: u64,
    username: String,
}

impl AuthUser {
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn auth_error(message: &str) -> AuthRejection {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| auth_error("Missing or invalid Authorization header"))?;

        let claims = validate_token(bearer.token(), &state.jwt_secret)
            .map_err(|_| auth_error("Invalid or expired token"))?;

        // Reject refresh tokens used as access tokens — they have a 7-day
        // expiry and must never be accepted on protected API endpoints.
        if claims.token_type != TokenType::Access {
            return Err(auth_error("Invalid token type"));
        }

        let user_id = claims
            .user_id()
            .map_err(|_| auth_error("Invalid token subject"))?;

        Ok(AuthUser {
            user_id,
            username: claims.username,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-min-32-characters-long!!";

    // ------------------------------------------------------------------------
    // hash_refresh_token
    // ------------------------------------------------------------------------

    #[test]
    fn hash_refresh_token_is_64_char_hex() {
        let hash = hash_refresh_token("some-random-token");
        assert_eq!(hash.len(), 64, "SHA-256 hex output must be 64 characters");
        assert!(
            hash.chars().all(|c| c.is_ascii_hexdigit()),
            "Output must be lowercase hex"
        );
    }

    #[test]
    fn hash_refresh_token_is_deterministic() {
        let token = "deterministic-test-token";
        let h1 = hash_refresh_token(token);
        let h2 = hash_refresh_token(token);
        assert_eq!(h1, h2, "Same input must always produce the same hash");
    }

    // ------------------------------------------------------------------------
    // create_access_token / validate_token
    // ------------------------------------------------------------------------

    #[test]
    fn access_token_roundtrip_happy_path() {
        let user_id = crate::models::generate_id();
        let username = "alice".to_string();

        let token = create_access_token(user_id, username.clone(), TEST_SECRET)
            .expect("create_access_token should succeed");

        let claims = validate_token(&token, TEST_SECRET)
            .expect("validate_token should succeed for a fresh access token");

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.username, username);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn access_and_refresh_tokens_are_distinguishable() {
        let user_id = crate::models::generate_id();
        let username = "carol".to_string();

        let access_token = create_access_token(user_id, username.clone(), TEST_SECRET)
            .expect("create_access_token should succeed");
        let refresh_token = create_refresh_token(user_id, username, TEST_SECRET)
            .expect("create_refresh_token should succeed");

        let access_claims = validate_token(&access_token, TEST_SECRET)
            .expect("access token validation should succeed");
        let refresh_claims = validate_token(&refresh_token, TEST_SECRET)
            .expect("refresh token validation should succeed");

        assert_eq!(access_claims.token_type, TokenType::Access);
        assert_eq!(refresh_claims.token_type, TokenType::Refresh);
    }

    #[test]
    fn validate_token_rejects_wrong_secret() {
        let token = create_access_token(1, "dave".to_string(), TEST_SECRET)
            .expect("create_access_token should succeed");

        let result = validate_token(&token, "completely-different-secret-value!!");
        assert!(
            result.is_err(),
            "validate_token must reject a token signed with a different secret"
        );
    }

    #[test]
    fn validate_token_rejects_malformed_string() {
        assert!(validate_token("this.is.not.a.valid.jwt", TEST_SECRET).is_err());
        assert!(validate_token("", TEST_SECRET).is_err());
    }

    // ------------------------------------------------------------------------
    // hash_password + verify_password roundtrip
    // ------------------------------------------------------------------------

    #[test]
    fn password_hash_verify_roundtrip() {
        let password = "super-secure-password-123!";
        let hash = hash_password(password).expect("hash_password should succeed");

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong-password", &hash).unwrap());
    }

    // ------------------------------------------------------------------------
    // Claims::user_id() parses snowflake subjects
    // ------------------------------------------------------------------------

    #[test]
    fn claims_user_id_parses_decimal_subject() {
        let expected_id = u64::MAX - 7;
        let token = create_access_token(expected_id, "eve".to_string(), TEST_SECRET)
            .expect("create_access_token should succeed");

        let claims = validate_token(&token, TEST_SECRET).expect("validate_token should succeed");

        assert_eq!(claims.user_id().unwrap(), expected_id);
    }

    #[test]
    fn claims_user_id_rejects_invalid_sub() {
        let claims = Claims {
            sub: "not-a-number".to_string(),
            exp: 9999999999,
            iat: 0,
            username: "frank".to_string(),
            token_type: TokenType::Access,
        };

        assert!(claims.user_id().is_err());
    }
}
