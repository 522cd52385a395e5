use axum::{extract::State, http::StatusCode, Json};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::shared::validation_error;
use crate::{
    auth::{
        create_access_token, create_refresh_token, hash_password, hash_refresh_token,
        validate_token, verify_password, TokenType,
    },
    error::{AppError, AppResult},
    models::{generate_id, now_rfc3339, User, UserDto},
    state::AppState,
};

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("invalid username regex"));

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(
        length(min = 3, max = 32, message = "Username must be 3–32 characters"),
        regex(
            path = *USERNAME_RE,
            message = "Username may only contain letters, digits, and underscores"
        )
    )]
    pub username: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserDto,
}

// ============================================================================
// Helpers
// ============================================================================

/// Issue a fresh access/refresh pair and persist the refresh token's hash.
async fn issue_tokens(state: &AppState, user: &User) -> AppResult<(String, String)> {
    let access_token = create_access_token(user.id, user.username.clone(), &state.jwt_secret)?;
    let refresh_token = create_refresh_token(user.id, user.username.clone(), &state.jwt_secret)?;

    let expires_at = (chrono::Utc::now() + chrono::Duration::days(7)).to_rfc3339();
    sqlx::query(
        "INSERT INTO sessions (id, user_id, refresh_token_hash, expires_at, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(generate_id() as i64)
    .bind(user.id as i64)
    .bind(hash_refresh_token(&refresh_token))
    .bind(expires_at)
    .bind(now_rfc3339())
    .execute(&state.pool)
    .await?;

    Ok((access_token, refresh_token))
}

async fn fetch_user_by_id(state: &AppState, user_id: u64) -> AppResult<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, avatar_url, created_at, updated_at
         FROM users WHERE id = $1",
    )
    .bind(user_id as i64)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::Auth("User no longer exists".into()))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /auth/register — create an account and log straight in.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    req.validate().map_err(validation_error)?;

    let password_hash = hash_password(&req.password)?;
    let now = now_rfc3339();

    // The unique indices on username/email turn races into 409s.
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, username, email, password_hash, status, created_at, updated_at)
         VALUES ($1, $2, $3, $4, 'offline', $5, $6)
         RETURNING id, username, email, password_hash, avatar_url, created_at, updated_at",
    )
    .bind(generate_id() as i64)
    .bind(&req.username)
    .bind(&req.email)
    .bind(&password_hash)
    .bind(&now)
    .bind(&now)
    .fetch_one(&state.pool)
    .await?;

    info!(user_id = user.id, username = %user.username, "User registered");

    let (access_token, refresh_token) = issue_tokens(&state, &user).await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            refresh_token,
            user: user.into(),
        }),
    ))
}

/// POST /auth/login — exchange credentials for a token pair.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, email, password_hash, avatar_url, created_at, updated_at
         FROM users WHERE username = $1",
    )
    .bind(&req.username)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::Auth("Invalid username or password".into()))?;

    if !verify_password(&req.password, &user.password_hash)? {
        return Err(AppError::Auth("Invalid username or password".into()));
    }

    info!(user_id = user.id, username = %user.username, "Login successful");

    let (access_token, refresh_token) = issue_tokens(&state, &user).await?;

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: user.into(),
    }))
}

/// POST /auth/refresh — rotate a refresh token for a new pair.
///
/// The presented token must both validate as a JWT and match a stored
/// session hash; rotation deletes the old session so a replayed token is
/// rejected.
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<AuthResponse>> {
    let claims = validate_token(&req.refresh_token, &state.jwt_secret)?;
    if claims.token_type != TokenType::Refresh {
        return Err(AppError::Auth("Refresh token required".into()));
    }
    let user_id = claims.user_id()?;

    let token_hash = hash_refresh_token(&req.refresh_token);
    let deleted = sqlx::query(
        "DELETE FROM sessions
         WHERE user_id = $1 AND refresh_token_hash = $2 AND expires_at > $3",
    )
    .bind(user_id as i64)
    .bind(&token_hash)
    .bind(now_rfc3339())
    .execute(&state.pool)
    .await?;

    if deleted.rows_affected() == 0 {
        return Err(AppError::Auth("Refresh token revoked or expired".into()));
    }

    let user = fetch_user_by_id(&state, user_id).await?;
    let (access_token, refresh_token) = issue_tokens(&state, &user).await?;

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: user.into(),
    }))
}
