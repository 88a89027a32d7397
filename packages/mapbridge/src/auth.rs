//! Authentication: resolves the caller's identity for every non-public route.
//!
//! With `[auth] enabled = true` the caller presents a bearer token, either in
//! the `Authorization` header or as a `token` query parameter (browsers cannot
//! set headers on a WebSocket upgrade). Tokens are looked up in the
//! `[[auth.users]]` table.
//!
//! With auth disabled the caller simply names itself through the
//! `X-Mapbridge-User` header or a `user` query parameter. This is meant for
//! local development only.

use axum::{
    Json,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::AuthConfig;

pub const USER_HEADER: &str = "x-mapbridge-user";

// =============================================================================
// AuthUser
// =============================================================================

/// Authenticated user, inserted into request extensions by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
    /// Superusers bypass the project quota and the upload body cap.
    pub is_superuser: bool,
}

impl AuthUser {
    pub fn new(username: impl Into<String>, is_superuser: bool) -> Self {
        Self {
            username: username.into(),
            is_superuser,
        }
    }
}

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingCredentials,

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid user name: {0:?}")]
    InvalidUser(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingCredentials | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InvalidUser(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// =============================================================================
// Auth Middleware
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct CredentialQuery {
    token: Option<String>,
    user: Option<String>,
}

/// Auth middleware for HTTP and WebSocket routes.
///
/// 1. Public routes (health, metrics) → pass through
/// 2. Resolve [`AuthUser`] from token or trusted user name
/// 3. Anything unresolved → 401
pub async fn auth_middleware(
    State(auth_config): State<Arc<AuthConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    match resolve_user(&auth_config, request.headers(), request.uri()) {
        Ok(user) => {
            debug!(user = %user.username, superuser = user.is_superuser, "authenticated");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Resolve the caller from request headers and query string.
pub fn resolve_user(
    auth_config: &AuthConfig,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<AuthUser, AuthError> {
    let query = Query::<CredentialQuery>::try_from_uri(uri)
        .map(|q| q.0)
        .unwrap_or_default();

    if auth_config.enabled {
        let token = bearer_token(headers)
            .or(query.token)
            .ok_or(AuthError::MissingCredentials)?;
        let entry = auth_config
            .find_by_token(&token)
            .ok_or(AuthError::InvalidToken)?;
        return Ok(AuthUser::new(entry.username.clone(), entry.superuser));
    }

    let username = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.user)
        .filter(|u| !u.is_empty())
        .ok_or(AuthError::MissingCredentials)?;
    validate_username(&username)?;

    // A configured entry still decides the superuser flag.
    let is_superuser = auth_config
        .users
        .iter()
        .any(|u| u.username == username && u.superuser);
    Ok(AuthUser::new(username, is_superuser))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// User names become storage directory names.
fn validate_username(username: &str) -> Result<(), AuthError> {
    let ok = username != "."
        && username != ".."
        && !username.contains(['/', '\\', ':', '\0']);
    if ok {
        Ok(())
    } else {
        Err(AuthError::InvalidUser(username.to_string()))
    }
}

fn is_public_route(path: &str) -> bool {
    path == "/health" || path.starts_with("/health/") || path == "/metrics"
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract AuthUser from request extensions (set by middleware).
/// Returns 401 if not present.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)
    }
}
