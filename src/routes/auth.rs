//! Auth routes — registration, login, session management.

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use time::Duration;

use crate::services::{auth as auth_svc, session};
use crate::state::AppState;

const COOKIE_NAME: &str = "session_token";

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

pub(crate) fn cookie_secure() -> bool {
    if let Some(value) = env_bool("COOKIE_SECURE") {
        return value;
    }

    std::env::var("PUBLIC_URL")
        .map(|uri| uri.starts_with("https://"))
        .unwrap_or(false)
}

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .secure(cookie_secure())
        .build()
}

fn clear_session_cookie() -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, ""))
        .path("/")
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .secure(cookie_secure())
        .max_age(Duration::ZERO)
        .build()
}

/// Extract a session token from the `Authorization: Bearer` header or the
/// session cookie, header winning.
fn extract_token(parts: &axum::http::request::Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_owned());
    }

    let jar = CookieJar::from_headers(&parts.headers);
    jar.get(COOKIE_NAME)
        .map(Cookie::value)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the bearer header or session cookie.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub identity: session::Identity,
    pub token: String,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = extract_token(parts) else {
            return Err(StatusCode::UNAUTHORIZED);
        };

        let app_state = AppState::from_ref(state);
        let identity = app_state
            .auth
            .verify(&token)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { identity, token })
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn auth_error_response(e: &auth_svc::AuthError) -> Response {
    use auth_svc::AuthError;
    let status = match e {
        AuthError::InvalidUsername | AuthError::WeakPassword => StatusCode::BAD_REQUEST,
        AuthError::NameTaken => StatusCode::CONFLICT,
        AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AuthError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// `POST /api/auth/register` — create an account and start a session.
pub async fn register(State(state): State<AppState>, Json(creds): Json<Credentials>) -> Response {
    if state.rate_limiter.check_and_record(&creds.username).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let user_id = match auth_svc::register(&state.pool, &creds.username, &creds.password).await {
        Ok(id) => id,
        Err(e) => return auth_error_response(&e),
    };

    let token = match session::create_session(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "session creation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let jar = CookieJar::new().add(session_cookie(token.clone()));
    (
        jar,
        Json(serde_json::json!({ "user_id": user_id, "token": token })),
    )
        .into_response()
}

/// `POST /api/auth/login` — verify credentials and start a session.
pub async fn login(State(state): State<AppState>, Json(creds): Json<Credentials>) -> Response {
    if state.rate_limiter.check_and_record(&creds.username).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let user_id = match auth_svc::login(&state.pool, &creds.username, &creds.password).await {
        Ok(id) => id,
        Err(e) => return auth_error_response(&e),
    };

    let token = match session::create_session(&state.pool, user_id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "session creation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let jar = CookieJar::new().add(session_cookie(token.clone()));
    (
        jar,
        Json(serde_json::json!({ "user_id": user_id, "token": token })),
    )
        .into_response()
}

/// `GET /api/auth/me` — return the current identity.
pub async fn me(auth: AuthUser) -> Json<session::Identity> {
    Json(auth.identity)
}

/// `POST /api/auth/logout` — delete session, clear cookie.
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    let _ = session::delete_session(&state.pool, &auth.token).await;

    let jar = CookieJar::new().add(clear_session_cookie());
    (jar, StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
