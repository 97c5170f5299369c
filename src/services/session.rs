//! Session tokens and connection authentication.
//!
//! ARCHITECTURE
//! ============
//! HTTP login issues a long-lived random session token. The websocket
//! upgrade carries the same token as a query parameter and is verified
//! through the `Authenticator` contract before any room logic runs; the
//! event router depends only on `verify`.

use std::fmt::Write;

use async_trait::async_trait;
use rand::Rng;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a cryptographically random 32-byte hex token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

// =============================================================================
// AUTHENTICATOR
// =============================================================================

/// Verified identity attached to a connection before dispatch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Credential verification contract. The only authentication surface the
/// event router sees.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` means the token is missing, expired, or unknown.
    async fn verify(&self, token: &str) -> Result<Option<Identity>, sqlx::Error>;
}

/// Production authenticator: sessions table joined to users, with expiry.
pub struct PgAuthenticator {
    pool: PgPool,
}

impl PgAuthenticator {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Authenticator for PgAuthenticator {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, sqlx::Error> {
        validate_session(&self.pool, token).await
    }
}

// =============================================================================
// SESSION CRUD
// =============================================================================

/// Create a session for the given user, returning the token.
pub async fn create_session(pool: &PgPool, user_id: Uuid) -> Result<String, sqlx::Error> {
    let token = generate_token();
    sqlx::query("INSERT INTO sessions (token, user_id) VALUES ($1, $2)")
        .bind(&token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(token)
}

/// Validate a session token and return the associated identity.
pub async fn validate_session(pool: &PgPool, token: &str) -> Result<Option<Identity>, sqlx::Error> {
    let row = sqlx::query(
        r"SELECT u.id, u.name
          FROM sessions s
          JOIN users u ON u.id = s.user_id
          WHERE s.token = $1 AND s.expires_at > now()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| Identity { user_id: r.get("id"), username: r.get("name") }))
}

/// Delete a session by token.
pub async fn delete_session(pool: &PgPool, token: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE token = $1")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

// =============================================================================
// TEST DOUBLE
// =============================================================================

#[cfg(test)]
pub(crate) use static_auth::StaticAuthenticator;


#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
