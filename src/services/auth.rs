//! Local account auth — username/password registration and login.

use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::services::session::bytes_to_hex;

const MIN_PASSWORD_LEN: usize = 8;
const SALT_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username")]
    InvalidUsername,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("username already taken")]
    NameTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Lowercased, trimmed username of 3–32 word characters, or `None`.
#[must_use]
pub fn normalize_username(name: &str) -> Option<String> {
    let normalized = name.trim().to_ascii_lowercase();
    if normalized.len() < 3
        || normalized.len() > 32
        || !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(normalized)
}

fn generate_salt() -> String {
    let bytes: [u8; SALT_LEN] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn hash_with_salt(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    bytes_to_hex(&hasher.finalize())
}

/// Produce a `salt$hash` credential string.
#[must_use]
pub fn hash_password(password: &str) -> String {
    let salt = generate_salt();
    let hash = hash_with_salt(&salt, password);
    format!("{salt}${hash}")
}

/// Constant-shape verification against a stored `salt$hash` string.
#[must_use]
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    hash_with_salt(salt, password) == hash
}

/// Create a user account. Returns the new user's id.
pub async fn register(pool: &PgPool, username: &str, password: &str) -> Result<Uuid, AuthError> {
    let name = normalize_username(username).ok_or(AuthError::InvalidUsername)?;
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }

    let row = sqlx::query(
        "INSERT INTO users (id, name, password_hash) VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO NOTHING RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(hash_password(password))
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.get("id")).ok_or(AuthError::NameTaken)
}

/// Verify credentials. Returns the user's id on success.
pub async fn login(pool: &PgPool, username: &str, password: &str) -> Result<Uuid, AuthError> {
    let name = normalize_username(username).ok_or(AuthError::InvalidCredentials)?;

    let row = sqlx::query("SELECT id, password_hash FROM users WHERE name = $1")
        .bind(&name)
        .fetch_optional(pool)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    let stored: String = row.get("password_hash");
    if !verify_password(&stored, password) {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(row.get("id"))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
