//! Document CRUD routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::routes::auth::AuthUser;
use crate::services::document;
use crate::state::AppState;

fn document_error_response(e: &document::DocumentError) -> Response {
    let status = match e {
        document::DocumentError::NotFound(_) => StatusCode::NOT_FOUND,
        document::DocumentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

#[derive(Deserialize)]
pub struct DocumentBody {
    pub name: String,
}

/// `POST /api/documents` — create a document owned by the caller.
pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<DocumentBody>,
) -> Response {
    let name = body.name.trim();
    if name.is_empty() || name.len() > 128 {
        return (StatusCode::BAD_REQUEST, "invalid document name").into_response();
    }

    match document::create_document(&state.pool, name, auth.identity.user_id).await {
        Ok(doc) => (StatusCode::CREATED, Json(doc)).into_response(),
        Err(e) => document_error_response(&e),
    }
}

/// `GET /api/documents` — list the caller's documents.
pub async fn list(State(state): State<AppState>, auth: AuthUser) -> Response {
    match document::list_documents(&state.pool, auth.identity.user_id).await {
        Ok(docs) => Json(docs).into_response(),
        Err(e) => document_error_response(&e),
    }
}

/// `GET /api/documents/{id}` — fetch one document by id.
pub async fn get_one(State(state): State<AppState>, _auth: AuthUser, Path(id): Path<Uuid>) -> Response {
    match document::get_document(&state.pool, id).await {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => document_error_response(&e),
    }
}

/// `PATCH /api/documents/{id}` — rename a document the caller owns.
pub async fn rename(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<DocumentBody>,
) -> Response {
    let name = body.name.trim();
    if name.is_empty() || name.len() > 128 {
        return (StatusCode::BAD_REQUEST, "invalid document name").into_response();
    }

    match document::rename_document(&state.pool, id, auth.identity.user_id, name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => document_error_response(&e),
    }
}

/// `DELETE /api/documents/{id}` — delete a document the caller owns.
pub async fn delete(State(state): State<AppState>, auth: AuthUser, Path(id): Path<Uuid>) -> Response {
    match document::delete_document(&state.pool, id, auth.identity.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => document_error_response(&e),
    }
}
