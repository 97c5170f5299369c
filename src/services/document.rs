//! Document service — owner-scoped CRUD.
//!
//! Shape and draw-event rows cascade on document delete (schema-level), so
//! a delete here is the whole-canvas teardown.

use sqlx::PgPool;
use uuid::Uuid;

use crate::message::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::message::ErrorCode for DocumentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_DOCUMENT_NOT_FOUND",
            Self::Database(_) => "E_PERSISTENCE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Row returned from document queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentRow {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub last_modified: i64,
}

/// Create a new document owned by `owner_id`.
pub async fn create_document(pool: &PgPool, name: &str, owner_id: Uuid) -> Result<DocumentRow, DocumentError> {
    let id = Uuid::new_v4();
    let last_modified = now_ms();
    sqlx::query("INSERT INTO documents (id, name, owner_id, last_modified) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(name)
        .bind(owner_id)
        .bind(last_modified)
        .execute(pool)
        .await?;

    Ok(DocumentRow { id, name: name.to_owned(), owner_id, last_modified })
}

/// List the caller's documents, most recently modified first.
pub async fn list_documents(pool: &PgPool, owner_id: Uuid) -> Result<Vec<DocumentRow>, DocumentError> {
    let rows = sqlx::query_as::<_, (Uuid, String, Uuid, i64)>(
        "SELECT id, name, owner_id, last_modified FROM documents \
         WHERE owner_id = $1 ORDER BY last_modified DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, name, owner_id, last_modified)| DocumentRow { id, name, owner_id, last_modified })
        .collect())
}

pub async fn get_document(pool: &PgPool, document_id: Uuid) -> Result<DocumentRow, DocumentError> {
    let row = sqlx::query_as::<_, (Uuid, String, Uuid, i64)>(
        "SELECT id, name, owner_id, last_modified FROM documents WHERE id = $1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DocumentError::NotFound(document_id))?;

    let (id, name, owner_id, last_modified) = row;
    Ok(DocumentRow { id, name, owner_id, last_modified })
}

/// Rename a document the caller owns.
pub async fn rename_document(
    pool: &PgPool,
    document_id: Uuid,
    owner_id: Uuid,
    name: &str,
) -> Result<(), DocumentError> {
    let result = sqlx::query("UPDATE documents SET name = $3, last_modified = $4 WHERE id = $1 AND owner_id = $2")
        .bind(document_id)
        .bind(owner_id)
        .bind(name)
        .bind(now_ms())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DocumentError::NotFound(document_id));
    }
    Ok(())
}

/// Delete a document the caller owns. Shapes and draw events cascade.
pub async fn delete_document(pool: &PgPool, document_id: Uuid, owner_id: Uuid) -> Result<(), DocumentError> {
    let result = sqlx::query("DELETE FROM documents WHERE id = $1 AND owner_id = $2")
        .bind(document_id)
        .bind(owner_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DocumentError::NotFound(document_id));
    }
    Ok(())
}
