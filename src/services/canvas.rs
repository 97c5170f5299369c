//! Durable canvas store — shapes and the bounded draw-event tail.
//!
//! DESIGN
//! ======
//! One `CanvasStore` contract, one production implementation backed by
//! Postgres. The store is the single writer-of-record for shapes and draw
//! events; shape writes go through one at a time, draw events arrive only
//! in batches from the draw buffer. An in-memory double satisfies the same
//! contract for unit tests instead of being a second production code path.
//!
//! ERROR HANDLING
//! ==============
//! Database failures map to a retryable `E_PERSISTENCE` code so the router
//! can surface them as non-fatal to the sender while the live broadcast
//! path stays unaffected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::message::Data;
use crate::shape::{self, Geometry, Shape};

/// How many draw events a join snapshot carries.
pub const SNAPSHOT_EVENT_LIMIT: i64 = 100;

// =============================================================================
// TYPES
// =============================================================================

/// An ephemeral-ish record of in-progress freehand drawing. Final strokes
/// are captured as shapes; these exist so a joining client's live preview
/// overlay is not empty mid-stroke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawEvent {
    pub id: Uuid,
    pub document_id: Uuid,
    pub created_by: Uuid,
    /// Opaque serialized point/segment data for preview frames.
    pub payload: serde_json::Value,
    pub ts: i64,
}

/// Everything a joining client needs to render the current canvas.
#[derive(Debug, Clone, Default)]
pub struct DocumentSnapshot {
    /// Ordered by `(z_index, created_at)` ascending.
    pub shapes: Vec<Shape>,
    /// The most recent events, oldest first for replay.
    pub draw_events: Vec<DrawEvent>,
    pub last_modified: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("shape not found: {0}")]
    ShapeNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::message::ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ShapeNotFound(_) => "E_SHAPE_NOT_FOUND",
            Self::Database(_) => "E_PERSISTENCE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Minimal durable-store interface the event router depends on.
#[async_trait]
pub trait CanvasStore: Send + Sync {
    /// Full shape list plus the recent draw-event tail. An unknown document
    /// is valid zero state, not an error.
    async fn document_snapshot(&self, document_id: Uuid) -> Result<DocumentSnapshot, CanvasError>;

    /// Current shape count, used to assign z-order on create.
    async fn shape_count(&self, document_id: Uuid) -> Result<i64, CanvasError>;

    async fn insert_shape(&self, shape: &Shape) -> Result<(), CanvasError>;

    /// Merge `updates` into the stored shape via `shape::apply_partial` and
    /// return the merged result; the caller broadcasts exactly that result.
    async fn update_shape(
        &self,
        document_id: Uuid,
        shape_id: Uuid,
        updates: &Data,
        now: i64,
    ) -> Result<Shape, CanvasError>;

    /// Deleting a nonexistent shape is a no-op, not an error.
    async fn delete_shape(&self, document_id: Uuid, shape_id: Uuid) -> Result<(), CanvasError>;

    async fn delete_all_shapes(&self, document_id: Uuid) -> Result<(), CanvasError>;

    async fn insert_draw_events_bulk(&self, document_id: Uuid, events: &[DrawEvent]) -> Result<(), CanvasError>;

    /// Trim the durable tail down to the most recent `keep` events.
    async fn trim_draw_events(&self, document_id: Uuid, keep: i64) -> Result<(), CanvasError>;

    async fn delete_all_draw_events(&self, document_id: Uuid) -> Result<(), CanvasError>;

    async fn touch_last_modified(&self, document_id: Uuid, ts: i64) -> Result<(), CanvasError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

pub struct PgCanvasStore {
    pool: PgPool,
}

impl PgCanvasStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type ShapeRow = (
    Uuid,
    Uuid,
    Uuid,
    serde_json::Value,
    String,
    f64,
    String,
    f64,
    f64,
    Option<String>,
    i32,
    i64,
    i64,
);

fn shape_from_row(row: ShapeRow) -> Result<Shape, CanvasError> {
    let (
        id,
        document_id,
        created_by,
        geometry,
        stroke_color,
        stroke_opacity,
        fill_color,
        fill_opacity,
        stroke_width,
        label,
        z_index,
        created_at,
        updated_at,
    ) = row;
    let geometry: Geometry = serde_json::from_value(geometry).map_err(|e| {
        CanvasError::Database(sqlx::Error::Decode(Box::new(e)))
    })?;
    Ok(Shape {
        id,
        document_id,
        created_by,
        geometry,
        stroke_color,
        stroke_opacity,
        fill_color,
        fill_opacity,
        stroke_width,
        label,
        z_index,
        created_at,
        updated_at,
    })
}

const SHAPE_COLUMNS: &str = "id, document_id, created_by, geometry, stroke_color, stroke_opacity, \
                             fill_color, fill_opacity, stroke_width, label, z_index, created_at, updated_at";

async fn upsert_shape(pool: &PgPool, shape: &Shape) -> Result<(), CanvasError> {
    let geometry = serde_json::to_value(&shape.geometry).unwrap_or_default();
    sqlx::query(
        "INSERT INTO shapes (id, document_id, created_by, kind, geometry, stroke_color, stroke_opacity, \
                             fill_color, fill_opacity, stroke_width, label, z_index, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         ON CONFLICT (id) DO UPDATE SET \
             geometry = EXCLUDED.geometry, stroke_color = EXCLUDED.stroke_color, \
             stroke_opacity = EXCLUDED.stroke_opacity, fill_color = EXCLUDED.fill_color, \
             fill_opacity = EXCLUDED.fill_opacity, stroke_width = EXCLUDED.stroke_width, \
             label = EXCLUDED.label, z_index = EXCLUDED.z_index, updated_at = EXCLUDED.updated_at",
    )
    .bind(shape.id)
    .bind(shape.document_id)
    .bind(shape.created_by)
    .bind(shape.geometry.kind().as_str())
    .bind(&geometry)
    .bind(&shape.stroke_color)
    .bind(shape.stroke_opacity)
    .bind(&shape.fill_color)
    .bind(shape.fill_opacity)
    .bind(shape.stroke_width)
    .bind(&shape.label)
    .bind(shape.z_index)
    .bind(shape.created_at)
    .bind(shape.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl CanvasStore for PgCanvasStore {
    async fn document_snapshot(&self, document_id: Uuid) -> Result<DocumentSnapshot, CanvasError> {
        let shape_rows = sqlx::query_as::<_, ShapeRow>(&format!(
            "SELECT {SHAPE_COLUMNS} FROM shapes WHERE document_id = $1 ORDER BY z_index ASC, created_at ASC",
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut shapes = Vec::with_capacity(shape_rows.len());
        for row in shape_rows {
            shapes.push(shape_from_row(row)?);
        }

        // Newest first to apply the limit, reversed for replay order.
        let mut draw_events = sqlx::query_as::<_, (Uuid, Uuid, Uuid, serde_json::Value, i64)>(
            "SELECT id, document_id, created_by, payload, ts FROM draw_events \
             WHERE document_id = $1 ORDER BY ts DESC, id DESC LIMIT $2",
        )
        .bind(document_id)
        .bind(SNAPSHOT_EVENT_LIMIT)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(id, document_id, created_by, payload, ts)| DrawEvent { id, document_id, created_by, payload, ts })
        .collect::<Vec<_>>();
        draw_events.reverse();

        let last_modified: Option<i64> =
            sqlx::query_scalar("SELECT last_modified FROM documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(DocumentSnapshot { shapes, draw_events, last_modified })
    }

    async fn shape_count(&self, document_id: Uuid) -> Result<i64, CanvasError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM shapes WHERE document_id = $1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_shape(&self, shape: &Shape) -> Result<(), CanvasError> {
        upsert_shape(&self.pool, shape).await
    }

    async fn update_shape(
        &self,
        document_id: Uuid,
        shape_id: Uuid,
        updates: &Data,
        now: i64,
    ) -> Result<Shape, CanvasError> {
        let row = sqlx::query_as::<_, ShapeRow>(&format!(
            "SELECT {SHAPE_COLUMNS} FROM shapes WHERE id = $1 AND document_id = $2",
        ))
        .bind(shape_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CanvasError::ShapeNotFound(shape_id))?;

        let mut shape = shape_from_row(row)?;
        shape::apply_partial(&mut shape, updates, now);
        upsert_shape(&self.pool, &shape).await?;
        Ok(shape)
    }

    async fn delete_shape(&self, document_id: Uuid, shape_id: Uuid) -> Result<(), CanvasError> {
        sqlx::query("DELETE FROM shapes WHERE id = $1 AND document_id = $2")
            .bind(shape_id)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_all_shapes(&self, document_id: Uuid) -> Result<(), CanvasError> {
        sqlx::query("DELETE FROM shapes WHERE document_id = $1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_draw_events_bulk(&self, document_id: Uuid, events: &[DrawEvent]) -> Result<(), CanvasError> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO draw_events (id, document_id, created_by, payload, ts) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.id)
            .bind(document_id)
            .bind(event.created_by)
            .bind(&event.payload)
            .bind(event.ts)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn trim_draw_events(&self, document_id: Uuid, keep: i64) -> Result<(), CanvasError> {
        sqlx::query(
            "DELETE FROM draw_events WHERE document_id = $1 AND id NOT IN ( \
                 SELECT id FROM draw_events WHERE document_id = $1 \
                 ORDER BY ts DESC, id DESC LIMIT $2)",
        )
        .bind(document_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_all_draw_events(&self, document_id: Uuid) -> Result<(), CanvasError> {
        sqlx::query("DELETE FROM draw_events WHERE document_id = $1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_modified(&self, document_id: Uuid, ts: i64) -> Result<(), CanvasError> {
        sqlx::query("UPDATE documents SET last_modified = $2 WHERE id = $1")
            .bind(document_id)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY TEST DOUBLE
// =============================================================================


#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
