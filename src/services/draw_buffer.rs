//! Draw-event buffer — batched persistence for freehand preview events.
//!
//! DESIGN
//! ======
//! Freehand drawing emits many small events per second; per-event writes
//! would dominate latency and store load. Events stage in a per-document
//! in-memory queue, flush in bulk when the queue reaches a threshold, and
//! a background task flushes every non-empty queue on an interval so
//! durable history is at most one interval stale. After each flush the
//! durable tail is trimmed to the retention bound — draw events are recent
//! scrollback, not an authoritative log.
//!
//! ERROR HANDLING
//! ==============
//! Queued events are re-staged when a flush fails, so the next cycle
//! retries instead of losing them. Repeated flush attempts are acceptable,
//! silent data loss is not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::canvas::{CanvasError, DrawEvent};
use crate::state::AppState;

const DEFAULT_FLUSH_THRESHOLD: usize = 50;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;
const DEFAULT_RETAIN: i64 = 1000;

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// BUFFER
// =============================================================================

/// Tuning knobs, loaded from environment variables.
#[derive(Clone, Copy)]
pub struct DrawBufferConfig {
    /// Queue length that triggers a synchronous flush.
    pub flush_threshold: usize,
    /// Background flush interval in seconds.
    pub flush_interval_secs: u64,
    /// Durable events retained per document after trimming.
    pub retain: i64,
}

impl DrawBufferConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            flush_threshold: env_parse("DRAW_FLUSH_THRESHOLD", DEFAULT_FLUSH_THRESHOLD),
            flush_interval_secs: env_parse("DRAW_FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS),
            retain: env_parse("DRAW_RETAIN", DEFAULT_RETAIN),
        }
    }
}

/// Per-document staging queues for not-yet-persisted draw events.
/// Process-wide, mutated only by the event router and the flush task.
#[derive(Clone)]
pub struct DrawBuffer {
    queues: Arc<Mutex<HashMap<Uuid, Vec<DrawEvent>>>>,
    pub config: DrawBufferConfig,
}

impl DrawBuffer {
    #[must_use]
    pub fn from_env() -> Self {
        Self { queues: Arc::new(Mutex::new(HashMap::new())), config: DrawBufferConfig::from_env() }
    }

    #[cfg(test)]
    pub(crate) fn with_config(config: DrawBufferConfig) -> Self {
        Self { queues: Arc::new(Mutex::new(HashMap::new())), config }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<DrawEvent>>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn queued(&self, document_id: Uuid) -> usize {
        self.lock().get(&document_id).map_or(0, Vec::len)
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Stage one event; flushes synchronously once the queue hits the
/// threshold. A flush failure re-stages the batch and is returned so the
/// caller can log or surface it as non-fatal.
pub async fn append(state: &AppState, event: DrawEvent) -> Result<(), CanvasError> {
    let document_id = event.document_id;
    let batch = {
        let mut queues = state.draw_buffer.lock();
        let queue = queues.entry(document_id).or_default();
        queue.push(event);
        if queue.len() >= state.draw_buffer.config.flush_threshold {
            std::mem::take(queue)
        } else {
            Vec::new()
        }
    };

    if batch.is_empty() {
        return Ok(());
    }
    flush_batch(state, document_id, batch).await
}

/// Flush one document's queue immediately, regardless of size.
pub async fn flush(state: &AppState, document_id: Uuid) -> Result<(), CanvasError> {
    let batch = {
        let mut queues = state.draw_buffer.lock();
        queues.remove(&document_id).unwrap_or_default()
    };
    if batch.is_empty() {
        return Ok(());
    }
    flush_batch(state, document_id, batch).await
}

/// Drop all staged events for a document (canvas clear).
pub fn reset(state: &AppState, document_id: Uuid) {
    state.draw_buffer.lock().remove(&document_id);
}

/// Flush every non-empty queue. Failures are logged per document; the
/// failed batches are re-staged for the next cycle.
pub async fn flush_all(state: &AppState) {
    // Snapshot under lock, then perform store I/O lock-free.
    let batches: Vec<(Uuid, Vec<DrawEvent>)> = {
        let mut queues = state.draw_buffer.lock();
        queues.drain().filter(|(_, q)| !q.is_empty()).collect()
    };

    for (document_id, batch) in batches {
        if let Err(e) = flush_batch(state, document_id, batch).await {
            error!(error = %e, %document_id, "draw-event flush failed");
        }
    }
}

async fn flush_batch(state: &AppState, document_id: Uuid, batch: Vec<DrawEvent>) -> Result<(), CanvasError> {
    let count = batch.len();
    let result = state
        .store
        .insert_draw_events_bulk(document_id, &batch)
        .await;

    if let Err(e) = result {
        // Re-stage ahead of anything queued while the write was in flight.
        let mut queues = state.draw_buffer.lock();
        let queue = queues.entry(document_id).or_default();
        let newer = std::mem::replace(queue, batch);
        queue.extend(newer);
        return Err(e);
    }

    state
        .store
        .trim_draw_events(document_id, state.draw_buffer.config.retain)
        .await?;
    tracing::debug!(%document_id, count, "flushed draw events");
    Ok(())
}

// =============================================================================
// BACKGROUND TASK
// =============================================================================

/// Spawn the periodic flush task. Returns a handle for shutdown.
pub fn spawn_flush_task(state: AppState) -> JoinHandle<()> {
    let interval_secs = state.draw_buffer.config.flush_interval_secs;
    info!(interval_secs, "draw-event flush configured");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            flush_all(&state).await;
        }
    })
}

#[cfg(test)]
#[path = "draw_buffer_test.rs"]
mod tests;
