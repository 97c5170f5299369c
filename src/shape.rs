//! Shape model — tagged geometry, validation boundary, partial merge.
//!
//! DESIGN
//! ======
//! Geometry is a tagged union keyed by shape kind: bounding-box shapes
//! carry two corner points, freehand strokes carry a sampled point list.
//! Kind-specific required fields are enforced here, at the validation
//! boundary, so nothing downstream parses ad hoc payloads.
//!
//! The partial merge for `shape:update` lives here in one place
//! (`apply_partial`) and every store implementation routes through it, so
//! the broadcast result and the durable result cannot diverge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Data;

// =============================================================================
// TYPES
// =============================================================================

/// Shape-kind discriminant, matching the wire `kind` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Freehand,
    Rectangle,
    Triangle,
    Ellipse,
}

impl ShapeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Freehand => "freehand",
            Self::Rectangle => "rectangle",
            Self::Triangle => "triangle",
            Self::Ellipse => "ellipse",
        }
    }
}

/// Kind-specific geometry. Serializes flat with a `kind` tag, so a
/// rectangle appears on the wire as `{"kind":"rectangle","x1":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geometry {
    Freehand { points: Vec<[f64; 2]> },
    Rectangle { x1: f64, y1: f64, x2: f64, y2: f64 },
    Triangle { x1: f64, y1: f64, x2: f64, y2: f64 },
    Ellipse { x1: f64, y1: f64, x2: f64, y2: f64 },
}

impl Geometry {
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        match self {
            Self::Freehand { .. } => ShapeKind::Freehand,
            Self::Rectangle { .. } => ShapeKind::Rectangle,
            Self::Triangle { .. } => ShapeKind::Triangle,
            Self::Ellipse { .. } => ShapeKind::Ellipse,
        }
    }
}

/// A durable canvas shape. Mirrors the `shapes` table; geometry is stored
/// as JSONB and flattened onto the wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    pub id: Uuid,
    pub document_id: Uuid,
    pub created_by: Uuid,
    #[serde(flatten)]
    pub geometry: Geometry,
    pub stroke_color: String,
    pub stroke_opacity: f64,
    pub fill_color: String,
    pub fill_opacity: f64,
    pub stroke_width: f64,
    pub label: Option<String>,
    pub z_index: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Shape {
    /// Flatten into an envelope payload.
    #[must_use]
    pub fn to_data(&self) -> Data {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Data::new(),
        }
    }
}

/// Validated input for `shape:add`, before the server stamps identity,
/// timestamps, and z-order.
#[derive(Debug, Clone)]
pub struct NewShape {
    pub geometry: Geometry,
    pub stroke_color: String,
    pub stroke_opacity: f64,
    pub fill_color: String,
    pub fill_opacity: f64,
    pub stroke_width: f64,
    pub label: Option<String>,
}

// =============================================================================
// VALIDATION
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("shape kind required")]
    KindMissing,
    #[error("unknown shape kind: {0}")]
    UnknownKind(String),
    #[error("{field} required for {kind}")]
    FieldMissing { kind: &'static str, field: &'static str },
    #[error("points must contain at least two [x, y] pairs")]
    TooFewPoints,
    #[error("{0} required")]
    Required(&'static str),
}

impl crate::message::ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        "E_VALIDATION"
    }
}

const DEFAULT_STROKE_COLOR: &str = "#000000";
const DEFAULT_FILL_COLOR: &str = "none";
const DEFAULT_STROKE_WIDTH: f64 = 2.0;

fn get_f64(data: &Data, key: &str) -> Option<f64> {
    data.get(key).and_then(serde_json::Value::as_f64)
}

fn get_str(data: &Data, key: &str) -> Option<String> {
    data.get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

fn require_f64(data: &Data, kind: &'static str, field: &'static str) -> Result<f64, ValidationError> {
    get_f64(data, field).ok_or(ValidationError::FieldMissing { kind, field })
}

fn parse_points(value: &serde_json::Value) -> Option<Vec<[f64; 2]>> {
    let arr = value.as_array()?;
    let mut points = Vec::with_capacity(arr.len());
    for p in arr {
        let pair = p.as_array()?;
        if pair.len() != 2 {
            return None;
        }
        points.push([pair[0].as_f64()?, pair[1].as_f64()?]);
    }
    Some(points)
}

/// Parse geometry from a flat payload, enforcing the fields the declared
/// kind requires.
pub fn parse_geometry(data: &Data) -> Result<Geometry, ValidationError> {
    let kind = data
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .ok_or(ValidationError::KindMissing)?;

    match kind {
        "freehand" => {
            let raw = data
                .get("points")
                .ok_or(ValidationError::FieldMissing { kind: "freehand", field: "points" })?;
            let points = parse_points(raw)
                .ok_or(ValidationError::FieldMissing { kind: "freehand", field: "points" })?;
            if points.len() < 2 {
                return Err(ValidationError::TooFewPoints);
            }
            Ok(Geometry::Freehand { points })
        }
        "rectangle" => Ok(Geometry::Rectangle {
            x1: require_f64(data, "rectangle", "x1")?,
            y1: require_f64(data, "rectangle", "y1")?,
            x2: require_f64(data, "rectangle", "x2")?,
            y2: require_f64(data, "rectangle", "y2")?,
        }),
        "triangle" => Ok(Geometry::Triangle {
            x1: require_f64(data, "triangle", "x1")?,
            y1: require_f64(data, "triangle", "y1")?,
            x2: require_f64(data, "triangle", "x2")?,
            y2: require_f64(data, "triangle", "y2")?,
        }),
        "ellipse" => Ok(Geometry::Ellipse {
            x1: require_f64(data, "ellipse", "x1")?,
            y1: require_f64(data, "ellipse", "y1")?,
            x2: require_f64(data, "ellipse", "x2")?,
            y2: require_f64(data, "ellipse", "y2")?,
        }),
        other => Err(ValidationError::UnknownKind(other.to_string())),
    }
}

/// Validate a `shape:add` payload into a `NewShape`. Client-supplied ids,
/// authors, timestamps, and z-order fields are ignored here; the router
/// stamps them from the verified connection identity.
pub fn parse_new_shape(data: &Data) -> Result<NewShape, ValidationError> {
    let geometry = parse_geometry(data)?;

    Ok(NewShape {
        geometry,
        stroke_color: get_str(data, "stroke_color").unwrap_or_else(|| DEFAULT_STROKE_COLOR.into()),
        stroke_opacity: get_f64(data, "stroke_opacity").unwrap_or(1.0),
        fill_color: get_str(data, "fill_color").unwrap_or_else(|| DEFAULT_FILL_COLOR.into()),
        fill_opacity: get_f64(data, "fill_opacity").unwrap_or(1.0),
        stroke_width: get_f64(data, "stroke_width").unwrap_or(DEFAULT_STROKE_WIDTH),
        label: get_str(data, "label"),
    })
}

// =============================================================================
// PARTIAL MERGE
// =============================================================================

/// Apply a partial update to a shape: fields absent from `updates` are
/// left unchanged. Kind, id, author, and creation time never change.
pub fn apply_partial(shape: &mut Shape, updates: &Data, now: i64) {
    match &mut shape.geometry {
        Geometry::Freehand { points } => {
            if let Some(raw) = updates.get("points") {
                if let Some(parsed) = parse_points(raw) {
                    *points = parsed;
                }
            }
        }
        Geometry::Rectangle { x1, y1, x2, y2 }
        | Geometry::Triangle { x1, y1, x2, y2 }
        | Geometry::Ellipse { x1, y1, x2, y2 } => {
            if let Some(v) = get_f64(updates, "x1") {
                *x1 = v;
            }
            if let Some(v) = get_f64(updates, "y1") {
                *y1 = v;
            }
            if let Some(v) = get_f64(updates, "x2") {
                *x2 = v;
            }
            if let Some(v) = get_f64(updates, "y2") {
                *y2 = v;
            }
        }
    }

    if let Some(v) = get_str(updates, "stroke_color") {
        shape.stroke_color = v;
    }
    if let Some(v) = get_f64(updates, "stroke_opacity") {
        shape.stroke_opacity = v;
    }
    if let Some(v) = get_str(updates, "fill_color") {
        shape.fill_color = v;
    }
    if let Some(v) = get_f64(updates, "fill_opacity") {
        shape.fill_opacity = v;
    }
    if let Some(v) = get_f64(updates, "stroke_width") {
        shape.stroke_width = v;
    }
    match updates.get("label") {
        Some(serde_json::Value::String(s)) => shape.label = Some(s.clone()),
        Some(serde_json::Value::Null) => shape.label = None,
        _ => {}
    }
    if let Some(z) = updates.get("z_index").and_then(serde_json::Value::as_i64) {
        #[allow(clippy::cast_possible_truncation)]
        {
            shape.z_index = z as i32;
        }
    }

    shape.updated_at = now;
}

#[cfg(test)]
#[path = "shape_test.rs"]
mod tests;
