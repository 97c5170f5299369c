use super::*;
use serde_json::json;

fn data(pairs: &[(&str, serde_json::Value)]) -> Data {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
}

fn rectangle(document_id: Uuid, created_by: Uuid) -> Shape {
    Shape {
        id: Uuid::new_v4(),
        document_id,
        created_by,
        geometry: Geometry::Rectangle { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 },
        stroke_color: "#ff0000".into(),
        stroke_opacity: 1.0,
        fill_color: "none".into(),
        fill_opacity: 1.0,
        stroke_width: 2.0,
        label: None,
        z_index: 0,
        created_at: 1_000,
        updated_at: 1_000,
    }
}

// =============================================================================
// GEOMETRY PARSING
// =============================================================================

#[test]
fn parse_geometry_requires_kind() {
    let err = parse_geometry(&Data::new()).expect_err("missing kind should fail");
    assert!(matches!(err, ValidationError::KindMissing));
}

#[test]
fn parse_geometry_rejects_unknown_kind() {
    let err = parse_geometry(&data(&[("kind", json!("hexagon"))])).expect_err("unknown kind should fail");
    assert!(matches!(err, ValidationError::UnknownKind(k) if k == "hexagon"));
}

#[test]
fn parse_geometry_requires_kind_specific_fields() {
    // A rectangle payload without its corners is invalid even though a
    // freehand payload with points would be fine.
    let err = parse_geometry(&data(&[("kind", json!("rectangle")), ("x1", json!(1.0)), ("y1", json!(2.0))]))
        .expect_err("incomplete rectangle should fail");
    assert!(matches!(err, ValidationError::FieldMissing { kind: "rectangle", field: "x2" }));

    let err = parse_geometry(&data(&[("kind", json!("ellipse"))])).expect_err("bare ellipse should fail");
    assert!(matches!(err, ValidationError::FieldMissing { kind: "ellipse", field: "x1" }));
}

#[test]
fn parse_geometry_accepts_bounding_box_kinds() {
    for kind in ["rectangle", "triangle", "ellipse"] {
        let geometry = parse_geometry(&data(&[
            ("kind", json!(kind)),
            ("x1", json!(1.0)),
            ("y1", json!(2.0)),
            ("x2", json!(3.0)),
            ("y2", json!(4.0)),
        ]))
        .expect("complete bounding box should parse");
        assert_eq!(geometry.kind().as_str(), kind);
    }
}

#[test]
fn parse_geometry_freehand_needs_two_points() {
    let err = parse_geometry(&data(&[("kind", json!("freehand")), ("points", json!([[1.0, 2.0]]))]))
        .expect_err("single point should fail");
    assert!(matches!(err, ValidationError::TooFewPoints));

    let geometry = parse_geometry(&data(&[
        ("kind", json!("freehand")),
        ("points", json!([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]])),
    ]))
    .expect("point list should parse");
    assert!(matches!(geometry, Geometry::Freehand { points } if points.len() == 3));
}

#[test]
fn parse_geometry_rejects_malformed_points() {
    let err = parse_geometry(&data(&[("kind", json!("freehand")), ("points", json!([[1.0], [2.0, 3.0]]))]))
        .expect_err("ragged point pairs should fail");
    assert!(matches!(err, ValidationError::FieldMissing { kind: "freehand", field: "points" }));
}

#[test]
fn geometry_serializes_flat_with_kind_tag() {
    let value = serde_json::to_value(Geometry::Rectangle { x1: 1.0, y1: 2.0, x2: 3.0, y2: 4.0 })
        .expect("geometry should serialize");
    assert_eq!(value.get("kind").and_then(|v| v.as_str()), Some("rectangle"));
    assert_eq!(value.get("x1").and_then(serde_json::Value::as_f64), Some(1.0));
}

// =============================================================================
// NEW SHAPE
// =============================================================================

#[test]
fn parse_new_shape_applies_style_defaults() {
    let new_shape = parse_new_shape(&data(&[
        ("kind", json!("rectangle")),
        ("x1", json!(0.0)),
        ("y1", json!(0.0)),
        ("x2", json!(5.0)),
        ("y2", json!(5.0)),
    ]))
    .expect("shape should parse");

    assert_eq!(new_shape.stroke_color, "#000000");
    assert_eq!(new_shape.fill_color, "none");
    assert_eq!(new_shape.stroke_width, 2.0);
    assert_eq!(new_shape.stroke_opacity, 1.0);
    assert_eq!(new_shape.fill_opacity, 1.0);
    assert!(new_shape.label.is_none());
}

#[test]
fn parse_new_shape_keeps_explicit_style() {
    let new_shape = parse_new_shape(&data(&[
        ("kind", json!("ellipse")),
        ("x1", json!(0.0)),
        ("y1", json!(0.0)),
        ("x2", json!(5.0)),
        ("y2", json!(5.0)),
        ("stroke_color", json!("#22c55e")),
        ("fill_color", json!("#0000ff")),
        ("fill_opacity", json!(0.4)),
        ("label", json!("pond")),
    ]))
    .expect("shape should parse");

    assert_eq!(new_shape.stroke_color, "#22c55e");
    assert_eq!(new_shape.fill_color, "#0000ff");
    assert_eq!(new_shape.fill_opacity, 0.4);
    assert_eq!(new_shape.label.as_deref(), Some("pond"));
}

// =============================================================================
// PARTIAL MERGE
// =============================================================================

#[test]
fn apply_partial_updates_only_named_fields() {
    let mut shape = rectangle(Uuid::new_v4(), Uuid::new_v4());

    apply_partial(&mut shape, &data(&[("x2", json!(50.0))]), 2_000);

    assert_eq!(shape.geometry, Geometry::Rectangle { x1: 0.0, y1: 0.0, x2: 50.0, y2: 10.0 });
    assert_eq!(shape.stroke_color, "#ff0000");
    assert_eq!(shape.created_at, 1_000);
    assert_eq!(shape.updated_at, 2_000);
}

#[test]
fn apply_partial_sets_and_clears_label() {
    let mut shape = rectangle(Uuid::new_v4(), Uuid::new_v4());

    apply_partial(&mut shape, &data(&[("label", json!("box"))]), 2_000);
    assert_eq!(shape.label.as_deref(), Some("box"));

    apply_partial(&mut shape, &data(&[("label", serde_json::Value::Null)]), 3_000);
    assert!(shape.label.is_none());
}

#[test]
fn apply_partial_replaces_freehand_points() {
    let mut shape = rectangle(Uuid::new_v4(), Uuid::new_v4());
    shape.geometry = Geometry::Freehand { points: vec![[0.0, 0.0], [1.0, 1.0]] };

    apply_partial(&mut shape, &data(&[("points", json!([[5.0, 5.0], [6.0, 6.0], [7.0, 7.0]]))]), 2_000);
    assert!(matches!(&shape.geometry, Geometry::Freehand { points } if points.len() == 3));

    // A malformed points list leaves the stroke untouched.
    apply_partial(&mut shape, &data(&[("points", json!("bogus"))]), 3_000);
    assert!(matches!(&shape.geometry, Geometry::Freehand { points } if points.len() == 3));
}

#[test]
fn apply_partial_updates_style_and_z_order() {
    let mut shape = rectangle(Uuid::new_v4(), Uuid::new_v4());

    apply_partial(
        &mut shape,
        &data(&[("stroke_width", json!(8.0)), ("z_index", json!(7)), ("fill_color", json!("#123456"))]),
        2_000,
    );

    assert_eq!(shape.stroke_width, 8.0);
    assert_eq!(shape.z_index, 7);
    assert_eq!(shape.fill_color, "#123456");
}

#[test]
fn shape_to_data_flattens_geometry() {
    let shape = rectangle(Uuid::new_v4(), Uuid::new_v4());
    let payload = shape.to_data();
    assert_eq!(payload.get("kind").and_then(|v| v.as_str()), Some("rectangle"));
    assert_eq!(payload.get("x2").and_then(serde_json::Value::as_f64), Some(10.0));
    assert_eq!(payload.get("id").and_then(|v| v.as_str()), Some(shape.id.to_string().as_str()));
}
