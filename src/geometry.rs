use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, PolygonType, Position};
use serde_json::{Value, json};

use crate::domain::Record;
use crate::error::EodmsError;

pub use geojson::{Geometry, Value as GeometryValue};

/// The service refuses search geometries above this many vertices.
pub const MAX_SEARCH_VERTICES: usize = 1000;

pub fn vertex_count(shape: &GeometryValue) -> usize {
    match shape {
        GeometryValue::Point(_) => 1,
        GeometryValue::LineString(line) | GeometryValue::MultiPoint(line) => line.len(),
        GeometryValue::Polygon(rings) | GeometryValue::MultiLineString(rings) => {
            rings.iter().map(Vec::len).sum()
        }
        GeometryValue::MultiPolygon(polygons) => polygons
            .iter()
            .flat_map(|rings| rings.iter())
            .map(Vec::len)
            .sum(),
        GeometryValue::GeometryCollection(members) => {
            members.iter().map(|member| vertex_count(&member.value)).sum()
        }
    }
}

/// Well-known text, two dimensional. Any Z/M ordinates are dropped.
pub fn to_wkt(shape: &GeometryValue) -> Result<String, EodmsError> {
    let mut out = String::new();
    match shape {
        GeometryValue::Point(p) => {
            out.push_str("POINT (");
            push_position(&mut out, p)?;
            out.push(')');
        }
        GeometryValue::LineString(line) => {
            out.push_str("LINESTRING ");
            push_sequence(&mut out, line)?;
        }
        GeometryValue::Polygon(rings) => {
            out.push_str("POLYGON ");
            push_rings(&mut out, rings)?;
        }
        GeometryValue::MultiPoint(points) => {
            out.push_str("MULTIPOINT (");
            for (idx, point) in points.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                push_position(&mut out, point)?;
                out.push(')');
            }
            out.push(')');
        }
        GeometryValue::MultiLineString(lines) => {
            out.push_str("MULTILINESTRING ");
            push_rings(&mut out, lines)?;
        }
        GeometryValue::MultiPolygon(polygons) => {
            out.push_str("MULTIPOLYGON (");
            for (idx, rings) in polygons.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                push_rings(&mut out, rings)?;
            }
            out.push(')');
        }
        GeometryValue::GeometryCollection(members) => {
            let parts = members
                .iter()
                .map(|member| to_wkt(&member.value))
                .collect::<Result<Vec<_>, _>>()?;
            let _ = write!(out, "GEOMETRYCOLLECTION ({})", parts.join(", "));
        }
    }
    Ok(out)
}

fn push_position(out: &mut String, position: &[f64]) -> Result<(), EodmsError> {
    match position {
        [x, y, ..] if x.is_finite() && y.is_finite() => {
            let _ = write!(out, "{x} {y}");
            Ok(())
        }
        _ => Err(EodmsError::Geometry(format!(
            "position {position:?} needs finite longitude and latitude"
        ))),
    }
}

fn push_sequence(out: &mut String, positions: &[Position]) -> Result<(), EodmsError> {
    out.push('(');
    for (idx, position) in positions.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        push_position(out, position)?;
    }
    out.push(')');
    Ok(())
}

fn push_rings(out: &mut String, rings: &[Vec<Position>]) -> Result<(), EodmsError> {
    out.push('(');
    for (idx, ring) in rings.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        push_sequence(out, ring)?;
    }
    out.push(')');
    Ok(())
}

fn polygons(shape: &GeometryValue) -> Option<Vec<PolygonType>> {
    match shape {
        GeometryValue::Polygon(rings) => Some(vec![rings.clone()]),
        GeometryValue::MultiPolygon(polygons) => Some(polygons.clone()),
        _ => None,
    }
}

/// Spatial filter for a search: one or more simple features.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchGeometry {
    shapes: Vec<GeometryValue>,
}

impl SearchGeometry {
    pub fn new(shapes: Vec<GeometryValue>) -> Result<Self, EodmsError> {
        if shapes.is_empty() {
            return Err(EodmsError::Geometry(
                "search geometry has no features".to_string(),
            ));
        }
        Ok(Self { shapes })
    }

    pub fn single(shape: GeometryValue) -> Self {
        Self {
            shapes: vec![shape],
        }
    }

    /// Accepts a FeatureCollection, a Feature, a GeometryCollection or a bare geometry.
    pub fn from_geojson_str(text: &str) -> Result<Self, EodmsError> {
        let document: GeoJson = text
            .parse()
            .map_err(|err: geojson::Error| EodmsError::Geometry(err.to_string()))?;
        let mut shapes = Vec::new();
        match document {
            GeoJson::FeatureCollection(collection) => {
                for feature in collection.features {
                    collect_feature(feature, &mut shapes)?;
                }
            }
            GeoJson::Feature(feature) => collect_feature(feature, &mut shapes)?,
            GeoJson::Geometry(geometry) => collect_shapes(geometry.value, &mut shapes),
        }
        Self::new(shapes)
    }

    pub fn from_file(path: &Path) -> Result<Self, EodmsError> {
        let text = fs::read_to_string(path).map_err(|err| {
            EodmsError::Geometry(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_geojson_str(&text)
    }

    pub fn shapes(&self) -> &[GeometryValue] {
        &self.shapes
    }

    pub fn vertex_count(&self) -> usize {
        self.shapes.iter().map(vertex_count).sum()
    }

    /// Single WKT value for the search filter. Several polygons merge into a
    /// MULTIPOLYGON; any other mix becomes a GEOMETRYCOLLECTION.
    pub fn to_wkt(&self) -> Result<String, EodmsError> {
        let vertices = self.vertex_count();
        if vertices > MAX_SEARCH_VERTICES {
            return Err(EodmsError::Geometry(format!(
                "search geometry has {vertices} vertices, the service accepts at most {MAX_SEARCH_VERTICES}"
            )));
        }
        if let [only] = self.shapes.as_slice() {
            return to_wkt(only);
        }
        let merged: Option<Vec<Vec<PolygonType>>> = self.shapes.iter().map(polygons).collect();
        if let Some(merged) = merged {
            return to_wkt(&GeometryValue::MultiPolygon(
                merged.into_iter().flatten().collect(),
            ));
        }
        let members = self.shapes.iter().cloned().map(Geometry::new).collect();
        to_wkt(&GeometryValue::GeometryCollection(members))
    }
}

fn collect_feature(feature: Feature, out: &mut Vec<GeometryValue>) -> Result<(), EodmsError> {
    let geometry = feature
        .geometry
        .ok_or_else(|| EodmsError::Geometry("feature has no geometry".to_string()))?;
    collect_shapes(geometry.value, out);
    Ok(())
}

/// GeometryCollections are flattened so their members merge like features do.
fn collect_shapes(shape: GeometryValue, out: &mut Vec<GeometryValue>) {
    match shape {
        GeometryValue::GeometryCollection(members) => {
            for member in members {
                collect_shapes(member.value, out);
            }
        }
        shape => out.push(shape),
    }
}

/// One GeoJSON feature per record: footprint plus identifying and metadata fields.
pub fn records_to_feature_collection(records: &[Record]) -> FeatureCollection {
    let features = records
        .iter()
        .map(|record| {
            let mut properties = JsonObject::new();
            for (name, value) in &record.metadata {
                properties.insert(name.clone(), Value::String(value.clone()));
            }
            properties.insert(
                "EODMS RecordId".to_string(),
                Value::String(record.record_id.to_string()),
            );
            properties.insert(
                "Granule".to_string(),
                record
                    .granule()
                    .map(|g| Value::String(g.to_string()))
                    .unwrap_or(Value::Null),
            );
            properties.insert(
                "collection".to_string(),
                Value::String(record.collection.id().to_string()),
            );
            properties.insert("uuid".to_string(), json!(record.uuid));
            properties.insert("thumbnailUrl".to_string(), json!(record.thumbnail_url));
            Feature {
                bbox: None,
                geometry: Some(record.footprint.clone()),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}
