//! Core data model for alert synchronization: raw source features, sink geometry,
//! layer schemas and the typed attribute values written to the feature store.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "alertsync-core";

/// Spatial reference (EPSG code) every sink geometry is tagged with.
pub const SINK_WKID: u32 = 4326;

/// `[x, y]` coordinate pair (longitude, latitude for EPSG:4326).
pub type Position = [f64; 2];

/// Untyped cell value as read from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Wraps text, mapping blank strings to `Null`.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Null
        } else {
            Self::Text(value)
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Number(n) => n.is_nan(),
            Self::Text(t) => t.trim().is_empty(),
        }
    }

    /// Trimmed textual form, `None` for null or blank values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Number(n) if n.is_nan() => None,
            Self::Number(n) => Some(n.to_string()),
            Self::Text(t) => {
                let trimmed = t.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<Position>,
    #[serde(default)]
    pub interiors: Vec<Vec<Position>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Position>, interiors: Vec<Vec<Position>>) -> Self {
        Self {
            exterior,
            interiors,
        }
    }
}

/// Source-side geometry as produced by the document adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum RawGeometry {
    Point(Position),
    LineString(Vec<Position>),
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
    MultiLineString(Vec<Vec<Position>>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("geometry is empty or invalid: {0}")]
    EmptyOrInvalid(String),
}

fn invalid(message: impl Into<String>) -> GeometryError {
    GeometryError::EmptyOrInvalid(message.into())
}

fn check_finite(coords: &[Position], what: &str) -> Result<(), GeometryError> {
    if coords.iter().flatten().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(invalid(format!("{what} has a non-finite coordinate")))
    }
}

fn check_path(coords: &[Position]) -> Result<(), GeometryError> {
    if coords.len() < 2 {
        return Err(invalid(format!(
            "line needs at least 2 points, got {}",
            coords.len()
        )));
    }
    check_finite(coords, "line")
}

fn check_ring(ring: &[Position]) -> Result<(), GeometryError> {
    if ring.len() < 4 {
        return Err(invalid(format!(
            "ring needs at least 4 points, got {}",
            ring.len()
        )));
    }
    check_finite(ring, "ring")?;
    if ring.first() != ring.last() {
        return Err(invalid("ring is not closed"));
    }
    Ok(())
}

fn check_polygon(polygon: &Polygon) -> Result<(), GeometryError> {
    check_ring(&polygon.exterior)?;
    polygon.interiors.iter().try_for_each(|ring| check_ring(ring))
}

impl RawGeometry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
            Self::Polygon(_) => "Polygon",
            Self::MultiPolygon(_) => "MultiPolygon",
            Self::MultiLineString(_) => "MultiLineString",
        }
    }

    /// Structural validity: non-empty, enough points per part, finite coordinates, closed rings.
    pub fn validate(&self) -> Result<(), GeometryError> {
        match self {
            Self::Point(position) => check_finite(std::slice::from_ref(position), "point"),
            Self::LineString(coords) => check_path(coords),
            Self::Polygon(polygon) => check_polygon(polygon),
            Self::MultiPolygon(polygons) => {
                if polygons.is_empty() {
                    return Err(invalid("multipolygon has no members"));
                }
                polygons.iter().try_for_each(check_polygon)
            }
            Self::MultiLineString(lines) => {
                if lines.is_empty() {
                    return Err(invalid("multilinestring has no members"));
                }
                lines.iter().try_for_each(|line| check_path(line))
            }
        }
    }
}

/// One element of a parsed source document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceFeature {
    pub columns: BTreeMap<String, RawValue>,
    pub geometry: Option<RawGeometry>,
}

impl SourceFeature {
    pub fn new(geometry: Option<RawGeometry>) -> Self {
        Self {
            columns: BTreeMap::new(),
            geometry,
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: RawValue) -> Self {
        self.columns.insert(name.into(), value);
        self
    }

    pub fn column(&self, name: &str) -> Option<&RawValue> {
        self.columns.get(name)
    }

    pub fn column_text(&self, name: &str) -> Option<String> {
        self.column(name).and_then(RawValue::as_text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialReference {
    pub wkid: u32,
}

/// Normalized shape of a sink geometry. Every raw geometry maps onto one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkShape {
    Point { x: f64, y: f64 },
    Path(Vec<Position>),
    MultiPath(Vec<Vec<Position>>),
    /// First ring exterior, remaining rings holes. Multipolygons are flattened into one list.
    Rings(Vec<Vec<Position>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkGeometry {
    pub shape: SinkShape,
    pub spatial_reference: SpatialReference,
}

impl SinkGeometry {
    pub fn ring_count(&self) -> usize {
        match &self.shape {
            SinkShape::Rings(rings) => rings.len(),
            _ => 0,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireGeometry<'a> {
    Point {
        x: f64,
        y: f64,
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
    Paths {
        paths: Vec<&'a [Position]>,
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
    Rings {
        rings: &'a [Vec<Position>],
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
}

impl Serialize for SinkGeometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let spatial_reference = self.spatial_reference;
        let wire = match &self.shape {
            SinkShape::Point { x, y } => WireGeometry::Point {
                x: *x,
                y: *y,
                spatial_reference,
            },
            SinkShape::Path(path) => WireGeometry::Paths {
                paths: vec![path.as_slice()],
                spatial_reference,
            },
            SinkShape::MultiPath(paths) => WireGeometry::Paths {
                paths: paths.iter().map(Vec::as_slice).collect(),
                spatial_reference,
            },
            SinkShape::Rings(rings) => WireGeometry::Rings {
                rings,
                spatial_reference,
            },
        };
        wire.serialize(serializer)
    }
}

fn polygon_rings(polygon: &Polygon) -> impl Iterator<Item = Vec<Position>> + '_ {
    std::iter::once(polygon.exterior.clone()).chain(polygon.interiors.iter().cloned())
}

/// Converts a raw geometry into the sink's wire model, tagged with [`SINK_WKID`].
///
/// Rings keep their input orientation. A multipolygon becomes the concatenation of each
/// member's exterior followed by its holes, so per-polygon grouping is lost; the sink
/// format has no way to express it. Source coordinates must already be in EPSG:4326.
pub fn convert_geometry(raw: &RawGeometry) -> Result<SinkGeometry, GeometryError> {
    raw.validate()?;
    let shape = match raw {
        RawGeometry::Point([x, y]) => SinkShape::Point { x: *x, y: *y },
        RawGeometry::LineString(coords) => SinkShape::Path(coords.clone()),
        RawGeometry::Polygon(polygon) => SinkShape::Rings(polygon_rings(polygon).collect()),
        RawGeometry::MultiPolygon(polygons) => {
            SinkShape::Rings(polygons.iter().flat_map(|p| polygon_rings(p)).collect())
        }
        RawGeometry::MultiLineString(lines) => SinkShape::MultiPath(lines.clone()),
    };
    Ok(SinkGeometry {
        shape,
        spatial_reference: SpatialReference { wkid: SINK_WKID },
    })
}

/// Declared type of a sink field. Accepts the feature service's `esriFieldType*` names
/// and short lowercase aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    Integer,
    SmallInteger,
    Oid,
    Double,
    Single,
    String,
    Date,
    Other(String),
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "esriFieldTypeInteger" | "integer" => Self::Integer,
            "esriFieldTypeSmallInteger" | "small_integer" => Self::SmallInteger,
            "esriFieldTypeOID" | "oid" => Self::Oid,
            "esriFieldTypeDouble" | "double" => Self::Double,
            "esriFieldTypeSingle" | "single" => Self::Single,
            "esriFieldTypeString" | "string" => Self::String,
            "esriFieldTypeDate" | "date" => Self::Date,
            _ => Self::Other(value),
        }
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        match value {
            FieldType::Integer => "esriFieldTypeInteger".to_string(),
            FieldType::SmallInteger => "esriFieldTypeSmallInteger".to_string(),
            FieldType::Oid => "esriFieldTypeOID".to_string(),
            FieldType::Double => "esriFieldTypeDouble".to_string(),
            FieldType::Single => "esriFieldTypeSingle".to_string(),
            FieldType::String => "esriFieldTypeString".to_string(),
            FieldType::Date => "esriFieldTypeDate".to_string(),
            FieldType::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub length: Option<usize>,
}

/// Layer descriptor reported by the feature store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerSchema {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub capabilities: Option<String>,
}

impl LayerSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Layers that do not report capabilities are assumed to accept deletes.
    pub fn supports_delete(&self) -> bool {
        self.capabilities
            .as_deref()
            .map(|caps| caps.split(',').any(|c| c.trim() == "Delete"))
            .unwrap_or(true)
    }
}

/// Attribute value typed for the sink. Timestamps go on the wire as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    #[serde(serialize_with = "chrono::serde::ts_milliseconds::serialize")]
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("field {field}: cannot read {value:?} as {target}")]
    Unparseable {
        field: String,
        value: String,
        target: &'static str,
    },
}

fn read_number(raw: &RawValue, spec: &FieldSpec, target: &'static str) -> Result<f64, CoercionError> {
    let parsed = match raw {
        RawValue::Number(n) => Some(*n),
        RawValue::Text(t) => t.trim().replace(',', ".").parse::<f64>().ok(),
        RawValue::Null => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| CoercionError::Unparseable {
            field: spec.name.clone(),
            value: raw.as_text().unwrap_or_default(),
            target,
        })
}

/// Width assumed for string fields whose descriptor carries no `length`.
pub const DEFAULT_STRING_LENGTH: usize = 255;

fn truncate_chars(value: String, max: usize) -> String {
    if value.chars().count() > max {
        value.chars().take(max).collect()
    } else {
        value
    }
}

fn read_integer(
    raw: &RawValue,
    spec: &FieldSpec,
    min: i64,
    max: i64,
    target: &'static str,
) -> Result<i64, CoercionError> {
    let n = read_number(raw, spec, target)?.trunc();
    if n < min as f64 || n > max as f64 {
        return Err(CoercionError::Unparseable {
            field: spec.name.clone(),
            value: raw.as_text().unwrap_or_default(),
            target,
        });
    }
    Ok(n as i64)
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Coerces a raw value to the declared type of `spec`. Null and blank inputs give `Null`.
    pub fn coerce(raw: &RawValue, spec: &FieldSpec) -> Result<Self, CoercionError> {
        let Some(text) = raw.as_text() else {
            return Ok(Self::Null);
        };
        match &spec.field_type {
            FieldType::Integer | FieldType::Oid => {
                read_integer(raw, spec, i32::MIN.into(), i32::MAX.into(), "32-bit integer")
                    .map(Self::Integer)
            }
            FieldType::SmallInteger => {
                read_integer(raw, spec, i16::MIN.into(), i16::MAX.into(), "16-bit integer")
                    .map(Self::Integer)
            }
            FieldType::Double | FieldType::Single => read_number(raw, spec, "float").map(Self::Float),
            FieldType::String => Ok(Self::Text(truncate_chars(
                text,
                spec.length.unwrap_or(DEFAULT_STRING_LENGTH),
            ))),
            FieldType::Date => {
                let parsed = match raw {
                    RawValue::Number(n) => DateTime::from_timestamp_millis(*n as i64),
                    _ => parse_timestamp(&text),
                };
                parsed
                    .map(Self::Timestamp)
                    .ok_or_else(|| CoercionError::Unparseable {
                        field: spec.name.clone(),
                        value: text,
                        target: "timestamp",
                    })
            }
            FieldType::Other(_) => Ok(match raw {
                RawValue::Number(n) => Self::Float(*n),
                _ => Self::Text(text),
            }),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Parses a wall-clock date or date-time. Slash dates are read month-first, then day-first.
pub fn parse_naive_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// RFC 3339 timestamps keep their offset; naive values are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_naive_datetime(text).map(|naive| naive.and_utc()))
}

/// Normalized, sink-ready representation of one source feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub name: Option<String>,
    pub classification_code: i64,
    pub attributes: BTreeMap<String, FieldValue>,
    pub geometry: SinkGeometry,
}
