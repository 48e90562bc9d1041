//! Document adapters: KML and delimited-table readers that turn published alert documents
//! into [`SourceFeature`]s, plus extraction of attribute tables embedded in description HTML.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use alertsync_core::{parse_naive_datetime, Polygon, Position, RawGeometry, RawValue, SourceFeature};
use anyhow::{Context, Result};
use chrono::{Duration, SecondsFormat};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "alertsync-adapters";

/// Column holding the placemark label in KML documents.
pub const KML_NAME_COLUMN: &str = "Name";
/// Column holding the placemark description (usually an HTML table) in KML documents.
pub const KML_DESCRIPTION_COLUMN: &str = "Description";

/// Whole-document read failure. Fatal for a pipeline run.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed delimited table: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column {0:?}")]
    MissingColumn(String),
    #[error("document contains no features")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub features: Vec<SourceFeature>,
    /// EPSG code of the coordinates in `features`.
    pub epsg: u32,
    /// Features kept without geometry because theirs failed validation.
    pub discarded_geometries: usize,
    /// Rows skipped entirely by the reader (sparse table rows).
    pub skipped_rows: usize,
}

pub trait DocumentAdapter: Send + Sync {
    fn format_name(&self) -> &'static str;

    fn parse_document(&self, bytes: &[u8]) -> Result<SourceDocument, ParseError>;
}

/// How a pipeline's source document is laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum DocumentSpec {
    Kml,
    Csv(CsvOptions),
}

impl DocumentSpec {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Kml => "kml",
            Self::Csv(_) => "csv",
        }
    }
}

pub fn adapter_for(spec: &DocumentSpec) -> Box<dyn DocumentAdapter> {
    match spec {
        DocumentSpec::Kml => Box::new(KmlAdapter),
        DocumentSpec::Csv(options) => Box::new(CsvTableAdapter::new(options.clone())),
    }
}

/// Reads a document from disk for offline runs and fixtures.
pub fn read_document_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// UTF-8 with a Latin-1 fallback; a leading byte-order mark is dropped.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Stable identifier from a free-text label: spaces, dashes and colons become `_`, anything
/// outside `[A-Za-z0-9_]` is removed, and a leading digit gets a `_` prefix.
pub fn clean_key(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if matches!(c, ' ' | '-' | ':') { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// One `(label, value)` row recovered from an embedded attribute table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedPair {
    pub label: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Error)]
enum AttributeExtractionError {
    #[error("invalid selector: {0}")]
    Selector(String),
}

fn selector(css: &str) -> Result<Selector, AttributeExtractionError> {
    Selector::parse(css).map_err(|e| AttributeExtractionError::Selector(e.to_string()))
}

fn cell_text(cell: scraper::ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn try_parse_attribute_table(fragment: &str) -> Result<Vec<EmbeddedPair>, AttributeExtractionError> {
    let document = Html::parse_document(fragment);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(Vec::new());
    };
    Ok(table
        .select(&row_sel)
        .filter_map(|row| {
            let cells: Vec<_> = row.select(&cell_sel).collect();
            if cells.len() != 2 {
                return None;
            }
            let label = cell_text(cells[0]);
            Some(EmbeddedPair {
                key: clean_key(&label),
                label,
                value: cell_text(cells[1]),
            })
        })
        .collect())
}

/// Pairs from every two-cell row of the first `<table>` in `fragment`, in document order.
/// Anything unparseable degrades to an empty list.
pub fn parse_attribute_table(fragment: &str) -> Vec<EmbeddedPair> {
    match try_parse_attribute_table(fragment) {
        Ok(pairs) => pairs,
        Err(err) => {
            debug!(error = %err, "embedded attribute extraction failed");
            Vec::new()
        }
    }
}

fn checked_geometry(geometry: Option<RawGeometry>, discarded: &mut usize, index: usize) -> Option<RawGeometry> {
    let geometry = geometry?;
    match geometry.validate() {
        Ok(()) => Some(geometry),
        Err(err) => {
            warn!(feature_index = index, kind = geometry.kind(), error = %err, "discarding invalid geometry");
            *discarded += 1;
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KmlAdapter;

#[derive(Debug, Default)]
struct PlacemarkBuilder {
    name: Option<String>,
    description: Option<String>,
    columns: BTreeMap<String, RawValue>,
    parts: Vec<RawGeometry>,
    polygon: Option<Polygon>,
    bad_coordinates: bool,
}

impl PlacemarkBuilder {
    fn finish(self) -> SourceFeature {
        let mut feature = SourceFeature::new(if self.bad_coordinates {
            None
        } else {
            combine_parts(self.parts)
        });
        feature.columns = self.columns;
        if let Some(name) = self.name {
            feature.columns.insert(KML_NAME_COLUMN.to_string(), RawValue::text(name));
        }
        if let Some(description) = self.description {
            feature
                .columns
                .insert(KML_DESCRIPTION_COLUMN.to_string(), RawValue::text(description));
        }
        feature
    }
}

fn combine_parts(mut parts: Vec<RawGeometry>) -> Option<RawGeometry> {
    if parts.len() <= 1 {
        return parts.pop();
    }
    if parts.iter().all(|p| matches!(p, RawGeometry::Polygon(_))) {
        let polygons = parts
            .into_iter()
            .filter_map(|p| match p {
                RawGeometry::Polygon(polygon) => Some(polygon),
                _ => None,
            })
            .collect();
        return Some(RawGeometry::MultiPolygon(polygons));
    }
    if parts.iter().all(|p| matches!(p, RawGeometry::LineString(_))) {
        let lines = parts
            .into_iter()
            .filter_map(|p| match p {
                RawGeometry::LineString(line) => Some(line),
                _ => None,
            })
            .collect();
        return Some(RawGeometry::MultiLineString(lines));
    }
    warn!(parts = parts.len(), "unsupported mixed geometry collection");
    None
}

fn parse_coordinates(text: &str) -> Option<Vec<Position>> {
    text.split_whitespace()
        .map(|tuple| {
            let mut values = tuple.split(',').map(|v| v.trim().parse::<f64>());
            match (values.next(), values.next()) {
                (Some(Ok(x)), Some(Ok(y))) => Some([x, y]),
                _ => None,
            }
        })
        .collect()
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn name_attribute(start: &BytesStart<'_>) -> Result<Option<String>, ParseError> {
    let Some(attr) = start
        .try_get_attribute("name")
        .map_err(quick_xml::Error::from)?
    else {
        return Ok(None);
    };
    let value = attr.unescape_value().map_err(quick_xml::Error::from)?;
    Ok(Some(value.into_owned()))
}

const CAPTURED: &[&str] = &["name", "description", "value", "SimpleData", "coordinates"];

impl KmlAdapter {
    fn end_element(
        builder: &mut PlacemarkBuilder,
        name: &str,
        stack: &[String],
        text: &str,
        data_name: &Option<String>,
    ) {
        let parent = stack.last().map(String::as_str);
        match name {
            "name" if parent == Some("Placemark") => builder.name = Some(text.trim().to_string()),
            "description" if parent == Some("Placemark") => {
                builder.description = Some(text.trim().to_string())
            }
            "value" if parent == Some("Data") => {
                if let Some(column) = data_name {
                    builder.columns.insert(column.clone(), RawValue::text(text.trim()));
                }
            }
            "SimpleData" => {
                if let Some(column) = data_name {
                    builder.columns.insert(column.clone(), RawValue::text(text.trim()));
                }
            }
            "coordinates" => {
                let Some(coords) = parse_coordinates(text) else {
                    builder.bad_coordinates = true;
                    return;
                };
                let grandparent = stack.len().checked_sub(2).and_then(|i| stack.get(i)).map(String::as_str);
                match (parent, grandparent) {
                    (Some("Point"), _) => match coords.as_slice() {
                        [position] => builder.parts.push(RawGeometry::Point(*position)),
                        _ => builder.bad_coordinates = true,
                    },
                    (Some("LineString"), _) => builder.parts.push(RawGeometry::LineString(coords)),
                    (Some("LinearRing"), Some("outerBoundaryIs")) => {
                        if let Some(polygon) = builder.polygon.as_mut() {
                            polygon.exterior = coords;
                        }
                    }
                    (Some("LinearRing"), Some("innerBoundaryIs")) => {
                        if let Some(polygon) = builder.polygon.as_mut() {
                            polygon.interiors.push(coords);
                        }
                    }
                    _ => {}
                }
            }
            "Polygon" => {
                if let Some(polygon) = builder.polygon.take() {
                    builder.parts.push(RawGeometry::Polygon(polygon));
                }
            }
            _ => {}
        }
    }
}

impl DocumentAdapter for KmlAdapter {
    fn format_name(&self) -> &'static str {
        "kml"
    }

    fn parse_document(&self, bytes: &[u8]) -> Result<SourceDocument, ParseError> {
        let text = decode_text(bytes);
        let mut reader = Reader::from_str(&text);

        let mut features = Vec::new();
        let mut discarded_geometries = 0usize;
        let mut current: Option<PlacemarkBuilder> = None;
        let mut stack: Vec<String> = Vec::new();
        let mut buffer = String::new();
        let mut data_name: Option<String> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "Placemark" => current = Some(PlacemarkBuilder::default()),
                        "Polygon" => {
                            if let Some(builder) = current.as_mut() {
                                builder.polygon = Some(Polygon::new(Vec::new(), Vec::new()));
                            }
                        }
                        "Data" | "SimpleData" => data_name = name_attribute(&e)?,
                        _ => {}
                    }
                    if CAPTURED.contains(&name.as_str()) {
                        buffer.clear();
                    }
                    stack.push(name);
                }
                Event::Empty(e) => {
                    if local_name(&e) == "SimpleData" {
                        if let (Some(builder), Some(column)) = (current.as_mut(), name_attribute(&e)?) {
                            builder.columns.insert(column, RawValue::Null);
                        }
                    }
                }
                Event::Text(e) => {
                    if current.is_some() {
                        buffer.push_str(&e.unescape().map_err(quick_xml::Error::from)?);
                    }
                }
                Event::CData(e) => {
                    if current.is_some() {
                        buffer.push_str(&String::from_utf8_lossy(&e));
                    }
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    stack.pop();
                    if name == "Placemark" {
                        if let Some(builder) = current.take() {
                            let index = features.len();
                            let mut feature = builder.finish();
                            feature.geometry =
                                checked_geometry(feature.geometry.take(), &mut discarded_geometries, index);
                            features.push(feature);
                        }
                    } else if let Some(builder) = current.as_mut() {
                        Self::end_element(builder, &name, &stack, &buffer, &data_name);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if features.is_empty() {
            return Err(ParseError::Empty);
        }
        debug!(features = features.len(), discarded_geometries, "parsed KML document");
        Ok(SourceDocument {
            features,
            epsg: alertsync_core::SINK_WKID,
            discarded_geometries,
            skipped_rows: 0,
        })
    }
}

/// Joins a date column and a time column into one UTC timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTimeMerge {
    pub date_column: String,
    pub time_column: String,
    /// Offset of the source wall clock from UTC, in hours (e.g. -5).
    #[serde(default)]
    pub utc_offset_hours: i64,
    #[serde(default)]
    pub drop_time_column: bool,
}

impl DateTimeMerge {
    fn merge(&self, date: Option<String>, time: Option<String>) -> RawValue {
        let joined = match (date, time) {
            (Some(date), Some(time)) => format!("{date} {time}"),
            (Some(date), None) => date,
            _ => return RawValue::Null,
        };
        match parse_naive_datetime(&joined) {
            Some(local) => RawValue::Text(
                (local - Duration::hours(self.utc_offset_hours))
                    .and_utc()
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            None => {
                debug!(value = %joined, "unparseable date/time pair");
                RawValue::Null
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvOptions {
    /// Lines to drop before the header row.
    #[serde(default)]
    pub skip_rows: usize,
    /// Rows with at least this many empty cells are skipped.
    #[serde(default)]
    pub max_empty_cells: Option<usize>,
    pub longitude_column: String,
    pub latitude_column: String,
    #[serde(default)]
    pub datetime_merge: Option<DateTimeMerge>,
}

#[derive(Debug, Clone)]
pub struct CsvTableAdapter {
    options: CsvOptions,
}

impl CsvTableAdapter {
    pub fn new(options: CsvOptions) -> Self {
        Self { options }
    }
}

fn skip_lines(text: &str, count: usize) -> &str {
    let mut rest = text;
    for _ in 0..count {
        match rest.find('\n') {
            Some(i) => rest = &rest[i + 1..],
            None => return "",
        }
    }
    rest
}

fn read_coordinate(value: Option<RawValue>) -> Option<f64> {
    value?
        .as_text()?
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

impl DocumentAdapter for CsvTableAdapter {
    fn format_name(&self) -> &'static str {
        "csv"
    }

    fn parse_document(&self, bytes: &[u8]) -> Result<SourceDocument, ParseError> {
        let text = decode_text(bytes);
        let body = skip_lines(&text, self.options.skip_rows);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(body.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if h.trim().is_empty() {
                    format!("Unnamed: {i}")
                } else {
                    h.to_string()
                }
            })
            .collect();
        for required in [&self.options.longitude_column, &self.options.latitude_column] {
            if !headers.contains(required) {
                return Err(ParseError::MissingColumn(required.clone()));
            }
        }

        let mut features = Vec::new();
        let mut skipped_rows = 0usize;
        let mut discarded_geometries = 0usize;

        for record in reader.records() {
            let record = record?;
            let mut columns: BTreeMap<String, RawValue> = headers
                .iter()
                .enumerate()
                .map(|(i, header)| (header.clone(), RawValue::text(record.get(i).unwrap_or_default())))
                .collect();

            let empty_cells = columns.values().filter(|v| v.is_null()).count();
            if let Some(max) = self.options.max_empty_cells {
                if empty_cells >= max {
                    skipped_rows += 1;
                    continue;
                }
            }

            let x = read_coordinate(columns.remove(&self.options.longitude_column));
            let y = read_coordinate(columns.remove(&self.options.latitude_column));

            if let Some(merge) = &self.options.datetime_merge {
                let date = columns.get(&merge.date_column).and_then(RawValue::as_text);
                let time = columns.get(&merge.time_column).and_then(RawValue::as_text);
                columns.insert(merge.date_column.clone(), merge.merge(date, time));
                if merge.drop_time_column {
                    columns.remove(&merge.time_column);
                }
            }

            let geometry = match (x, y) {
                (Some(x), Some(y)) => Some(RawGeometry::Point([x, y])),
                _ => {
                    discarded_geometries += 1;
                    None
                }
            };
            let index = features.len();
            let geometry = checked_geometry(geometry, &mut discarded_geometries, index);
            features.push(SourceFeature { columns, geometry });
        }

        if features.is_empty() {
            return Err(ParseError::Empty);
        }
        debug!(features = features.len(), skipped_rows, discarded_geometries, "parsed delimited table");
        Ok(SourceDocument {
            features,
            epsg: alertsync_core::SINK_WKID,
            discarded_geometries,
            skipped_rows,
        })
    }
}
