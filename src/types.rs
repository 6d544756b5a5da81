use std::collections::BTreeMap;

use geo::{CoordsIter, MultiPolygon};
use serde::Serialize;

use crate::error::PipelineError;

/// A single attribute cell, from either the geometry source or a joined table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Text(String),
    Missing,
}

impl AttrValue {
    /// Parse a raw text cell: numbers become `Number`, blanks become `Missing`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return AttrValue::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => AttrValue::Number(n),
            _ => AttrValue::Text(trimmed.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, AttrValue::Missing)
    }

    /// Convert a JSON property value from a GeoJSON feature.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map_or(AttrValue::Missing, AttrValue::Number),
            serde_json::Value::String(s) => AttrValue::Text(s.clone()),
            serde_json::Value::Bool(b) => AttrValue::Text(b.to_string()),
            serde_json::Value::Null => AttrValue::Missing,
            other => AttrValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            AttrValue::Text(s) => serde_json::Value::String(s.clone()),
            AttrValue::Missing => serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct County {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl County {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self { id: id.into(), geometry, attributes: BTreeMap::new() }
    }

    pub fn attribute(&self, column: &str) -> Option<&AttrValue> {
        self.attributes.get(column)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureCollection {
    pub features: Vec<County>,
}

impl FeatureCollection {
    pub fn new(features: Vec<County>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|c| c.id.as_str())
    }

    pub fn vertex_count(&self) -> usize {
        self.features.iter().map(|c| c.geometry.coords_count()).sum()
    }

    /// Minimum and maximum of the finite numeric values in `column`.
    pub fn numeric_range(&self, column: &str) -> Option<(f64, f64)> {
        self.features
            .iter()
            .filter_map(|c| c.attribute(column).and_then(AttrValue::as_f64))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn ensure_not_empty(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::EmptyCollection { stage });
        }
        Ok(())
    }
}

/// One keyed row of an attribute table.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRow {
    pub key: String,
    pub values: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    pub key_column: String,
    pub columns: Vec<String>,
    pub rows: Vec<AttributeRow>,
}

impl AttributeTable {
    pub fn new(key_column: impl Into<String>, columns: Vec<String>) -> Self {
        Self { key_column: key_column.into(), columns, rows: Vec::new() }
    }

    pub fn push(&mut self, key: impl Into<String>, values: BTreeMap<String, AttrValue>) {
        self.rows.push(AttributeRow { key: key.into(), values });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Normalize an administrative key. Purely numeric keys are zero-padded to `width`.
pub fn normalize_key(raw: &str, width: Option<usize>) -> String {
    let trimmed = raw.trim();
    match width {
        Some(w) if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{:0>w$}", trimmed, w = w)
        }
        _ => trimmed.to_string(),
    }
}

/// Render a numeric key as an integer string, e.g. `1001.0` -> `"1001"`.
pub fn numeric_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(id: &str, value: f64) -> County {
        let poly = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let mut county = County::new(id, MultiPolygon::new(vec![poly]));
        county.attributes.insert("income".into(), AttrValue::Number(value));
        county
    }

    #[test]
    fn numeric_keys_are_zero_padded() {
        assert_eq!(normalize_key("1001", Some(5)), "01001");
        assert_eq!(normalize_key(" 06037 ", Some(5)), "06037");
        assert_eq!(normalize_key("AB12", Some(5)), "AB12");
        assert_eq!(normalize_key("1001", None), "1001");
        assert_eq!(numeric_key(1001.0), "1001");
    }

    #[test]
    fn cell_parsing() {
        assert_eq!(AttrValue::parse("42.5"), AttrValue::Number(42.5));
        assert_eq!(AttrValue::parse("  "), AttrValue::Missing);
        assert_eq!(AttrValue::parse("Autauga"), AttrValue::Text("Autauga".into()));
        assert_eq!(AttrValue::parse("NaN"), AttrValue::Text("NaN".into()));
    }

    #[test]
    fn numeric_range_skips_missing() {
        let mut fc = FeatureCollection::new(vec![square("a", 3.0), square("b", -1.0), square("c", 8.0)]);
        fc.features[1].attributes.insert("income".into(), AttrValue::Missing);
        assert_eq!(fc.numeric_range("income"), Some((3.0, 8.0)));
        assert_eq!(fc.numeric_range("absent"), None);
        assert_eq!(fc.vertex_count(), 15);
    }

    #[test]
    fn empty_collection_is_rejected() {
        let err = FeatureCollection::default().ensure_not_empty("render").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyCollection { stage: "render" }));
    }
}
