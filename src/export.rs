//! GeoJSON output for the joined, simplified feature collection.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use geojson::{feature::Id, Feature, FeatureCollection as GeoJsonCollection, Geometry, JsonObject, Value};
use serde::Serialize;
use tracing::info;

use crate::types::{numeric_key, AttrValue, AttributeRow, County, FeatureCollection};

/// Properties of a county: the key under `key_property`, then its attributes by name.
pub fn properties(county: &County, key_property: &str) -> JsonObject {
    let mut props = JsonObject::new();
    for (name, value) in &county.attributes {
        props.insert(name.clone(), value.to_json());
    }
    props.insert(key_property.to_string(), serde_json::Value::String(county.id.clone()));
    props
}

pub fn to_feature(county: &County, key_property: &str) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::from(&county.geometry))),
        id: Some(Id::String(county.id.clone())),
        properties: Some(properties(county, key_property)),
        foreign_members: None,
    }
}

pub fn to_geojson(collection: &FeatureCollection, key_property: &str) -> GeoJsonCollection {
    GeoJsonCollection {
        bbox: None,
        features: collection.features.iter().map(|c| to_feature(c, key_property)).collect(),
        foreign_members: None,
    }
}

pub fn write_geojson(collection: &FeatureCollection, key_property: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &to_geojson(collection, key_property))
        .with_context(|| format!("write GeoJSON {}", path.display()))?;
    writer.flush()?;
    info!(path = %path.display(), features = collection.len(), "wrote feature collection");
    Ok(())
}

/// Tabular view of a collection: the key column first, then every attribute column by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl DataTable {
    pub fn from_collection(collection: &FeatureCollection, key_property: &str) -> Self {
        let mut names: Vec<&str> = collection
            .features
            .iter()
            .flat_map(|c| c.attributes.keys().map(String::as_str))
            .filter(|name| *name != key_property)
            .collect();
        names.sort_unstable();
        names.dedup();

        let rows = collection
            .features
            .iter()
            .map(|county| {
                let mut row = Vec::with_capacity(names.len() + 1);
                row.push(serde_json::Value::String(county.id.clone()));
                row.extend(names.iter().map(|name| county.attribute(name).map_or(serde_json::Value::Null, AttrValue::to_json)));
                row
            })
            .collect();

        let mut columns = vec![key_property.to_string()];
        columns.extend(names.into_iter().map(str::to_string));
        Self { columns, rows }
    }

    /// Append attribute rows that have no geometry, adding any columns they bring.
    pub fn append_rows(&mut self, rows: &[AttributeRow]) {
        for row in rows {
            for name in row.values.keys() {
                if !self.columns.iter().any(|c| c == name) {
                    self.columns.push(name.clone());
                    self.rows.iter_mut().for_each(|r| r.push(serde_json::Value::Null));
                }
            }
            let mut cells = vec![serde_json::Value::String(row.key.clone())];
            cells.extend(
                self.columns[1..]
                    .iter()
                    .map(|name| row.values.get(name).map_or(serde_json::Value::Null, AttrValue::to_json)),
            );
            self.rows.push(cells);
        }
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|cell| match cell {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.as_f64().map_or_else(|| n.to_string(), numeric_key),
                other => other.to_string(),
            }))?;
        }
        let bytes = writer.into_inner().context("flush CSV")?;
        String::from_utf8(bytes).context("CSV is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_geometry_file;
    use crate::types::AttrValue;
    use geo::{polygon, MultiPolygon};

    #[test]
    fn written_file_loads_back_with_attributes() {
        let poly = polygon![(x: -86.9, y: 32.3), (x: -86.4, y: 32.3), (x: -86.4, y: 32.7), (x: -86.9, y: 32.7)];
        let mut county = County::new("01001", MultiPolygon::new(vec![poly]));
        county.attributes.insert("NAME".into(), AttrValue::Text("Autauga".into()));
        county.attributes.insert("income".into(), AttrValue::Number(58786.0));
        county.attributes.insert("svi".into(), AttrValue::Missing);
        let collection = FeatureCollection::new(vec![county]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/counties.geojson");
        write_geojson(&collection, "GEOID", &path).unwrap();

        let loaded = load_geometry_file(&path, "GEOID", &[], Some(5)).unwrap();
        assert_eq!(loaded.len(), 1);
        let county = &loaded.features[0];
        assert_eq!(county.id, "01001");
        assert_eq!(county.attribute("income"), Some(&AttrValue::Number(58786.0)));
        assert_eq!(county.attribute("svi"), Some(&AttrValue::Missing));
        assert_eq!(county.geometry, collection.features[0].geometry);
    }

    #[test]
    fn table_has_key_first_and_blank_missing_cells() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let mut a = County::new("01001", MultiPolygon::new(vec![square.clone()]));
        a.attributes.insert("pop".into(), AttrValue::Number(1500.0));
        a.attributes.insert("NAME".into(), AttrValue::Text("Autauga, AL".into()));
        let mut b = County::new("01003", MultiPolygon::new(vec![square]));
        b.attributes.insert("pop".into(), AttrValue::Missing);

        let table = DataTable::from_collection(&FeatureCollection::new(vec![a, b]), "GEOID");
        assert_eq!(table.columns, vec!["GEOID", "NAME", "pop"]);
        assert_eq!(table.rows[1][1], serde_json::Value::Null);

        let csv = table.to_csv().unwrap();
        assert_eq!(csv, "GEOID,NAME,pop\n01001,\"Autauga, AL\",1500\n01003,,\n");
    }

    #[test]
    fn rows_without_geometry_are_appended() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let mut a = County::new("01001", MultiPolygon::new(vec![square]));
        a.attributes.insert("pop".into(), AttrValue::Number(1500.5));
        let mut table = DataTable::from_collection(&FeatureCollection::new(vec![a]), "GEOID");

        let orphan = AttributeRow {
            key: "72001".into(),
            values: [("pop".to_string(), AttrValue::Number(19000.0)), ("note".to_string(), AttrValue::Text("PR".into()))]
                .into_iter()
                .collect(),
        };
        table.append_rows(&[orphan]);

        assert_eq!(table.columns, vec!["GEOID", "pop", "note"]);
        assert_eq!(table.to_csv().unwrap(), "GEOID,pop,note\n01001,1500.5,\n72001,19000,PR\n");
    }
}
