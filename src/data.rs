use crate::config::{AttributeSource, Credentials, GeometrySource};
use crate::download;
use crate::error::PipelineError;
use crate::types::{normalize_key, numeric_key, AttrValue, AttributeTable, County, FeatureCollection};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use geo::MultiPolygon;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Properties kept from Census cartographic boundary files.
const CENSUS_PROPERTIES: &[&str] = &["NAME", "STATEFP", "COUNTYFP"];

pub fn load_geometry(source: &GeometrySource, key_width: Option<usize>) -> Result<FeatureCollection> {
    let collection = match source {
        GeometrySource::File { path, key_column, properties } => {
            load_geometry_file(path, key_column, properties, key_width)?
        }
        GeometrySource::Census { level, resolution, year, cache_dir } => {
            let shp = download::fetch_boundaries(*level, *resolution, *year, cache_dir)?;
            let properties: Vec<String> = CENSUS_PROPERTIES.iter().map(|p| p.to_string()).collect();
            load_shapefile(&shp, "GEOID", &properties, key_width)?
        }
    };
    ensure_unique_keys(&collection)?;
    info!(features = collection.len(), "loaded geometry");
    Ok(collection)
}

/// Load a `.shp` or `.json`/`.geojson` file; the extension picks the reader.
pub fn load_geometry_file(
    path: &Path,
    key_column: &str,
    properties: &[String],
    key_width: Option<usize>,
) -> Result<FeatureCollection> {
    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input geometry file has no extension"))?;

    match extension.as_str() {
        "shp" => load_shapefile(path, key_column, properties, key_width),
        "json" | "geojson" => load_geojson(path, key_column, properties, key_width),
        _ => Err(PipelineError::UnsupportedFormat(extension).into()),
    }
}

fn ensure_unique_keys(collection: &FeatureCollection) -> Result<(), PipelineError> {
    let mut seen = HashSet::with_capacity(collection.len());
    for id in collection.ids() {
        if !seen.insert(id) {
            return Err(PipelineError::DuplicateKey { key: id.to_string(), source_name: "geometry source".into() });
        }
    }
    Ok(())
}

fn field_to_attr(value: &FieldValue) -> AttrValue {
    match value {
        FieldValue::Character(Some(s)) => AttrValue::Text(s.trim().to_string()),
        FieldValue::Numeric(Some(n)) => AttrValue::Number(*n),
        FieldValue::Float(Some(n)) => AttrValue::Number(*n as f64),
        FieldValue::Integer(n) => AttrValue::Number(*n as f64),
        FieldValue::Double(n) | FieldValue::Currency(n) => AttrValue::Number(*n),
        FieldValue::Logical(Some(b)) => AttrValue::Text(b.to_string()),
        FieldValue::Character(None) | FieldValue::Numeric(None) | FieldValue::Float(None) | FieldValue::Logical(None) => {
            AttrValue::Missing
        }
        other => AttrValue::Text(format!("{:?}", other)),
    }
}

pub fn load_shapefile(
    path: &Path,
    key_column: &str,
    properties: &[String],
    key_width: Option<usize>,
) -> Result<FeatureCollection> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut features = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let id_value = record.get(key_column)
            .ok_or_else(|| PipelineError::MissingColumn {
                column: key_column.to_string(),
                source_name: format!("{}", path.display()),
            })?;

        let id = match id_value {
            FieldValue::Character(Some(s)) => normalize_key(s, key_width),
            FieldValue::Numeric(Some(n)) => normalize_key(&numeric_key(*n), key_width),
            FieldValue::Character(None) | FieldValue::Numeric(None) => continue, // Skip if null
            _ => return Err(anyhow!("Shapefile key column must be character or numeric")),
        };

        let geometry = match shape {
            shapefile::Shape::Polygon(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                    .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?;
                geo_polygon
            },
            shapefile::Shape::PolygonM(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?;
                geo_polygon
            },
            shapefile::Shape::PolygonZ(polygon) => {
                let geo_polygon: MultiPolygon<f64> = polygon.try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?;
                geo_polygon
            },
            _ => continue, // Skip non-polygon shapes
        };

        let mut county = County::new(id, geometry);
        for name in properties {
            if let Some(value) = record.get(name) {
                county.attributes.insert(name.clone(), field_to_attr(value));
            }
        }
        features.push(county);
    }

    debug!(path = %path.display(), features = features.len(), "read shapefile");
    Ok(FeatureCollection::new(features))
}

/// Load a GeoJSON FeatureCollection. An empty `properties` list keeps every property.
pub fn load_geojson(
    path: &Path,
    key_column: &str,
    properties: &[String],
    key_width: Option<usize>,
) -> Result<FeatureCollection> {
    use geojson::GeoJson;

    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let reader = BufReader::new(file);

    // Parse the GeoJSON. warning: this loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut features = Vec::new();

    for feature in collection.features {
        let id_val = feature.properties.as_ref()
            .and_then(|props| props.get(key_column))
            .cloned()
            .or_else(|| feature.id.as_ref().map(|id| match id {
                geojson::feature::Id::String(s) => serde_json::Value::String(s.clone()),
                geojson::feature::Id::Number(n) => serde_json::Value::Number(n.clone()),
            }));

        let id = match id_val {
            Some(serde_json::Value::String(s)) => normalize_key(&s, key_width),
            Some(serde_json::Value::Number(n)) => match n.as_f64() {
                Some(f) => normalize_key(&numeric_key(f), key_width),
                None => continue,
            },
            _ => continue, // Skip if no ID or not string/number
        };

        let geometry = match feature.geometry {
            Some(geo) => {
                let valid_geo: geo::Geometry<f64> = geo.value.try_into()
                   .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;

                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue, // Skip points/lines
                }
            },
            None => continue,
        };

        let mut county = County::new(id, geometry);
        if let Some(props) = &feature.properties {
            for (name, value) in props {
                if name == key_column {
                    continue;
                }
                if properties.is_empty() || properties.iter().any(|p| p == name) {
                    county.attributes.insert(name.clone(), AttrValue::from_json(value));
                }
            }
        }
        features.push(county);
    }

    debug!(path = %path.display(), features = features.len(), "read geojson");
    Ok(FeatureCollection::new(features))
}

pub fn load_attributes(
    source: &AttributeSource,
    key_width: Option<usize>,
    credentials: &Credentials,
) -> Result<AttributeTable> {
    let table = match source {
        AttributeSource::Csv { path, key_column, columns } => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
            read_csv(file, key_column, columns, key_width)
                .with_context(|| format!("Failed to read CSV file: {:?}", path))?
        }
        AttributeSource::CensusApi { year, dataset, variables, .. } => download::fetch_census_table(
            *year,
            dataset,
            variables,
            credentials.census_api_key.as_deref(),
            key_width,
        )?,
    };
    info!(rows = table.len(), columns = table.columns.len(), "loaded attribute table");
    Ok(table)
}

/// Read a headed CSV. An empty `columns` list keeps every non-key column.
pub fn read_csv<R: Read>(
    input: R,
    key_column: &str,
    columns: &[String],
    key_width: Option<usize>,
) -> Result<AttributeTable> {
    let mut rdr = ReaderBuilder::new().from_reader(input);
    let headers = rdr.headers()?.clone();

    let missing = |column: &str| PipelineError::MissingColumn {
        column: column.to_string(),
        source_name: "CSV".into(),
    };

    let join_col_idx = headers.iter().position(|h| h == key_column)
        .ok_or_else(|| missing(key_column))?;

    let selected: Vec<(String, usize)> = if columns.is_empty() {
        headers.iter().enumerate()
            .filter(|(i, _)| *i != join_col_idx)
            .map(|(i, h)| (h.to_string(), i))
            .collect()
    } else {
        columns.iter()
            .map(|c| headers.iter().position(|h| h == c).map(|i| (c.clone(), i)).ok_or_else(|| missing(c)))
            .collect::<Result<_, _>>()?
    };

    let mut table = AttributeTable::new(key_column, selected.iter().map(|(c, _)| c.clone()).collect());

    for result in rdr.records() {
        let record = result?;
        let id = normalize_key(record.get(join_col_idx).unwrap_or(""), key_width);

        if id.is_empty() { continue; }

        let values: BTreeMap<String, AttrValue> = selected.iter()
            .map(|(name, idx)| (name.clone(), AttrValue::parse(record.get(*idx).unwrap_or(""))))
            .collect();
        table.push(id, values);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_keys_are_normalized_and_values_typed() {
        let csv = "fips,name,income,svi\n1001,Autauga,58786,0.43\n06037,Los Angeles,,0.9\n,blank,1,1\n";
        let table = read_csv(csv.as_bytes(), "fips", &[], Some(5)).unwrap();

        assert_eq!(table.columns, vec!["name", "income", "svi"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].key, "01001");
        assert_eq!(table.rows[0].values["income"], AttrValue::Number(58786.0));
        assert_eq!(table.rows[1].values["income"], AttrValue::Missing);
        assert_eq!(table.rows[1].values["name"], AttrValue::Text("Los Angeles".into()));
    }

    #[test]
    fn csv_selected_columns_must_exist() {
        let csv = "fips,income\n01001,1\n";
        let table = read_csv(csv.as_bytes(), "fips", &["income".to_string()], None).unwrap();
        assert_eq!(table.columns, vec!["income"]);

        let err = read_csv(csv.as_bytes(), "fips", &["poverty".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("poverty"));
        let err = read_csv(csv.as_bytes(), "GEOID", &[], None).unwrap_err();
        assert!(err.to_string().contains("GEOID"));
    }

    #[test]
    fn geojson_loader_reads_polygons_and_properties() {
        let mut file = tempfile::Builder::new().suffix(".geojson").tempfile().unwrap();
        write!(
            file,
            r#"{{"type":"FeatureCollection","features":[
                {{"type":"Feature","properties":{{"GEOID":1001,"NAME":"Autauga","ALAND":1.5}},
                  "geometry":{{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}}}},
                {{"type":"Feature","id":"01003","properties":{{"NAME":"Baldwin"}},
                  "geometry":{{"type":"MultiPolygon","coordinates":[[[[2,0],[3,0],[3,1],[2,0]]]]}}}},
                {{"type":"Feature","properties":{{"GEOID":"01005"}},
                  "geometry":{{"type":"Point","coordinates":[0,0]}}}}
            ]}}"#
        )
        .unwrap();

        let fc = load_geometry_file(file.path(), "GEOID", &["NAME".to_string()], Some(5)).unwrap();
        assert_eq!(fc.ids().collect::<Vec<_>>(), vec!["01001", "01003"]);
        assert_eq!(fc.features[0].attribute("NAME"), Some(&AttrValue::Text("Autauga".into())));
        assert!(fc.features[0].attribute("ALAND").is_none());
        assert!(fc.features[0].attribute("GEOID").is_none());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = load_geometry_file(Path::new("counties.kml"), "GEOID", &[], None).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::UnsupportedFormat(ext)) if ext == "kml"));
    }

    fn write_shapefile<S: shapefile::record::EsriShape>(path: &Path, shapes: Vec<(S, &str)>) {
        let table = shapefile::dbase::TableWriterBuilder::new()
            .add_character_field("GEOID".try_into().unwrap(), 5)
            .add_character_field("NAME".try_into().unwrap(), 20);
        let mut writer = shapefile::Writer::from_path(path, table).unwrap();
        for (shape, geoid) in shapes {
            let mut record = shapefile::dbase::Record::default();
            record.insert("GEOID".into(), FieldValue::Character(Some(geoid.into())));
            record.insert("NAME".into(), FieldValue::Character(Some(format!("County {geoid}"))));
            writer.write_shape_and_record(&shape, &record).unwrap();
        }
    }

    fn unit_ring<P>(x: f64, point: impl Fn(f64, f64) -> P) -> shapefile::PolygonRing<P> {
        shapefile::PolygonRing::Outer(vec![point(x, 40.0), point(x, 41.0), point(x + 1.0, 41.0), point(x + 1.0, 40.0), point(x, 40.0)])
    }

    #[test]
    fn shapefile_polygons_load_with_keys_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counties.shp");
        write_shapefile(
            &path,
            vec![
                (shapefile::Polygon::new(unit_ring(-105.0, shapefile::Point::new)), "8001"),
                (shapefile::Polygon::new(unit_ring(-104.0, shapefile::Point::new)), "08005"),
            ],
        );

        let collection = load_geometry_file(&path, "GEOID", &["NAME".to_string()], Some(5)).unwrap();
        let ids: Vec<&str> = collection.ids().collect();
        assert_eq!(ids, vec!["08001", "08005"]);
        assert_eq!(collection.features[0].attribute("NAME"), Some(&AttrValue::Text("County 8001".into())));
        assert_eq!(collection.features[1].geometry.0.len(), 1);
        assert_eq!(collection.features[1].geometry.0[0].exterior().0.len(), 5);
    }

    #[test]
    fn measured_and_3d_polygons_load_as_plain_polygons() {
        let dir = tempfile::tempdir().unwrap();
        let measured = dir.path().join("measured.shp");
        write_shapefile(&measured, vec![(shapefile::PolygonM::new(unit_ring(-105.0, |x, y| shapefile::PointM::new(x, y, 0.0))), "08001")]);
        let elevated = dir.path().join("elevated.shp");
        write_shapefile(
            &elevated,
            vec![(shapefile::PolygonZ::new(unit_ring(-104.0, |x, y| shapefile::PointZ::new(x, y, 1600.0, 0.0))), "08005")],
        );

        let m = load_shapefile(&measured, "GEOID", &[], Some(5)).unwrap();
        let z = load_shapefile(&elevated, "GEOID", &[], Some(5)).unwrap();
        assert_eq!(m.features[0].id, "08001");
        assert_eq!(z.features[0].id, "08005");
        let xs: Vec<f64> = z.features[0].geometry.0[0].exterior().coords().map(|c| c.x).collect();
        assert!(xs.contains(&-104.0) && xs.contains(&-103.0));
    }

    #[test]
    fn shapefile_without_key_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counties.shp");
        write_shapefile(&path, vec![(shapefile::Polygon::new(unit_ring(-105.0, shapefile::Point::new)), "08001")]);
        let err = load_shapefile(&path, "FIPS", &[], Some(5)).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::MissingColumn { .. })));
    }
}
