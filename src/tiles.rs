//! Tile packaging: feature-collection file in, multi-zoom tile archive out.
//!
//! `TippecanoePackager` shells out to the external tool; `PmtilesPackager` does
//! the same job in-process, writing Mapbox Vector Tiles into a PMTiles v3 archive.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use geo::{BoundingRect, MultiPolygon, Polygon};
use mvt::{GeomEncoder, GeomType, Tile};
use pmtiles2::{util::tile_id, Compression as PmtilesCompression, PMTiles, TileType};
use tracing::{debug, info};

use crate::config::{PackagerKind, TilesConfig};
use crate::data::load_geojson;
use crate::error::PipelineError;
use crate::simplify::{SimplifyAlgorithm, SimplifyOptions, Simplifier};
use crate::types::{AttrValue, FeatureCollection};

/// Web Mercator latitude limit.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;
const EXTENT: u32 = 4096;
/// Clip buffer around each tile, in tile units.
const BUFFER: f64 = 64.0;

#[derive(Debug, Clone)]
pub struct PackageRequest {
    /// GeoJSON FeatureCollection to package.
    pub input: PathBuf,
    pub output: PathBuf,
    pub layer: String,
    /// Property holding each feature's key.
    pub key_property: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub packager: String,
    pub output: PathBuf,
    pub bytes: u64,
    /// Number of tiles written, when the packager reports it.
    pub tiles: Option<usize>,
}

pub trait TilePackager {
    fn name(&self) -> &str;
    fn package(&self, request: &PackageRequest) -> Result<PackageReport>;
}

pub fn packager_for(config: &TilesConfig) -> Box<dyn TilePackager> {
    match config.packager {
        PackagerKind::Tippecanoe => Box::new(TippecanoePackager {
            binary: config.tippecanoe_binary.clone(),
            extra_args: config.tippecanoe_args.clone(),
        }),
        PackagerKind::Pmtiles => Box::new(PmtilesPackager),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    Ok(())
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path).with_context(|| format!("stat {}", path.display()))?.len())
}

pub struct TippecanoePackager {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
}

impl TippecanoePackager {
    pub fn command(&self, request: &PackageRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-o").arg(&request.output)
            .arg("-l").arg(&request.layer)
            .arg("-Z").arg(request.min_zoom.to_string())
            .arg("-z").arg(request.max_zoom.to_string())
            .arg("--force")
            .args(&self.extra_args)
            .arg(&request.input);
        cmd
    }
}

impl TilePackager for TippecanoePackager {
    fn name(&self) -> &str {
        "tippecanoe"
    }

    fn package(&self, request: &PackageRequest) -> Result<PackageReport> {
        ensure_parent(&request.output)?;
        let tool = self.binary.display().to_string();
        info!(%tool, input = %request.input.display(), output = %request.output.display(), "running tile packager");

        let output = match self.command(request).output() {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(PipelineError::ToolMissing(tool).into()),
            Err(e) => return Err(e).with_context(|| format!("spawn {}", tool)),
        };
        if !output.status.success() {
            return Err(PipelineError::ToolFailed {
                tool,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(PackageReport {
            packager: self.name().to_string(),
            output: request.output.clone(),
            bytes: file_size(&request.output)?,
            tiles: None,
        })
    }
}

/// In-process packager producing a PMTiles archive of gzip-compressed MVT tiles.
pub struct PmtilesPackager;

impl TilePackager for PmtilesPackager {
    fn name(&self) -> &str {
        "pmtiles"
    }

    fn package(&self, request: &PackageRequest) -> Result<PackageReport> {
        let collection = load_geojson(&request.input, &request.key_property, &[], None)?;
        let (bytes, tiles) = encode_pmtiles(&collection, &request.layer, &request.key_property, request.min_zoom, request.max_zoom)?;

        ensure_parent(&request.output)?;
        fs::write(&request.output, &bytes).with_context(|| format!("write {}", request.output.display()))?;
        info!(output = %request.output.display(), tiles, bytes = bytes.len(), "wrote tile archive");

        Ok(PackageReport {
            packager: self.name().to_string(),
            output: request.output.clone(),
            bytes: bytes.len() as u64,
            tiles: Some(tiles),
        })
    }
}

fn lon_to_tile_x(lon: f64, zoom: u8) -> u64 {
    let n = 2.0_f64.powi(zoom as i32);
    let x = ((lon.clamp(-180.0, 180.0) + 180.0) / 360.0 * n).floor();
    (x as u64).min(n as u64 - 1)
}

fn lat_to_tile_y(lat: f64, zoom: u8) -> u64 {
    let n = 2.0_f64.powi(zoom as i32);
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();
    (y.max(0.0) as u64).min(n as u64 - 1)
}

/// Project lon/lat into the coordinate space of tile (z, x, y), 0..EXTENT with y down.
fn to_tile_coords(lon: f64, lat: f64, z: u8, x: u64, y: u64) -> (f64, f64) {
    let n = 2.0_f64.powi(z as i32);
    let world_x = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let world_y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;
    let extent = EXTENT as f64;
    ((world_x - x as f64) * extent, (world_y - y as f64) * extent)
}

/// Sutherland-Hodgman clip of a ring against the buffered tile square.
fn clip_ring(ring: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let lo = -BUFFER;
    let hi = EXTENT as f64 + BUFFER;
    let mut out = ring.to_vec();
    out = clip_edge(&out, |p| p.0 >= lo, |a, b| (lo, a.1 + (lo - a.0) / (b.0 - a.0) * (b.1 - a.1)));
    out = clip_edge(&out, |p| p.0 <= hi, |a, b| (hi, a.1 + (hi - a.0) / (b.0 - a.0) * (b.1 - a.1)));
    out = clip_edge(&out, |p| p.1 >= lo, |a, b| (a.0 + (lo - a.1) / (b.1 - a.1) * (b.0 - a.0), lo));
    out = clip_edge(&out, |p| p.1 <= hi, |a, b| (a.0 + (hi - a.1) / (b.1 - a.1) * (b.0 - a.0), hi));
    out
}

fn clip_edge<F, I>(ring: &[(f64, f64)], inside: F, intersect: I) -> Vec<(f64, f64)>
where
    F: Fn(&(f64, f64)) -> bool,
    I: Fn(&(f64, f64), &(f64, f64)) -> (f64, f64),
{
    let mut out = Vec::with_capacity(ring.len());
    for i in 0..ring.len() {
        let current = &ring[i];
        let next = &ring[(i + 1) % ring.len()];
        match (inside(current), inside(next)) {
            (true, true) => out.push(*next),
            (true, false) => out.push(intersect(current, next)),
            (false, true) => {
                out.push(intersect(current, next));
                out.push(*next);
            }
            (false, false) => {}
        }
    }
    out
}

/// Round to integer tile units and drop repeated, closing and backtracking points.
fn clean_ring(ring: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    let mut cleaned: Vec<(f64, f64)> = Vec::with_capacity(ring.len());
    for (x, y) in ring {
        let point = (x.round(), y.round());
        if cleaned.last() == Some(&point) {
            continue;
        }
        if cleaned.len() >= 2 && cleaned[cleaned.len() - 2] == point {
            cleaned.pop();
            continue;
        }
        cleaned.push(point);
    }
    while cleaned.len() > 1 && cleaned.first() == cleaned.last() {
        cleaned.pop();
    }
    if cleaned.len() < 3 {
        cleaned.clear();
    }
    cleaned
}

/// Twice the signed shoelace area. In y-down tile space a clockwise-looking ring is positive.
fn signed_area2(ring: &[(f64, f64)]) -> f64 {
    (0..ring.len())
        .map(|i| {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % ring.len()];
            x0 * y1 - x1 * y0
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingRole {
    Exterior,
    Interior,
}

/// Project, clip and clean one ring. Exteriors come out with positive area and
/// holes with negative area, whatever the winding of the source ring.
fn tile_ring(coords: impl Iterator<Item = (f64, f64)>, role: RingRole, z: u8, x: u64, y: u64) -> Vec<(f64, f64)> {
    let projected: Vec<(f64, f64)> = coords
        .filter(|(lon, lat)| lon.is_finite() && lat.is_finite())
        .map(|(lon, lat)| to_tile_coords(lon, lat, z, x, y))
        .collect();
    let mut ring = clean_ring(clip_ring(&projected));
    let area = signed_area2(&ring);
    if area == 0.0 {
        ring.clear();
    } else if (role == RingRole::Exterior) != (area > 0.0) {
        ring.reverse();
    }
    ring
}

/// Encode the polygons of one county into a single MVT polygon geometry.
fn encode_polygons(polygons: &[&Polygon<f64>], z: u8, x: u64, y: u64) -> Result<Option<mvt::GeomData>> {
    let mut encoder = GeomEncoder::new(GeomType::Polygon);
    let mut rings = 0;
    for poly in polygons {
        let exterior = tile_ring(poly.exterior().coords().map(|c| (c.x, c.y)), RingRole::Exterior, z, x, y);
        if exterior.is_empty() {
            continue;
        }
        for (px, py) in &exterior {
            encoder = encoder.point(*px, *py)?;
        }
        encoder = encoder.complete()?;
        rings += 1;

        for interior in poly.interiors() {
            let hole = tile_ring(interior.coords().map(|c| (c.x, c.y)), RingRole::Interior, z, x, y);
            if hole.is_empty() {
                continue;
            }
            for (px, py) in &hole {
                encoder = encoder.point(*px, *py)?;
            }
            encoder = encoder.complete()?;
        }
    }
    if rings == 0 {
        return Ok(None);
    }
    Ok(Some(encoder.encode()?))
}

/// Simplification tolerance in degrees for a zoom level; none at the deepest zoom.
fn zoom_tolerance(zoom: u8, max_zoom: u8) -> f64 {
    if zoom >= max_zoom {
        return 0.0;
    }
    360.0 / 2.0_f64.powi(zoom as i32) / 1000.0
}

/// Features touching one tile: feature index to the indices of its polygon parts.
type TileParts = BTreeMap<usize, Vec<usize>>;

/// Encode a collection as a PMTiles archive. Returns the archive bytes and tile count.
///
/// Zoom levels are handled one at a time; a tile only records which parts touch it.
pub fn encode_pmtiles(
    collection: &FeatureCollection,
    layer: &str,
    key_property: &str,
    min_zoom: u8,
    max_zoom: u8,
) -> Result<(Vec<u8>, usize)> {
    collection.ensure_not_empty("tile packaging")?;
    let max_zoom = max_zoom.max(min_zoom);

    let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for county in &collection.features {
        if let Some(rect) = county.geometry.bounding_rect() {
            bounds[0] = bounds[0].min(rect.min().x);
            bounds[1] = bounds[1].min(rect.min().y);
            bounds[2] = bounds[2].max(rect.max().x);
            bounds[3] = bounds[3].max(rect.max().y);
        }
    }

    let mut pm = PMTiles::new(TileType::Mvt, PmtilesCompression::GZip);
    pm.min_zoom = min_zoom;
    pm.max_zoom = max_zoom;
    pm.min_longitude = bounds[0];
    pm.min_latitude = bounds[1];
    pm.max_longitude = bounds[2];
    pm.max_latitude = bounds[3];
    pm.center_zoom = (min_zoom + max_zoom) / 2;
    pm.center_longitude = (bounds[0] + bounds[2]) / 2.0;
    pm.center_latitude = (bounds[1] + bounds[3]) / 2.0;
    pm.meta_data.insert("name".into(), serde_json::json!(layer));
    pm.meta_data.insert("format".into(), serde_json::json!("pbf"));
    pm.meta_data.insert("type".into(), serde_json::json!("overlay"));
    pm.meta_data.insert("minzoom".into(), serde_json::json!(min_zoom));
    pm.meta_data.insert("maxzoom".into(), serde_json::json!(max_zoom));
    pm.meta_data.insert(
        "vector_layers".into(),
        serde_json::json!([{
            "id": layer,
            "fields": layer_fields(collection, key_property),
            "minzoom": min_zoom,
            "maxzoom": max_zoom,
        }]),
    );

    let mut written = 0;
    for zoom in min_zoom..=max_zoom {
        let tolerance = zoom_tolerance(zoom, max_zoom);
        let simplifier = Simplifier::new(SimplifyOptions { tolerance, algorithm: SimplifyAlgorithm::DouglasPeucker });
        let geometries: Vec<Cow<'_, MultiPolygon<f64>>> = collection
            .features
            .iter()
            .map(|county| {
                if tolerance > 0.0 {
                    Cow::Owned(simplifier.simplify_geometry(&county.geometry))
                } else {
                    Cow::Borrowed(&county.geometry)
                }
            })
            .collect();

        let mut tiles: BTreeMap<(u64, u64), TileParts> = BTreeMap::new();
        for (idx, geometry) in geometries.iter().enumerate() {
            for (part, poly) in geometry.iter().enumerate() {
                let Some(bbox) = poly.bounding_rect() else { continue };
                let (min, max) = (bbox.min(), bbox.max());
                if !(min.x.is_finite() && min.y.is_finite() && max.x.is_finite() && max.y.is_finite()) {
                    continue;
                }
                for tx in lon_to_tile_x(min.x, zoom)..=lon_to_tile_x(max.x, zoom) {
                    for ty in lat_to_tile_y(max.y, zoom)..=lat_to_tile_y(min.y, zoom) {
                        tiles.entry((tx, ty)).or_default().entry(idx).or_default().push(part);
                    }
                }
            }
        }

        for ((x, y), counties) in &tiles {
            let Some(bytes) = encode_tile(collection, &geometries, counties, layer, key_property, zoom, *x, *y)? else {
                continue;
            };
            pm.add_tile(tile_id(zoom, *x, *y), bytes)?;
            written += 1;
        }
        debug!(zoom, tiles = tiles.len(), "encoded zoom level");
    }

    let mut buffer = Cursor::new(Vec::new());
    pm.to_writer(&mut buffer)?;
    Ok((buffer.into_inner(), written))
}

/// One gzipped MVT tile, or `None` when every part clipped away.
#[allow(clippy::too_many_arguments)]
fn encode_tile(
    collection: &FeatureCollection,
    geometries: &[Cow<'_, MultiPolygon<f64>>],
    counties: &TileParts,
    layer: &str,
    key_property: &str,
    z: u8,
    x: u64,
    y: u64,
) -> Result<Option<Vec<u8>>> {
    let mut tile = Tile::new(EXTENT);
    let mut mvt_layer = tile.create_layer(layer);
    let mut features = 0;
    for (idx, parts) in counties {
        let polygons: Vec<&Polygon<f64>> = parts.iter().filter_map(|part| geometries[*idx].0.get(*part)).collect();
        let Some(geom) = encode_polygons(&polygons, z, x, y)? else { continue };
        let county = &collection.features[*idx];
        let mut feature = mvt_layer.into_feature(geom);
        feature.set_id(*idx as u64);
        feature.add_tag_string(key_property, &county.id);
        for (name, value) in &county.attributes {
            match value {
                AttrValue::Number(n) => feature.add_tag_double(name, *n),
                AttrValue::Text(s) => feature.add_tag_string(name, s),
                AttrValue::Missing => {}
            }
        }
        mvt_layer = feature.into_layer();
        features += 1;
    }
    if features == 0 {
        return Ok(None);
    }
    tile.add_layer(mvt_layer)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tile.to_bytes()?)?;
    debug!(z, x, y, features, "encoded tile");
    Ok(Some(gz.finish()?))
}

/// `vector_layers` field types: "Number" when every present value is numeric, else "String".
fn layer_fields(collection: &FeatureCollection, key_property: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
    for county in &collection.features {
        for (name, value) in &county.attributes {
            let kind = match value {
                AttrValue::Number(_) => "Number",
                AttrValue::Text(_) => "String",
                AttrValue::Missing => continue,
            };
            let entry = fields.entry(name.as_str()).or_insert(kind);
            if *entry != kind {
                *entry = "String";
            }
        }
    }
    fields.insert(key_property, "String");
    fields.into_iter().map(|(k, v)| (k.to_string(), serde_json::json!(v))).collect()
}
