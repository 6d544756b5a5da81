use crate::config::ServerConfig;
use crate::export::DataTable;
use crate::publish::DirectRender;
use crate::style::RenderStyle;
use crate::types::{AttrValue, AttributeRow, County, FeatureCollection};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::header,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use geo::algorithm::contains::Contains;
use geo::{BoundingRect, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

// Wrapper for RTree indexing
struct CountyIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for CountyIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Everything the handlers serve, computed once before the listener starts.
pub struct AppState {
    counties: Vec<County>,
    tree: RTree<CountyIndex>,
    page: String,
    features_json: String,
    table: DataTable,
    table_csv: String,
}

impl AppState {
    /// Render the page and index the counties. Refuses an empty collection.
    /// `orphan_rows` are attribute rows with no geometry; they appear only in the table.
    pub fn build(collection: FeatureCollection, orphan_rows: &[AttributeRow], style: &RenderStyle) -> Result<Self> {
        let doc = DirectRender::build_with_orphans(&collection, orphan_rows, style)?;
        let page = doc.to_html()?;
        let features_json = serde_json::to_string(&doc.features).context("serialize features")?;
        let mut table = DataTable::from_collection(&collection, &style.key_property);
        table.append_rows(orphan_rows);
        let table_csv = table.to_csv()?;

        info!(features = collection.len(), "building spatial index");
        let tree_items: Vec<CountyIndex> = collection
            .features
            .iter()
            .enumerate()
            .filter_map(|(i, county)| {
                let rect = county.geometry.bounding_rect()?;
                Some(CountyIndex {
                    index: i,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();
        let tree = RTree::bulk_load(tree_items);

        Ok(Self { counties: collection.features, tree, page, features_json, table, table_csv })
    }

    /// The county containing the point, if any.
    pub fn lookup(&self, lon: f64, lat: f64) -> Option<&County> {
        let point = Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|candidate| self.counties.get(candidate.index))
            .find(|county| county.geometry.contains(&point))
    }
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
pub struct QueryResponse {
    id: String,
    attributes: BTreeMap<String, AttrValue>,
}

pub fn router(state: Arc<AppState>, tiles_dir: &Path) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/features", get(features_handler))
        .route("/api/table", get(table_handler))
        .route("/api/table.csv", get(table_csv_handler))
        .route("/api/query", get(query_handler))
        .nest_service("/tiles", ServeDir::new(tiles_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: &ServerConfig, tiles_dir: &Path, state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let app = router(Arc::new(state), tiles_dir);

    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.page.clone())
}

async fn features_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/geo+json")], state.features_json.clone())
}

async fn table_handler(State(state): State<Arc<AppState>>) -> Json<DataTable> {
    Json(state.table.clone())
}

async fn table_csv_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"counties.csv\""),
        ],
        state.table_csv.clone(),
    )
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    Json(state.lookup(params.lon, params.lat).map(|county| QueryResponse {
        id: county.id.clone(),
        attributes: county.attributes.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use geo::{polygon, MultiPolygon};

    fn square(id: &str, x: f64, value: f64) -> County {
        let poly = polygon![(x: x, y: 40.0), (x: x + 1.0, y: 40.0), (x: x + 1.0, y: 41.0), (x: x, y: 41.0)];
        let mut county = County::new(id, MultiPolygon::new(vec![poly]));
        county.attributes.insert("rate".into(), AttrValue::Number(value));
        county
    }

    #[test]
    fn point_lookup_finds_the_containing_county() {
        let collection = FeatureCollection::new(vec![square("08001", -105.0, 1.0), square("08005", -104.0, 2.0)]);
        let state = AppState::build(collection, &[], &RenderStyle::for_column("rate")).unwrap();

        assert_eq!(state.lookup(-103.5, 40.5).map(|c| c.id.as_str()), Some("08005"));
        assert_eq!(state.lookup(-104.5, 40.5).map(|c| c.id.as_str()), Some("08001"));
        assert!(state.lookup(-90.0, 40.5).is_none());
        assert!(state.table_csv.starts_with("GEOID,rate\n"));
        assert!(state.page.contains("<!DOCTYPE html>"));
    }

    #[test]
    fn empty_collection_does_not_start() {
        let err = AppState::build(FeatureCollection::default(), &[], &RenderStyle::for_column("rate")).err().unwrap();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::EmptyCollection { .. })));
    }

    fn orphan(key: &str, value: f64) -> AttributeRow {
        AttributeRow { key: key.into(), values: [("rate".to_string(), AttrValue::Number(value))].into_iter().collect() }
    }

    #[test]
    fn orphan_rows_are_listed_in_the_table() {
        let collection = FeatureCollection::new(vec![square("08001", -105.0, 1.0)]);
        let state = AppState::build(collection, &[orphan("72001", 3.0)], &RenderStyle::for_column("rate")).unwrap();

        assert_eq!(state.table.rows.len(), 2);
        assert!(state.table_csv.ends_with("72001,3\n"), "{}", state.table_csv);
        assert!(state.page.contains("72001"));
        assert!(!state.features_json.contains("72001"));
        assert!(state.lookup(-104.5, 40.5).is_some());
    }

    #[tokio::test]
    async fn routes_answer_over_http() {
        let tiles = tempfile::tempdir().unwrap();
        std::fs::write(tiles.path().join("counties.pmtiles"), b"PMTiles\x03").unwrap();
        let collection = FeatureCollection::new(vec![square("08001", -105.0, 1.0), square("08005", -104.0, 2.5)]);
        let state = AppState::build(collection, &[orphan("72001", 3.0)], &RenderStyle::for_column("rate")).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = router(Arc::new(state), tiles.path());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let hit: serde_json::Value = reqwest::get(format!("{base}/api/query?lat=40.5&lon=-103.5"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hit["id"], "08005");
        assert_eq!(hit["attributes"]["rate"], 2.5);

        let miss = reqwest::get(format!("{base}/api/query?lat=10&lon=10")).await.unwrap().text().await.unwrap();
        assert_eq!(miss, "null");

        let csv = reqwest::get(format!("{base}/api/table.csv")).await.unwrap();
        assert_eq!(csv.headers()[header::CONTENT_TYPE], "text/csv; charset=utf-8");
        assert_eq!(csv.text().await.unwrap(), "GEOID,rate\n08001,1\n08005,2.5\n72001,3\n");

        let table: serde_json::Value = reqwest::get(format!("{base}/api/table")).await.unwrap().json().await.unwrap();
        assert_eq!(table["columns"], serde_json::json!(["GEOID", "rate"]));

        let tile = reqwest::get(format!("{base}/tiles/counties.pmtiles")).await.unwrap();
        assert!(tile.status().is_success());
        assert_eq!(&tile.bytes().await.unwrap()[..], b"PMTiles\x03");
    }
}
