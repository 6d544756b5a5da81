//! The two ways a run ends: upload the tile archive to a hosted service, or
//! render a self-contained map page from the collection itself.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use geo::BoundingRect;
use geojson::FeatureCollection as GeoJsonCollection;
use reqwest::blocking::{multipart::Form, Client};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::download;
use crate::error::PipelineError;
use crate::export::{self, DataTable};
use crate::page::{self, PageOptions};
use crate::style::{ColorScale, Legend, Projection, RenderStyle, StrokeStyle};
use crate::types::{AttrValue, AttributeRow, FeatureCollection};

/// Where an archive goes on the hosted tile service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedTarget {
    pub api_base: String,
    pub account: String,
    pub tileset: String,
}

impl HostedTarget {
    pub fn tileset_id(&self) -> String {
        format!("{}.{}", self.account, self.tileset)
    }

    /// Upload endpoint, without the access token.
    pub fn source_url(&self) -> String {
        format!(
            "{}/tilesets/v1/sources/{}/{}",
            self.api_base.trim_end_matches('/'),
            self.account,
            self.tileset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReceipt {
    pub tileset_id: String,
    pub status: u16,
    /// Response body; a JSON string when the service did not answer with JSON.
    pub response: serde_json::Value,
}

pub struct HostedPublisher {
    target: HostedTarget,
    token: String,
    client: Client,
}

impl HostedPublisher {
    pub fn new(target: HostedTarget, credentials: &Credentials) -> Result<Self> {
        let token = credentials
            .tile_service_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::MissingCredential("tile service access token".into()))?;
        Ok(Self { target, token, client: download::client()? })
    }

    pub fn target(&self) -> &HostedTarget {
        &self.target
    }

    /// Upload `archive` as a tileset source. Any non-success status fails the upload.
    pub fn publish(&self, archive: &Path) -> Result<UploadReceipt> {
        let url = self.target.source_url();
        let size = fs::metadata(archive)
            .with_context(|| format!("stat archive {}", archive.display()))?
            .len();
        info!(%url, archive = %archive.display(), bytes = size, "uploading tile archive");

        let form = Form::new()
            .file("file", archive)
            .with_context(|| format!("attach {}", archive.display()))?;
        let response = self
            .client
            .post(&url)
            .query(&[("access_token", self.token.as_str())])
            .multipart(form)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(reqwest::Error::without_url)
            .context("read upload response")?;
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "upload rejected");
            return Err(PipelineError::UploadRejected { url, status: status.as_u16(), body }.into());
        }

        let response = serde_json::from_str(&body).unwrap_or_else(|_| serde_json::Value::String(body.clone()));
        let receipt = UploadReceipt { tileset_id: self.target.tileset_id(), status: status.as_u16(), response };
        info!(tileset = %receipt.tileset_id, status = receipt.status, "upload accepted");
        Ok(receipt)
    }
}

/// Everything the direct-render page needs, serialized into the page as one JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct MapDocument {
    pub title: String,
    pub column: String,
    /// Features with their attributes plus `_fill` and `_tooltip`.
    pub features: GeoJsonCollection,
    pub legend: Legend,
    pub stroke: StrokeStyle,
    pub hover: StrokeStyle,
    pub fill_opacity: f64,
    pub projection: Projection,
    pub crs: &'static str,
    /// `[west, south, east, north]`.
    pub bounds: Option<[f64; 4]>,
    pub table: Option<DataTable>,
}

impl MapDocument {
    pub fn to_html(&self) -> Result<String> {
        let options = PageOptions { title: self.title.clone(), show_table: self.table.is_some(), ..PageOptions::default() };
        page::render_direct(self, &options)
    }

    pub fn write_html(&self, path: &Path) -> Result<()> {
        let html = self.to_html()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        fs::write(path, html).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "wrote map page");
        Ok(())
    }
}

pub struct DirectRender;

impl DirectRender {
    /// Style every county by `style.column`. An empty collection or a column
    /// without any numeric value is refused rather than drawn as a blank map.
    pub fn build(collection: &FeatureCollection, style: &RenderStyle) -> Result<MapDocument, PipelineError> {
        Self::build_with_orphans(collection, &[], style)
    }

    /// As `build`, with attribute rows that matched no county listed at the end
    /// of the data table. They are never drawn.
    pub fn build_with_orphans(
        collection: &FeatureCollection,
        orphan_rows: &[AttributeRow],
        style: &RenderStyle,
    ) -> Result<MapDocument, PipelineError> {
        collection.ensure_not_empty("render")?;
        let (min, max) = collection
            .numeric_range(&style.column)
            .ok_or_else(|| PipelineError::NoNumericValues(style.column.clone()))?;
        let scale = ColorScale::new(style.stops.clone(), min, max);

        let mut features = export::to_geojson(collection, &style.key_property);
        for (feature, county) in features.features.iter_mut().zip(&collection.features) {
            let fill = county
                .attribute(&style.column)
                .and_then(AttrValue::as_f64)
                .and_then(|v| scale.color(v))
                .unwrap_or(style.missing_color);
            let tooltip = style.tooltip.render(county, &style.column, style.legend_format);
            if let Some(props) = feature.properties.as_mut() {
                props.insert("_fill".into(), serde_json::Value::String(fill.to_string()));
                props.insert("_tooltip".into(), serde_json::Value::String(tooltip));
            }
        }

        let bounds = collection
            .features
            .iter()
            .filter_map(|c| c.geometry.bounding_rect())
            .fold(None, |acc: Option<[f64; 4]>, r| {
                Some(match acc {
                    None => [r.min().x, r.min().y, r.max().x, r.max().y],
                    Some(b) => [b[0].min(r.min().x), b[1].min(r.min().y), b[2].max(r.max().x), b[3].max(r.max().y)],
                })
            });

        let legend = Legend::build(&style.legend_title, &scale, style.legend_steps, style.legend_format, style.missing_color);
        info!(features = collection.len(), column = %style.column, min, max, "built direct render");

        Ok(MapDocument {
            title: style.title.clone(),
            column: style.column.clone(),
            features,
            legend,
            stroke: style.stroke.clone(),
            hover: style.hover.clone(),
            fill_opacity: style.fill_opacity,
            projection: style.projection,
            crs: style.projection.leaflet_crs(),
            bounds,
            table: style.table.then(|| {
                let mut table = DataTable::from_collection(collection, &style.key_property);
                table.append_rows(orphan_rows);
                table
            }),
        })
    }
}
