//! End-to-end run: load, join, simplify, write, then publish one way or the other.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{AppConfig, Credentials, PublishMode};
use crate::data;
use crate::error::PipelineError;
use crate::export;
use crate::join::{self, JoinOptions, JoinReport};
use crate::page::{self, PageOptions};
use crate::publish::{DirectRender, HostedPublisher, HostedTarget, UploadReceipt};
use crate::simplify::{SimplifyOptions, SimplifyReport, Simplifier};
use crate::style::RenderStyle;
use crate::tiles::{self, PackageReport, PackageRequest};
use crate::types::{AttributeRow, FeatureCollection};

/// The joined and simplified collection, ready for output.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub collection: FeatureCollection,
    pub join: JoinReport,
    pub simplify: SimplifyReport,
    /// Attribute rows with no county under the outer policy. Tabulated, never drawn.
    pub orphan_rows: Vec<AttributeRow>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub join: JoinReport,
    /// Features removed by the join policy.
    pub dropped: usize,
    pub simplify: SimplifyReport,
    pub features: usize,
    pub geojson: PathBuf,
    pub archive: Option<PackageReport>,
    pub upload: Option<UploadReceipt>,
    pub html: Option<PathBuf>,
}

pub struct Pipeline {
    config: AppConfig,
    credentials: Credentials,
}

impl Pipeline {
    pub fn new(config: AppConfig, credentials: Credentials) -> Self {
        Self { config, credentials }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Load both inputs, join them and simplify the result.
    pub fn prepare(&self) -> Result<Prepared> {
        let input = &self.config.input;
        info!("loading geometry");
        let geometry = data::load_geometry(&input.geometry, input.key_width)?;
        info!("loading attributes");
        let table = data::load_attributes(&input.attributes, input.key_width, &self.credentials)?;

        let options = JoinOptions { policy: self.config.join.policy, duplicates: self.config.join.duplicates };
        let joined = join::join(geometry, table, &options)?;
        if !joined.orphan_rows.is_empty() {
            warn!(rows = joined.orphan_rows.len(), "attribute rows without geometry go to the table only");
        }
        joined.collection.ensure_not_empty("join")?;

        let simplifier = Simplifier::new(SimplifyOptions {
            tolerance: self.config.simplify.tolerance,
            algorithm: self.config.simplify.algorithm,
        });
        let (collection, simplify) = simplifier.simplify(joined.collection);
        Ok(Prepared { collection, join: joined.report, simplify, orphan_rows: joined.orphan_rows })
    }

    pub fn run(&self) -> Result<PipelineReport> {
        if self.config.publish.mode == PublishMode::Hosted {
            self.hosted_page_token()?;
        }
        let prepared = self.prepare()?;
        let geojson = self.config.output.geojson_path();
        export::write_geojson(&prepared.collection, &self.config.output.key_property, &geojson)?;

        let mut report = PipelineReport {
            dropped: prepared.join.dropped_features(self.config.join.policy),
            join: prepared.join.clone(),
            simplify: prepared.simplify,
            features: prepared.collection.len(),
            geojson,
            archive: None,
            upload: None,
            html: None,
        };

        match self.config.publish.mode {
            PublishMode::Hosted => {
                let archive = self.package(&prepared.collection, &report.geojson)?;
                let receipt = self.publish(&archive.output)?;
                report.html = self.write_hosted_page()?;
                report.archive = Some(archive);
                report.upload = Some(receipt);
            }
            PublishMode::Direct => {
                report.html = Some(self.render(&prepared, &self.config.output.html_path())?);
            }
        }

        info!(
            features = report.features,
            dropped = report.dropped,
            geojson = %report.geojson.display(),
            "pipeline finished"
        );
        Ok(report)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.config.output.dir.join(&self.config.tiles.archive)
    }

    /// Package the written GeoJSON into the configured tile archive.
    pub fn package(&self, collection: &FeatureCollection, geojson: &Path) -> Result<PackageReport> {
        collection.ensure_not_empty("publish")?;
        let tiles = &self.config.tiles;
        let packager = tiles::packager_for(tiles);
        let request = PackageRequest {
            input: geojson.to_path_buf(),
            output: self.archive_path(),
            layer: tiles.layer.clone(),
            key_property: self.config.output.key_property.clone(),
            min_zoom: tiles.min_zoom,
            max_zoom: tiles.max_zoom,
        };
        info!(packager = packager.name(), "packaging tiles");
        packager.package(&request)
    }

    pub fn publish(&self, archive: &Path) -> Result<UploadReceipt> {
        let publish = &self.config.publish;
        let target = HostedTarget {
            api_base: publish.api_base.clone(),
            account: publish.account.clone(),
            tileset: publish.tileset.clone(),
        };
        if target.account.is_empty() || target.tileset.is_empty() {
            anyhow::bail!("publish.account and publish.tileset are required in hosted mode");
        }
        HostedPublisher::new(target, &self.credentials)?.publish(archive)
    }

    pub fn render_style(&self) -> Result<RenderStyle> {
        let mut style = RenderStyle::from_config(&self.config.render).context("resolve render style")?;
        style.key_property = self.config.output.key_property.clone();
        Ok(style)
    }

    /// Write the direct-render page for a prepared collection.
    pub fn render(&self, prepared: &Prepared, path: &Path) -> Result<PathBuf> {
        let doc = DirectRender::build_with_orphans(&prepared.collection, &prepared.orphan_rows, &self.render_style()?)?;
        doc.write_html(path)?;
        Ok(path.to_path_buf())
    }

    /// The public token the hosted page needs, or `None` when no style is configured.
    fn hosted_page_token(&self) -> Result<Option<&str>, PipelineError> {
        if self.config.publish.style_url.is_none() {
            return Ok(None);
        }
        self.credentials
            .public_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(Some)
            .ok_or_else(|| PipelineError::MissingCredential("public map token".into()))
    }

    /// Write the hosted-style page when a style is configured.
    fn write_hosted_page(&self) -> Result<Option<PathBuf>> {
        let (Some(style_url), Some(token)) = (&self.config.publish.style_url, self.hosted_page_token()?) else {
            info!("no hosted style configured, skipping page");
            return Ok(None);
        };
        let title = self.config.render.title.clone().unwrap_or_else(|| self.config.render.column.clone());
        let html = page::render_hosted(style_url, token, &PageOptions { title, ..PageOptions::default() })?;

        let path = self.config.output.html_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::write(&path, html).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "wrote hosted map page");
        Ok(Some(path))
    }
}
