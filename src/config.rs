use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

use crate::join::{DuplicateKeys, JoinPolicy};
use crate::simplify::SimplifyAlgorithm;
use crate::style::{Palette, Projection, ValueFormat};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub simplify: SimplifyConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub tiles: TilesConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    pub render: RenderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub geometry: GeometrySource,
    pub attributes: AttributeSource,
    /// Zero-pad purely numeric keys to this many digits (5 for county FIPS).
    #[serde(default = "default_key_width")]
    pub key_width: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometrySource {
    /// A local shapefile or GeoJSON FeatureCollection.
    File {
        path: PathBuf,
        key_column: String,
        /// Properties to keep as attributes; empty keeps all GeoJSON properties.
        #[serde(default = "default_properties")]
        properties: Vec<String>,
    },
    /// Census cartographic boundary file, downloaded on demand.
    Census {
        #[serde(default)]
        level: AreaLevel,
        #[serde(default)]
        resolution: Resolution,
        #[serde(default = "default_year")]
        year: u16,
        #[serde(default = "default_cache_dir")]
        cache_dir: PathBuf,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AreaLevel {
    #[default]
    County,
    State,
}

impl AreaLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AreaLevel::County => "county",
            AreaLevel::State => "state",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum Resolution {
    #[serde(rename = "500k")]
    Fine,
    #[default]
    #[serde(rename = "5m")]
    Medium,
    #[serde(rename = "20m")]
    Coarse,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Fine => "500k",
            Resolution::Medium => "5m",
            Resolution::Coarse => "20m",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeSource {
    Csv {
        path: PathBuf,
        key_column: String,
        /// Columns to keep; empty keeps every non-key column.
        #[serde(default)]
        columns: Vec<String>,
    },
    CensusApi {
        #[serde(default = "default_year")]
        year: u16,
        #[serde(default = "default_dataset")]
        dataset: String,
        variables: Vec<String>,
        /// Environment variable holding the Census API key, if any.
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct JoinConfig {
    #[serde(default)]
    pub policy: JoinPolicy,
    #[serde(default)]
    pub duplicates: DuplicateKeys,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimplifyConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub algorithm: SimplifyAlgorithm,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self { tolerance: default_tolerance(), algorithm: SimplifyAlgorithm::default() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Property name the key is written under in GeoJSON and tiles.
    #[serde(default = "default_key_property")]
    pub key_property: String,
    #[serde(default = "default_geojson_name")]
    pub geojson: String,
    #[serde(default = "default_html_name")]
    pub html: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            key_property: default_key_property(),
            geojson: default_geojson_name(),
            html: default_html_name(),
        }
    }
}

impl OutputConfig {
    pub fn geojson_path(&self) -> PathBuf {
        self.dir.join(&self.geojson)
    }

    pub fn html_path(&self) -> PathBuf {
        self.dir.join(&self.html)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackagerKind {
    Tippecanoe,
    #[default]
    Pmtiles,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TilesConfig {
    #[serde(default)]
    pub packager: PackagerKind,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(default = "default_archive_name")]
    pub archive: String,
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    #[serde(default = "default_tippecanoe")]
    pub tippecanoe_binary: PathBuf,
    #[serde(default)]
    pub tippecanoe_args: Vec<String>,
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            packager: PackagerKind::default(),
            layer: default_layer(),
            archive: default_archive_name(),
            min_zoom: 0,
            max_zoom: default_max_zoom(),
            tippecanoe_binary: default_tippecanoe(),
            tippecanoe_args: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Package tiles and upload them to the hosted tile service.
    Hosted,
    /// Render the joined collection directly in the browser widget.
    #[default]
    Direct,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    #[serde(default)]
    pub mode: PublishMode,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub tileset: String,
    /// Environment variable holding the secret upload token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Hosted style the presentation page references after upload.
    #[serde(default)]
    pub style_url: Option<String>,
    /// Environment variable holding the public token the page embeds.
    #[serde(default)]
    pub public_token_env: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            mode: PublishMode::default(),
            api_base: default_api_base(),
            account: String::new(),
            tileset: String::new(),
            token_env: default_token_env(),
            style_url: None,
            public_token_env: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    pub column: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub palette: Palette,
    #[serde(default)]
    pub legend_title: Option<String>,
    #[serde(default)]
    pub legend_format: ValueFormat,
    #[serde(default = "default_legend_steps")]
    pub legend_steps: usize,
    #[serde(default = "default_tooltip")]
    pub tooltip: String,
    #[serde(default = "default_stroke_color")]
    pub stroke_color: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default = "default_stroke_opacity")]
    pub stroke_opacity: f64,
    #[serde(default = "default_fill_opacity")]
    pub fill_opacity: f64,
    #[serde(default = "default_hover_color")]
    pub hover_color: String,
    #[serde(default = "default_hover_width")]
    pub hover_width: f64,
    #[serde(default = "default_missing_color")]
    pub missing_color: String,
    #[serde(default)]
    pub projection: Projection,
    #[serde(default = "default_true")]
    pub table: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Secrets resolved once at startup and handed to the stages that need them.
#[derive(Clone, Default)]
pub struct Credentials {
    pub tile_service_token: Option<String>,
    pub public_token: Option<String>,
    pub census_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("tile_service_token", &mask(&self.tile_service_token))
            .field("public_token", &mask(&self.public_token))
            .field("census_api_key", &mask(&self.census_api_key))
            .finish()
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Read every credential the config names from the process environment.
    pub fn credentials(&self) -> Credentials {
        self.credentials_from(|name| std::env::var(name).ok())
    }

    pub fn credentials_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Credentials {
        let census_api_key = match &self.input.attributes {
            AttributeSource::CensusApi { api_key_env: Some(name), .. } => lookup(name),
            _ => None,
        };
        Credentials {
            tile_service_token: lookup(&self.publish.token_env),
            public_token: self.publish.public_token_env.as_deref().and_then(&lookup),
            census_api_key,
        }
    }
}

fn default_key_width() -> Option<usize> { Some(5) }
fn default_properties() -> Vec<String> { vec!["NAME".to_string()] }
fn default_year() -> u16 { 2020 }
fn default_cache_dir() -> PathBuf { PathBuf::from("cache") }
fn default_dataset() -> String { "acs/acs5".to_string() }
fn default_tolerance() -> f64 { 0.005 }
fn default_key_property() -> String { "GEOID".to_string() }
fn default_geojson_name() -> String { "counties.geojson".to_string() }
fn default_html_name() -> String { "map.html".to_string() }
fn default_layer() -> String { "counties".to_string() }
fn default_archive_name() -> String { "counties.pmtiles".to_string() }
fn default_max_zoom() -> u8 { 8 }
fn default_tippecanoe() -> PathBuf { PathBuf::from("tippecanoe") }
fn default_api_base() -> String { "https://api.mapbox.com".to_string() }
fn default_token_env() -> String { "MAPBOX_ACCESS_TOKEN".to_string() }
fn default_legend_steps() -> usize { 5 }
fn default_tooltip() -> String { "{NAME}: {value}".to_string() }
fn default_stroke_color() -> String { "#ffffff".to_string() }
fn default_stroke_width() -> f64 { 0.5 }
fn default_stroke_opacity() -> f64 { 0.8 }
fn default_fill_opacity() -> f64 { 0.85 }
fn default_hover_color() -> String { "#333333".to_string() }
fn default_hover_width() -> f64 { 2.0 }
fn default_missing_color() -> String { "#cccccc".to_string() }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [input]
        geometry = { kind = "census", resolution = "20m", year = 2018 }
        attributes = { kind = "census_api", variables = ["B19013_001E"], api_key_env = "CENSUS_KEY" }

        [join]
        policy = "left"
        duplicates = "keep_first"

        [publish]
        mode = "hosted"
        account = "acme"
        tileset = "income"

        [render]
        column = "B19013_001E"
        palette = "viridis"
        legend_format = "currency"
    "#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        match &config.input.geometry {
            GeometrySource::Census { level, resolution, year, .. } => {
                assert_eq!(*level, AreaLevel::County);
                assert_eq!(*resolution, Resolution::Coarse);
                assert_eq!(*year, 2018);
            }
            other => panic!("unexpected geometry source {:?}", other),
        }
        assert_eq!(config.join.policy, JoinPolicy::Left);
        assert_eq!(config.join.duplicates, DuplicateKeys::KeepFirst);
        assert_eq!(config.publish.mode, PublishMode::Hosted);
        assert_eq!(config.tiles.packager, PackagerKind::Pmtiles);
        assert_eq!(config.tiles.layer, "counties");
        assert_eq!(config.simplify.tolerance, 0.005);
        assert_eq!(config.input.key_width, Some(5));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn credentials_come_from_named_variables() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let creds = config.credentials_from(|name| match name {
            "MAPBOX_ACCESS_TOKEN" => Some("sk.secret".to_string()),
            "CENSUS_KEY" => Some("census".to_string()),
            _ => None,
        });
        assert_eq!(creds.tile_service_token.as_deref(), Some("sk.secret"));
        assert_eq!(creds.census_api_key.as_deref(), Some("census"));
        assert!(creds.public_token.is_none());
        assert!(!format!("{:?}", creds).contains("sk.secret"));
    }
}
