//! Census downloads: cartographic boundary shapefiles and Data API tables.

use std::{collections::BTreeMap, fs::{self, File}, io::Write, path::{Path, PathBuf}, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::{AreaLevel, Resolution};
use crate::error::PipelineError;
use crate::types::{normalize_key, AttrValue, AttributeTable};

const USER_AGENT: &str = concat!("county-choropleth/", env!("CARGO_PKG_VERSION"));

/// Census annotation values (e.g. -666666666) mark cells with no estimate.
const CENSUS_SENTINEL_MAX: f64 = -555_555_555.0;

pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(300))
        .build()
        .context("build HTTP client")
}

/// Write-then-rename wrapper so an interrupted download never leaves a truncated file.
struct PendingWrite {
    target: PathBuf,
    tmp: NamedTempFile,
}

impl PendingWrite {
    fn open(target: &Path) -> Result<Self> {
        let parent = target.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        let tmp = NamedTempFile::new_in(parent).context("create temp file")?;
        Ok(Self { target: target.to_path_buf(), tmp })
    }

    fn finalize(self) -> Result<()> {
        self.tmp.as_file().sync_all().ok();
        self.tmp
            .persist(&self.target)
            .with_context(|| format!("rename to {}", self.target.display()))?;
        Ok(())
    }
}

impl Write for PendingWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tmp.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.tmp.flush()
    }
}

/// Download `url` to `out_path` through a temp file in the same directory.
pub fn download_file(url: &str, out_path: &Path) -> Result<()> {
    let mut sink = PendingWrite::open(out_path)?;
    let mut resp = client()?
        .get(url)
        .send()
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url} returned error status"))?;
    std::io::copy(&mut resp, &mut sink).with_context(|| format!("write {}", out_path.display()))?;
    sink.finalize()
}

/// File stem of a cartographic boundary release, e.g. `cb_2020_us_county_5m`.
pub fn boundary_stem(level: AreaLevel, resolution: Resolution, year: u16) -> String {
    format!("cb_{}_us_{}_{}", year, level.as_str(), resolution.as_str())
}

pub fn boundary_url(level: AreaLevel, resolution: Resolution, year: u16) -> String {
    format!(
        "https://www2.census.gov/geo/tiger/GENZ{}/shp/{}.zip",
        year,
        boundary_stem(level, resolution, year)
    )
}

/// Fetch (or reuse from `cache_dir`) a boundary shapefile and return the `.shp` path.
pub fn fetch_boundaries(level: AreaLevel, resolution: Resolution, year: u16, cache_dir: &Path) -> Result<PathBuf> {
    let stem = boundary_stem(level, resolution, year);
    let zip_path = cache_dir.join(format!("{stem}.zip"));
    let extract_dir = cache_dir.join(&stem);
    let shp_path = extract_dir.join(format!("{stem}.shp"));

    if shp_path.exists() {
        debug!(path = %shp_path.display(), "using cached boundaries");
        return Ok(shp_path);
    }

    if !zip_path.exists() {
        let url = boundary_url(level, resolution, year);
        info!(%url, "downloading boundaries");
        download_file(&url, &zip_path)?;
    }

    extract_zip(&zip_path, &extract_dir)?;
    if !shp_path.exists() {
        bail!("archive {} did not contain {}", zip_path.display(), shp_path.display());
    }
    Ok(shp_path)
}

fn extract_zip(zip_path: &Path, out_dir: &Path) -> Result<()> {
    let file = File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).with_context(|| format!("read zip {}", zip_path.display()))?;
    fs::create_dir_all(out_dir).with_context(|| format!("create dir {}", out_dir.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else { continue };
        let Some(file_name) = name.file_name() else { continue };
        if entry.is_dir() {
            continue;
        }
        let out_path = out_dir.join(file_name);
        let mut out = File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out).with_context(|| format!("extract {}", out_path.display()))?;
    }
    Ok(())
}

pub fn census_api_url(year: u16, dataset: &str, variables: &[String], api_key: Option<&str>) -> String {
    let mut url = format!(
        "https://api.census.gov/data/{}/{}?get=NAME,{}&for=county:*",
        year,
        dataset.trim_matches('/'),
        variables.join(",")
    );
    if let Some(key) = api_key {
        url.push_str("&key=");
        url.push_str(key);
    }
    url
}

/// Query the Census Data API for county-level `variables`.
pub fn fetch_census_table(
    year: u16,
    dataset: &str,
    variables: &[String],
    api_key: Option<&str>,
    key_width: Option<usize>,
) -> Result<AttributeTable> {
    if variables.is_empty() {
        bail!("census_api attribute source needs at least one variable");
    }
    let url = census_api_url(year, dataset, variables, api_key);
    info!(year, dataset, variables = ?variables, "querying Census Data API");
    let body = get_text(&url, &format!("census api {year}/{dataset}"))?;
    parse_census_response(&body, variables, key_width)
}

/// GET `url` as text. Errors name `what` and never carry the URL, which may hold a key.
pub(crate) fn get_text(url: &str, what: &str) -> Result<String> {
    client()?
        .get(url)
        .send()
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("GET {what}"))?
        .error_for_status()
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("{what} returned error status"))?
        .text()
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("read {what} response"))
}

/// Parse a Data API response: a JSON array of rows whose first row is the header.
pub fn parse_census_response(body: &str, variables: &[String], key_width: Option<usize>) -> Result<AttributeTable> {
    let rows: Vec<Vec<Option<String>>> = serde_json::from_str(body).context("parse census api response")?;
    let mut rows = rows.into_iter();
    let header: Vec<String> = rows
        .next()
        .ok_or_else(|| anyhow!("census api response has no header row"))?
        .into_iter()
        .map(|h| h.unwrap_or_default())
        .collect();

    let position = |column: &str| {
        header.iter().position(|h| h == column).ok_or_else(|| PipelineError::MissingColumn {
            column: column.to_string(),
            source_name: "census api response".into(),
        })
    };
    let state_idx = position("state")?;
    let county_idx = position("county")?;
    let name_idx = header.iter().position(|h| h == "NAME");
    let variable_idx = variables
        .iter()
        .map(|v| Ok((v.clone(), position(v)?)))
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let mut columns: Vec<String> = Vec::with_capacity(variables.len() + 1);
    if name_idx.is_some() {
        columns.push("NAME".to_string());
    }
    columns.extend(variables.iter().cloned());
    let mut table = AttributeTable::new("GEOID", columns);

    for row in rows {
        let cell = |idx: usize| row.get(idx).and_then(|c| c.as_deref());
        let (Some(state), Some(county)) = (cell(state_idx), cell(county_idx)) else { continue };
        let key = normalize_key(&format!("{state}{county}"), key_width);

        let mut values = BTreeMap::new();
        if let Some(idx) = name_idx {
            values.insert("NAME".to_string(), cell(idx).map_or(AttrValue::Missing, |n| AttrValue::Text(n.to_string())));
        }
        for (variable, idx) in &variable_idx {
            let value = match cell(*idx).map(AttrValue::parse) {
                Some(AttrValue::Number(n)) if n <= CENSUS_SENTINEL_MAX => AttrValue::Missing,
                Some(value) => value,
                None => AttrValue::Missing,
            };
            values.insert(variable.clone(), value);
        }
        table.push(key, values);
    }

    info!(rows = table.len(), "parsed census api table");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_urls() {
        assert_eq!(
            boundary_url(AreaLevel::County, Resolution::Medium, 2020),
            "https://www2.census.gov/geo/tiger/GENZ2020/shp/cb_2020_us_county_5m.zip"
        );
        assert_eq!(boundary_stem(AreaLevel::State, Resolution::Fine, 2018), "cb_2018_us_state_500k");
    }

    #[test]
    fn census_url_includes_key_only_when_given() {
        let vars = vec!["B19013_001E".to_string()];
        let url = census_api_url(2019, "acs/acs5", &vars, None);
        assert_eq!(url, "https://api.census.gov/data/2019/acs/acs5?get=NAME,B19013_001E&for=county:*");
        assert!(census_api_url(2019, "acs/acs5", &vars, Some("abc")).ends_with("&key=abc"));
    }

    #[test]
    fn parses_census_rows() {
        let body = r#"[
            ["NAME","B19013_001E","state","county"],
            ["Autauga County, Alabama","58786","01","001"],
            ["Kalawao County, Hawaii","-666666666","15","005"],
            ["Loving County, Texas",null,"48","301"]
        ]"#;
        let vars = vec!["B19013_001E".to_string()];
        let table = parse_census_response(body, &vars, Some(5)).unwrap();

        assert_eq!(table.key_column, "GEOID");
        assert_eq!(table.columns, vec!["NAME", "B19013_001E"]);
        let keys: Vec<_> = table.rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["01001", "15005", "48301"]);
        assert_eq!(table.rows[0].values["B19013_001E"], AttrValue::Number(58786.0));
        assert_eq!(table.rows[1].values["B19013_001E"], AttrValue::Missing);
        assert_eq!(table.rows[2].values["B19013_001E"], AttrValue::Missing);
        assert_eq!(table.rows[0].values["NAME"], AttrValue::Text("Autauga County, Alabama".into()));
    }

    #[test]
    fn missing_variable_is_reported() {
        let body = r#"[["NAME","state","county"],["x","01","001"]]"#;
        let err = parse_census_response(body, &["B01003_001E".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("B01003_001E"));
    }

    #[test]
    fn request_errors_do_not_echo_the_api_key() {
        let url = census_api_url(2019, "acs/acs5", &["B01003_001E".to_string()], Some("CENSUSKEY123"));
        let url = url.replace("https://api.census.gov", "http://127.0.0.1:9");
        let err = get_text(&url, "census api 2019/acs/acs5").unwrap_err();
        assert!(!format!("{err:?}").contains("CENSUSKEY123"), "{err:?}");
        assert!(!format!("{err:#}").contains("CENSUSKEY123"), "{err:#}");
        assert!(format!("{err:#}").contains("census api 2019/acs/acs5"));
    }

    #[test]
    fn cached_boundaries_are_reused() {
        let cache = tempfile::tempdir().unwrap();
        let stem = boundary_stem(AreaLevel::County, Resolution::Coarse, 2020);
        let shp = cache.path().join(&stem).join(format!("{stem}.shp"));
        fs::create_dir_all(shp.parent().unwrap()).unwrap();
        fs::write(&shp, b"cached").unwrap();

        let found = fetch_boundaries(AreaLevel::County, Resolution::Coarse, 2020, cache.path()).unwrap();
        assert_eq!(found, shp);
        assert_eq!(fs::read(&found).unwrap(), b"cached");
    }

    #[test]
    fn cached_archive_is_extracted_without_downloading() {
        let cache = tempfile::tempdir().unwrap();
        let stem = boundary_stem(AreaLevel::County, Resolution::Medium, 2019);
        let zip_path = cache.path().join(format!("{stem}.zip"));
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        for ext in ["shp", "shx", "dbf"] {
            zip.start_file(format!("{stem}.{ext}"), zip::write::SimpleFileOptions::default()).unwrap();
            zip.write_all(ext.as_bytes()).unwrap();
        }
        zip.finish().unwrap();

        let found = fetch_boundaries(AreaLevel::County, Resolution::Medium, 2019, cache.path()).unwrap();
        assert_eq!(found, cache.path().join(&stem).join(format!("{stem}.shp")));
        assert_eq!(fs::read(&found).unwrap(), b"shp");
        assert!(found.with_extension("dbf").exists());
    }
}
