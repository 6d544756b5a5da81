//! Choropleth styling: palettes, the numeric color scale, legends, value
//! formatting and per-feature tooltip templates.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::RenderConfig;
use crate::types::{AttrValue, County};

/// Simple RGB color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb` (leading `#` optional).
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(anyhow!("invalid hex color '{}'", hex));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|e| anyhow!("invalid hex color '{}': {}", hex, e))
        };
        Ok(Rgb { r: channel(0..2)?, g: channel(2..4)?, b: channel(4..6)? })
    }

    fn lerp(self, other: Rgb, t: f64) -> Rgb {
        let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round().clamp(0.0, 255.0) as u8;
        Rgb { r: mix(self.r, other.r), g: mix(self.g, other.g), b: mix(self.b, other.b) }
    }
}

impl fmt::Display for Rgb {
    /// Format as CSS hex: #rrggbb
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for Rgb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedPalette {
    #[default]
    Blues,
    Greens,
    Reds,
    Viridis,
    Magma,
}

impl NamedPalette {
    pub fn stops(&self) -> &'static [Rgb] {
        const BLUES: &[Rgb] = &[
            Rgb::new(0xef, 0xf3, 0xff),
            Rgb::new(0xbd, 0xd7, 0xe7),
            Rgb::new(0x6b, 0xae, 0xd6),
            Rgb::new(0x31, 0x82, 0xbd),
            Rgb::new(0x08, 0x51, 0x9c),
        ];
        const GREENS: &[Rgb] = &[
            Rgb::new(0xed, 0xf8, 0xe9),
            Rgb::new(0xba, 0xe4, 0xb3),
            Rgb::new(0x74, 0xc4, 0x76),
            Rgb::new(0x31, 0xa3, 0x54),
            Rgb::new(0x00, 0x6d, 0x2c),
        ];
        const REDS: &[Rgb] = &[
            Rgb::new(0xfe, 0xe5, 0xd9),
            Rgb::new(0xfc, 0xae, 0x91),
            Rgb::new(0xfb, 0x6a, 0x4a),
            Rgb::new(0xde, 0x2d, 0x26),
            Rgb::new(0xa5, 0x0f, 0x15),
        ];
        const VIRIDIS: &[Rgb] = &[
            Rgb::new(0x44, 0x01, 0x54),
            Rgb::new(0x3b, 0x52, 0x8b),
            Rgb::new(0x21, 0x91, 0x8c),
            Rgb::new(0x5e, 0xc9, 0x62),
            Rgb::new(0xfd, 0xe7, 0x25),
        ];
        const MAGMA: &[Rgb] = &[
            Rgb::new(0x00, 0x00, 0x04),
            Rgb::new(0x51, 0x12, 0x7c),
            Rgb::new(0xb7, 0x37, 0x79),
            Rgb::new(0xfc, 0x89, 0x61),
            Rgb::new(0xfc, 0xfd, 0xbf),
        ];
        match self {
            NamedPalette::Blues => BLUES,
            NamedPalette::Greens => GREENS,
            NamedPalette::Reds => REDS,
            NamedPalette::Viridis => VIRIDIS,
            NamedPalette::Magma => MAGMA,
        }
    }
}

/// A named palette, or a list of `#rrggbb` stops.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Palette {
    Named(NamedPalette),
    Custom(Vec<String>),
}

impl Default for Palette {
    fn default() -> Self {
        Palette::Named(NamedPalette::default())
    }
}

impl Palette {
    pub fn stops(&self) -> Result<Vec<Rgb>> {
        let stops = match self {
            Palette::Named(named) => named.stops().to_vec(),
            Palette::Custom(hexes) => hexes.iter().map(|h| Rgb::from_hex(h)).collect::<Result<Vec<_>>>()?,
        };
        if stops.len() < 2 {
            return Err(anyhow!("a palette needs at least two colors"));
        }
        Ok(stops)
    }
}

/// Linear numeric color scale over a palette.
#[derive(Debug, Clone)]
pub struct ColorScale {
    stops: Vec<Rgb>,
    min: f64,
    max: f64,
}

impl ColorScale {
    pub fn new(stops: Vec<Rgb>, min: f64, max: f64) -> Self {
        Self { stops, min, max }
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Position of `value` on the scale, clamped to [0, 1].
    pub fn position(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if !(span > 0.0) {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }

    /// Color for a finite value; `None` for NaN or infinities.
    pub fn color(&self, value: f64) -> Option<Rgb> {
        if !value.is_finite() {
            return None;
        }
        if self.stops.len() < 2 {
            return self.stops.first().copied();
        }
        let scaled = self.position(value) * (self.stops.len() - 1) as f64;
        let lower = (scaled.floor() as usize).min(self.stops.len() - 2);
        Some(self.stops[lower].lerp(self.stops[lower + 1], scaled - lower as f64))
    }
}

/// How numbers are printed in legends and tooltips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum ValueFormat {
    #[default]
    Plain,
    Integer,
    Thousands,
    Currency,
    Percent,
    Decimal(usize),
}

impl FromStr for ValueFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "plain" => Ok(ValueFormat::Plain),
            "integer" => Ok(ValueFormat::Integer),
            "thousands" => Ok(ValueFormat::Thousands),
            "currency" => Ok(ValueFormat::Currency),
            "percent" => Ok(ValueFormat::Percent),
            _ => {
                let digits = s
                    .strip_prefix("decimal(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('.'))
                    .ok_or_else(|| anyhow!("unknown value format '{}'", s))?;
                let places = digits.parse().map_err(|_| anyhow!("invalid decimal places in '{}'", s))?;
                Ok(ValueFormat::Decimal(places))
            }
        }
    }
}

impl TryFrom<String> for ValueFormat {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl ValueFormat {
    pub fn format(&self, value: f64) -> String {
        if !value.is_finite() {
            return MISSING_LABEL.to_string();
        }
        match self {
            ValueFormat::Plain => format!("{}", value),
            ValueFormat::Integer => format!("{:.0}", value),
            ValueFormat::Thousands => group_thousands(value.round()),
            ValueFormat::Currency => {
                let grouped = group_thousands(value.round().abs());
                if value.round() < 0.0 { format!("-${}", grouped) } else { format!("${}", grouped) }
            }
            ValueFormat::Percent => format!("{:.1}%", value * 100.0),
            ValueFormat::Decimal(places) => format!("{:.*}", places, value),
        }
    }

    pub fn format_attr(&self, value: &AttrValue) -> String {
        match value {
            AttrValue::Number(n) => self.format(*n),
            AttrValue::Text(s) => s.clone(),
            AttrValue::Missing => MISSING_LABEL.to_string(),
        }
    }
}

const MISSING_LABEL: &str = "n/a";

fn group_thousands(value: f64) -> String {
    let digits = format!("{:.0}", value.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0.0 && digits.chars().any(|c| c != '0') {
        grouped.insert(0, '-');
    }
    grouped
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendEntry {
    pub label: String,
    pub color: Rgb,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Legend {
    pub title: String,
    pub entries: Vec<LegendEntry>,
    pub missing: LegendEntry,
}

impl Legend {
    /// Evenly spaced entries from the scale's minimum to its maximum.
    pub fn build(title: &str, scale: &ColorScale, steps: usize, format: ValueFormat, missing: Rgb) -> Self {
        let steps = steps.max(2);
        let (min, max) = scale.domain();
        let entries = (0..steps)
            .map(|i| {
                let value = min + (max - min) * i as f64 / (steps - 1) as f64;
                LegendEntry {
                    label: format.format(value),
                    color: scale.color(value).unwrap_or(missing),
                }
            })
            .collect();
        Legend {
            title: title.to_string(),
            entries,
            missing: LegendEntry { label: MISSING_LABEL.to_string(), color: missing },
        }
    }
}

/// A tooltip template such as `"{NAME}: {value}"` or `"{B19013_001E:currency}"`.
///
/// `{id}` is the feature key and `{value}` is the styled column. `{{` and `}}`
/// are literal braces.
#[derive(Debug, Clone)]
pub struct Tooltip {
    template: String,
}

impl Tooltip {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn render(&self, county: &County, value_column: &str, value_format: ValueFormat) -> String {
        let mut out = String::with_capacity(self.template.len() + 16);
        let mut rest = self.template.as_str();
        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }
            match tail.find('}') {
                Some(end) => {
                    let placeholder = &tail[1..end];
                    match self.substitute(placeholder, county, value_column, value_format) {
                        Some(text) => out.push_str(&text),
                        None => out.push_str(&tail[..=end]),
                    }
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn substitute(&self, placeholder: &str, county: &County, value_column: &str, value_format: ValueFormat) -> Option<String> {
        let (name, format) = match placeholder.split_once(':') {
            Some((name, fmt)) => (name.trim(), Some(fmt.parse::<ValueFormat>().ok()?)),
            None => (placeholder.trim(), None),
        };
        if name == "id" {
            return Some(county.id.clone());
        }
        let (column, default_format) = if name == "value" {
            (value_column, value_format)
        } else {
            (name, ValueFormat::Plain)
        };
        let value = county.attribute(column)?;
        Some(format.unwrap_or(default_format).format_attr(value))
    }
}

/// Map projection, expressed as the browser widget's coordinate reference system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    WebMercator,
    Equirectangular,
}

impl Projection {
    pub fn leaflet_crs(&self) -> &'static str {
        match self {
            Projection::WebMercator => "EPSG3857",
            Projection::Equirectangular => "EPSG4326",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrokeStyle {
    pub color: Rgb,
    pub width: f64,
    pub opacity: f64,
}

const DEFAULT_KEY_PROPERTY: &str = "GEOID";

/// Resolved styling for the direct-render variant.
#[derive(Debug, Clone)]
pub struct RenderStyle {
    pub column: String,
    /// Property name the feature key is published under.
    pub key_property: String,
    pub title: String,
    pub stops: Vec<Rgb>,
    pub legend_title: String,
    pub legend_format: ValueFormat,
    pub legend_steps: usize,
    pub tooltip: Tooltip,
    pub stroke: StrokeStyle,
    pub hover: StrokeStyle,
    pub fill_opacity: f64,
    pub missing_color: Rgb,
    pub projection: Projection,
    pub table: bool,
}

impl RenderStyle {
    pub fn from_config(config: &RenderConfig) -> Result<Self> {
        let title = config.title.clone().unwrap_or_else(|| config.column.clone());
        Ok(Self {
            column: config.column.clone(),
            key_property: DEFAULT_KEY_PROPERTY.to_string(),
            legend_title: config.legend_title.clone().unwrap_or_else(|| title.clone()),
            title,
            stops: config.palette.stops()?,
            legend_format: config.legend_format,
            legend_steps: config.legend_steps,
            tooltip: Tooltip::new(config.tooltip.clone()),
            stroke: StrokeStyle {
                color: Rgb::from_hex(&config.stroke_color)?,
                width: config.stroke_width,
                opacity: config.stroke_opacity,
            },
            hover: StrokeStyle {
                color: Rgb::from_hex(&config.hover_color)?,
                width: config.hover_width,
                opacity: 1.0,
            },
            fill_opacity: config.fill_opacity,
            missing_color: Rgb::from_hex(&config.missing_color)?,
            projection: config.projection,
            table: config.table,
        })
    }

    /// Simple default styling for `column`, used by tests and library callers.
    pub fn for_column(column: &str) -> Self {
        Self {
            column: column.to_string(),
            key_property: DEFAULT_KEY_PROPERTY.to_string(),
            title: column.to_string(),
            stops: NamedPalette::Blues.stops().to_vec(),
            legend_title: column.to_string(),
            legend_format: ValueFormat::Plain,
            legend_steps: 5,
            tooltip: Tooltip::new("{id}: {value}"),
            stroke: StrokeStyle { color: Rgb::new(255, 255, 255), width: 0.5, opacity: 0.8 },
            hover: StrokeStyle { color: Rgb::new(0x33, 0x33, 0x33), width: 2.0, opacity: 1.0 },
            fill_opacity: 0.85,
            missing_color: Rgb::new(0xcc, 0xcc, 0xcc),
            projection: Projection::WebMercator,
            table: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::MultiPolygon;

    fn blues(min: f64, max: f64) -> ColorScale {
        ColorScale::new(NamedPalette::Blues.stops().to_vec(), min, max)
    }

    #[test]
    fn extremes_map_to_palette_ends() {
        let scale = blues(22_000.0, 140_000.0);
        assert_eq!(scale.color(22_000.0), Some(Rgb::new(0xef, 0xf3, 0xff)));
        assert_eq!(scale.color(140_000.0), Some(Rgb::new(0x08, 0x51, 0x9c)));
        // clamped outside the domain
        assert_eq!(scale.color(1.0), scale.color(22_000.0));
        assert_eq!(scale.color(1e9), scale.color(140_000.0));
        assert_eq!(scale.color(f64::NAN), None);
    }

    #[test]
    fn scale_is_monotonic_between_extremes() {
        let scale = blues(0.0, 100.0);
        let mut previous = scale.color(0.0).unwrap();
        for i in 1..=200 {
            let value = i as f64 * 0.5;
            let color = scale.color(value).unwrap();
            // every Blues channel darkens along the ramp
            assert!(color.r <= previous.r && color.g <= previous.g && color.b <= previous.b, "not monotonic at {}", value);
            assert!(scale.position(value) >= scale.position(value - 0.5));
            previous = color;
        }
    }

    #[test]
    fn degenerate_domain_uses_first_stop() {
        let scale = blues(5.0, 5.0);
        assert_eq!(scale.color(5.0), Some(Rgb::new(0xef, 0xf3, 0xff)));
    }

    #[test]
    fn hex_round_trip_and_custom_palette() {
        assert_eq!(Rgb::from_hex("#3182bd").unwrap().to_string(), "#3182bd");
        assert!(Rgb::from_hex("#31x2bd").is_err());
        let palette = Palette::Custom(vec!["#000000".into(), "#ffffff".into()]);
        let scale = ColorScale::new(palette.stops().unwrap(), 0.0, 1.0);
        assert_eq!(scale.color(0.5), Some(Rgb::new(128, 128, 128)));
        assert!(Palette::Custom(vec!["#000000".into()]).stops().is_err());
    }

    #[test]
    fn value_formats() {
        assert_eq!(ValueFormat::Thousands.format(1234567.4), "1,234,567");
        assert_eq!(ValueFormat::Currency.format(58_461.0), "$58,461");
        assert_eq!(ValueFormat::Currency.format(-1200.0), "-$1,200");
        assert_eq!(ValueFormat::Percent.format(0.1234), "12.3%");
        assert_eq!(ValueFormat::Integer.format(12.6), "13");
        assert_eq!(ValueFormat::Plain.format(0.25), "0.25");
        assert_eq!("decimal(2)".parse::<ValueFormat>().unwrap().format(3.14159), "3.14");
        assert_eq!(".1".parse::<ValueFormat>().unwrap(), ValueFormat::Decimal(1));
        assert!("fancy".parse::<ValueFormat>().is_err());
        assert_eq!(ValueFormat::Thousands.format(999.0), "999");
        assert_eq!(ValueFormat::Thousands.format(-1000.0), "-1,000");
    }

    #[test]
    fn tooltip_interpolates_per_feature() {
        let mut county = County::new("01001", MultiPolygon::new(vec![]));
        county.attributes.insert("NAME".into(), AttrValue::Text("Autauga".into()));
        county.attributes.insert("income".into(), AttrValue::Number(58786.0));
        county.attributes.insert("svi".into(), AttrValue::Missing);

        let tooltip = Tooltip::new("{NAME} ({id}): {value} | svi {svi} | {unknown} {{x}}");
        assert_eq!(
            tooltip.render(&county, "income", ValueFormat::Currency),
            "Autauga (01001): $58,786 | svi n/a | {unknown} {x}"
        );
        let explicit = Tooltip::new("{income:thousands}");
        assert_eq!(explicit.render(&county, "income", ValueFormat::Plain), "58,786");
    }

    #[test]
    fn legend_spans_domain() {
        let scale = blues(0.0, 100.0);
        let legend = Legend::build("Income", &scale, 3, ValueFormat::Integer, Rgb::new(1, 2, 3));
        let labels: Vec<_> = legend.entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["0", "50", "100"]);
        assert_eq!(legend.entries[0].color, scale.color(0.0).unwrap());
        assert_eq!(legend.entries[2].color, scale.color(100.0).unwrap());
        assert_eq!(legend.missing.label, "n/a");
    }
}
