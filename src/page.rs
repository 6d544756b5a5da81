//! Self-contained HTML pages for the two presentation variants.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::publish::MapDocument;

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub title: String,
    pub show_table: bool,
    /// Initial view as `[lat, lon]`; the direct page fits its data instead.
    pub center: [f64; 2],
    pub zoom: f64,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self { title: "County map".into(), show_table: true, center: [39.5, -98.35], zoom: 3.0 }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// JSON safe to inline in a `<script>` element.
fn script_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value).context("serialize page data")?;
    Ok(json.replace("</", "<\\/").replace("<!--", "<\\!--"))
}

pub fn render_direct(doc: &MapDocument, options: &PageOptions) -> Result<String> {
    let table = if options.show_table && doc.table.is_some() { TABLE_HTML } else { "" };
    Ok(DIRECT_TEMPLATE
        .replace("__TITLE__", &escape_html(&options.title))
        .replace("__TABLE__", table)
        .replace("__DOC__", &script_json(doc)?))
}

#[derive(Serialize)]
struct HostedSettings<'a> {
    style: &'a str,
    token: &'a str,
    center: [f64; 2],
    zoom: f64,
}

/// A Mapbox GL page showing the hosted style. The style URL is passed through untouched.
pub fn render_hosted(style_url: &str, public_token: &str, options: &PageOptions) -> Result<String> {
    let settings = HostedSettings {
        style: style_url,
        token: public_token,
        center: [options.center[1], options.center[0]],
        zoom: options.zoom,
    };
    Ok(HOSTED_TEMPLATE
        .replace("__TITLE__", &escape_html(&options.title))
        .replace("__SETTINGS__", &script_json(&settings)?))
}

const DIRECT_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>__TITLE__</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>
  body { margin: 0; font-family: sans-serif; }
  h1 { font-size: 1.2em; margin: 0.5em 1em; }
  #map { height: 70vh; }
  .legend { background: #fff; padding: 6px 8px; border-radius: 4px; line-height: 18px; }
  .legend i { width: 18px; height: 14px; float: left; margin-right: 6px; opacity: 0.9; }
  #table-panel { padding: 0.5em 1em; }
  #table-panel table { border-collapse: collapse; width: 100%; font-size: 0.85em; }
  #table-panel th { cursor: pointer; background: #eee; text-align: left; }
  #table-panel th, #table-panel td { border: 1px solid #ddd; padding: 2px 6px; }
</style>
</head>
<body>
<h1>__TITLE__</h1>
<div id="map"></div>
__TABLE__
<script>
const doc = __DOC__;
const map = L.map('map', { crs: L.CRS[doc.crs] });
if (doc.projection === 'web_mercator') {
  L.tileLayer('https://tile.openstreetmap.org/{z}/{x}/{y}.png', {
    maxZoom: 12,
    attribution: '&copy; OpenStreetMap contributors'
  }).addTo(map);
}

function baseStyle(feature) {
  return {
    fillColor: feature.properties._fill,
    fillOpacity: doc.fill_opacity,
    color: doc.stroke.color,
    weight: doc.stroke.width,
    opacity: doc.stroke.opacity
  };
}

const layer = L.geoJSON(doc.features, {
  style: baseStyle,
  onEachFeature: (feature, l) => {
    const tip = document.createElement('span');
    tip.textContent = feature.properties._tooltip;
    l.bindTooltip(tip, { sticky: true });
    l.on({
      mouseover: e => {
        e.target.setStyle({ color: doc.hover.color, weight: doc.hover.width, opacity: doc.hover.opacity });
        e.target.bringToFront();
      },
      mouseout: e => layer.resetStyle(e.target)
    });
  }
}).addTo(map);

if (doc.bounds) {
  map.fitBounds([[doc.bounds[1], doc.bounds[0]], [doc.bounds[3], doc.bounds[2]]]);
} else {
  map.setView([39.5, -98.35], 3);
}

const legend = L.control({ position: 'bottomright' });
legend.onAdd = () => {
  const div = L.DomUtil.create('div', 'legend');
  const rows = doc.legend.entries.concat([doc.legend.missing]);
  div.innerHTML = '<strong></strong><br>' + rows.map(() => '<i></i><span></span><br>').join('');
  div.querySelector('strong').textContent = doc.legend.title;
  div.querySelectorAll('i').forEach((el, i) => { el.style.background = rows[i].color; });
  div.querySelectorAll('span').forEach((el, i) => { el.textContent = rows[i].label; });
  return div;
};
legend.addTo(map);

if (doc.table && document.getElementById('table-panel')) {
  const columns = doc.table.columns;
  let rows = doc.table.rows.slice();
  let sortCol = -1;
  let sortAsc = true;
  const filter = document.getElementById('table-filter');
  const thead = document.querySelector('#data-table thead');
  const tbody = document.querySelector('#data-table tbody');

  const cellText = v => v === null || v === undefined ? '' : String(v);
  const visibleRows = () => {
    const needle = filter.value.trim().toLowerCase();
    if (!needle) return rows;
    return rows.filter(r => r.some(v => cellText(v).toLowerCase().includes(needle)));
  };

  function draw() {
    tbody.innerHTML = '';
    for (const r of visibleRows()) {
      const tr = document.createElement('tr');
      for (const v of r) {
        const td = document.createElement('td');
        td.textContent = cellText(v);
        tr.appendChild(td);
      }
      tbody.appendChild(tr);
    }
  }

  const headRow = document.createElement('tr');
  columns.forEach((name, i) => {
    const th = document.createElement('th');
    th.textContent = name;
    th.addEventListener('click', () => {
      sortAsc = sortCol === i ? !sortAsc : true;
      sortCol = i;
      rows.sort((a, b) => {
        const x = a[i], y = b[i];
        if (x === y) return 0;
        if (x === null) return 1;
        if (y === null) return -1;
        const cmp = typeof x === 'number' && typeof y === 'number' ? x - y : cellText(x).localeCompare(cellText(y));
        return sortAsc ? cmp : -cmp;
      });
      draw();
    });
    headRow.appendChild(th);
  });
  thead.appendChild(headRow);
  filter.addEventListener('input', draw);

  document.getElementById('table-export').addEventListener('click', () => {
    const quote = v => {
      const s = cellText(v);
      return /[",\n]/.test(s) ? '"' + s.replace(/"/g, '""') + '"' : s;
    };
    const lines = [columns.map(quote).join(',')].concat(visibleRows().map(r => r.map(quote).join(',')));
    const blob = new Blob([lines.join('\n') + '\n'], { type: 'text/csv' });
    const a = document.createElement('a');
    a.href = URL.createObjectURL(blob);
    a.download = 'counties.csv';
    a.click();
    URL.revokeObjectURL(a.href);
  });
  draw();
}
</script>
</body>
</html>
"##;

const TABLE_HTML: &str = r#"<div id="table-panel">
  <input id="table-filter" type="search" placeholder="Filter rows">
  <button id="table-export" type="button">Export CSV</button>
  <table id="data-table"><thead></thead><tbody></tbody></table>
</div>"#;

const HOSTED_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>__TITLE__</title>
<link rel="stylesheet" href="https://api.mapbox.com/mapbox-gl-js/v3.4.0/mapbox-gl.css">
<script src="https://api.mapbox.com/mapbox-gl-js/v3.4.0/mapbox-gl.js"></script>
<style>
  body { margin: 0; font-family: sans-serif; }
  #map { position: absolute; top: 0; bottom: 0; width: 100%; }
</style>
</head>
<body>
<div id="map"></div>
<script>
const settings = __SETTINGS__;
mapboxgl.accessToken = settings.token;
const map = new mapboxgl.Map({
  container: 'map',
  style: settings.style,
  center: settings.center,
  zoom: settings.zoom
});
map.addControl(new mapboxgl.NavigationControl());
</script>
</body>
</html>
"#;
