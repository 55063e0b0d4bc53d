//! Standalone Leaflet map page: the filtered sections drawn over one of the
//! four basemaps, with optional section labels and a manzanas overlay. The
//! page is a single self-contained HTML file, written to the export dir and
//! served as the root page in `serve` mode.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::color;
use crate::config::{Basemap, MapConfig};
use crate::export;
use crate::geometry;
use crate::processing;
use crate::types::{FieldKey, Layer, SectionColumns};

/// Display name, tile URL template and attribution per basemap.
pub fn basemap_tiles(basemap: Basemap) -> (&'static str, &'static str, &'static str) {
    match basemap {
        Basemap::EsriRelief => (
            "Relieve (Esri)",
            "https://server.arcgisonline.com/ArcGIS/rest/services/World_Shaded_Relief/MapServer/tile/{z}/{y}/{x}",
            "Tiles © Esri",
        ),
        Basemap::OpenTopo => (
            "Topográfico (OpenTopoMap)",
            "https://{s}.tile.opentopomap.org/{z}/{x}/{y}.png",
            "© OpenTopoMap / © OpenStreetMap contributors",
        ),
        Basemap::Osm => (
            "Calles (OSM)",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            "© OpenStreetMap contributors",
        ),
        Basemap::EsriImagery => (
            "Satélite (Esri)",
            "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}",
            "Tiles © Esri",
        ),
    }
}

/// Render the map page. Blocks are drawn only when the config asks for them,
/// sampled down to `max_blocks` like the KMZ folder.
pub fn map_page(
    sections: &Layer,
    cols: &SectionColumns,
    blocks: Option<&Layer>,
    map: &MapConfig,
    max_blocks: usize,
) -> Result<String> {
    let bounds =
        geometry::layer_bounds(&sections.features).context("sections layer has no geometry")?;
    let center_lat = (bounds.min().y + bounds.max().y) / 2.0;
    let center_lon = (bounds.min().x + bounds.max().x) / 2.0;

    let section_col = cols.section.as_deref();
    let sections_fc = export::feature_collection(sections, |feature| {
        let fill = section_col
            .and_then(|col| feature.key(col))
            .unwrap_or(FieldKey::Num(0));
        vec![(
            "_fill".to_string(),
            Value::String(color::to_hex(color::section_color(&fill))),
        )]
    });

    let blocks_json = match blocks {
        Some(layer) if map.show_blocks => {
            let indices = processing::sampled_indices(layer.len(), max_blocks);
            let sampled = Layer {
                name: layer.name.clone(),
                columns: layer.columns.clone(),
                features: indices.iter().map(|&i| layer.features[i].clone()).collect(),
            };
            serde_json::to_string(&export::feature_collection(&sampled, |_| Vec::new()))?
        }
        _ => "null".to_string(),
    };

    let labels: Vec<Value> = if map.show_labels {
        section_col
            .map(|col| {
                sections
                    .features
                    .iter()
                    .filter_map(|feature| {
                        let key = feature.key(col)?;
                        let (lon, lat) = geometry::interior_point(&feature.geometry)?;
                        Some(json!({ "lat": lat, "lon": lon, "text": key.to_string() }))
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let tooltip_fields: Vec<Value> = [
        (&cols.section, "Sección:"),
        (&cols.district_local, "DL:"),
        (&cols.district_federal, "DF:"),
        (&cols.municipality, "Mpio:"),
        (&cols.block_count, "Manzanas:"),
        (&cols.voters, "Votantes:"),
        (&cols.pop18, "POB18+:"),
    ]
    .iter()
    .filter_map(|(column, alias)| {
        column.as_ref().map(|c| json!([c, alias]))
    })
    .collect();

    let (basemap_name, tile_url, tile_attr) = basemap_tiles(map.basemap);

    Ok(MAP_PAGE
        .replace("__LABEL_SIZE__", &map.label_size_px.to_string())
        .replace("__BASEMAP_NAME__", basemap_name)
        .replace("__TILE_URL__", tile_url)
        .replace("__TILE_ATTR__", tile_attr)
        .replace("__CENTER__", &json!([center_lat, center_lon]).to_string())
        .replace(
            "__BOUNDS__",
            &json!([
                [bounds.min().y, bounds.min().x],
                [bounds.max().y, bounds.max().x]
            ])
            .to_string(),
        )
        .replace("__SECTIONS__", &serde_json::to_string(&sections_fc)?)
        .replace("__BLOCKS__", &blocks_json)
        .replace("__LABELS__", &Value::Array(labels).to_string())
        .replace(
            "__TOOLTIP_FIELDS__",
            &Value::Array(tooltip_fields).to_string(),
        ))
}

const MAP_PAGE: &str = r##"<!DOCTYPE html>
<html lang="es">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Secciones — mapa filtrado</title>
<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/leaflet@1.9.4/dist/leaflet.css">
<script src="https://cdn.jsdelivr.net/npm/leaflet@1.9.4/dist/leaflet.js"></script>
<style>
  html, body { height: 100%; margin: 0; }
  #map { height: 100%; width: 100%; }
  .section-label {
    font-size: __LABEL_SIZE__px;
    font-weight: 700;
    color: #111;
    background: rgba(255,255,255,0.70);
    border: 1px solid rgba(0,0,0,0.35);
    border-radius: 6px;
    padding: 1px 6px;
    line-height: 1.1;
    white-space: nowrap;
    width: max-content;
  }
</style>
</head>
<body>
<div id="map"></div>
<script>
var sections = __SECTIONS__;
var blocks = __BLOCKS__;
var labels = __LABELS__;
var tooltipFields = __TOOLTIP_FIELDS__;

var map = L.map('map', { center: __CENTER__, zoom: 12 });
L.control.scale().addTo(map);

var basemap = L.tileLayer('__TILE_URL__', {
  attribution: '__TILE_ATTR__',
  maxZoom: 19
}).addTo(map);

function sectionStyle(feature) {
  return {
    color: '#000000',
    weight: 2,
    fillColor: feature.properties._fill || '#999999',
    fillOpacity: 0.35
  };
}

function sectionTooltip(feature, layer) {
  var rows = [];
  tooltipFields.forEach(function (pair) {
    var value = feature.properties[pair[0]];
    if (value !== undefined && value !== null) {
      rows.push('<b>' + pair[1] + '</b> ' + value);
    }
  });
  if (rows.length) {
    layer.bindTooltip(rows.join('<br>'), { sticky: false });
  }
}

var sectionLayer = L.geoJSON(sections, {
  style: sectionStyle,
  onEachFeature: sectionTooltip
}).addTo(map);

var overlays = { 'Secciones': sectionLayer };

if (blocks) {
  overlays['Manzanas'] = L.geoJSON(blocks, {
    style: function () { return { weight: 1, fillOpacity: 0.04 }; }
  }).addTo(map);
}

labels.forEach(function (item) {
  L.marker([item.lat, item.lon], {
    icon: L.divIcon({
      className: '',
      html: '<div class="section-label">' + item.text + '</div>'
    }),
    interactive: false
  }).addTo(map);
});

var baseLayers = {};
baseLayers['__BASEMAP_NAME__'] = basemap;
L.control.layers(baseLayers, overlays, { collapsed: false }).addTo(map);

map.fitBounds(__BOUNDS__);
</script>
</body>
</html>
"##;
