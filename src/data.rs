//! Loading sections and blocks from shapefiles or GeoJSON into [`Layer`]s,
//! and figuring out which attribute columns play which role.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use geo::{MapCoords, MultiPolygon};
use geojson::GeoJson;
use rayon::prelude::*;
use shapefile::dbase::FieldValue;
use tracing::{info, warn};

use crate::config::FieldOverrides;
use crate::crs::CrsTransform;
use crate::types::{AttrValue, BlockColumns, Feature, Layer, SectionColumns};

const ENTITY_COLS: &[&str] = &["ENTIDAD", "CVE_ENT", "ENT"];
const MUNICIPALITY_COLS: &[&str] = &["MUNICIPIO", "CVE_MUN", "MUN"];
const DISTRICT_LOCAL_COLS: &[&str] = &["DISTRITO_L", "DISTRITO", "DTO_L", "DIST_L"];
const DISTRICT_FEDERAL_COLS: &[&str] = &["DISTRITO_F", "DTO_F", "DIST_F"];
const SECTION_COLS: &[&str] = &["SECCION", "SECC", "CVE_SECC", "ID_SECC"];
const BLOCK_COUNT_COLS: &[&str] = &["MANZANAS"];
const VOTERS_COLS: &[&str] = &["VOTANTES", "VOT_EST"];
const POP18_COLS: &[&str] = &["POB18MAS", "POB_18_MAS", "P18MAS"];

/// Load a polygon layer from a `.shp` or `.geojson` file. Coordinates come
/// out in WGS84 lon/lat; attribute names come out trimmed and uppercased.
pub fn load_vector_layer(path: &Path, name: &str) -> Result<Layer> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("{} has no file extension", path.display()))?;

    match extension.as_str() {
        "shp" => load_shapefile(path, name),
        "json" | "geojson" => load_geojson(path, name),
        other => Err(anyhow!("unsupported vector format: {other}")),
    }
}

fn load_shapefile(path: &Path, name: &str) -> Result<Layer> {
    let transform = read_projection(path);

    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("opening shapefile {}", path.display()))?;

    let mut features = Vec::new();
    let mut skipped = 0usize;
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.with_context(|| format!("reading {}", path.display()))?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(p) => p
                .try_into()
                .map_err(|e| anyhow!("converting polygon: {e:?}"))?,
            shapefile::Shape::PolygonM(p) => p
                .try_into()
                .map_err(|e| anyhow!("converting polygonM: {e:?}"))?,
            shapefile::Shape::PolygonZ(p) => p
                .try_into()
                .map_err(|e| anyhow!("converting polygonZ: {e:?}"))?,
            _ => {
                skipped += 1;
                continue;
            }
        };
        if geometry.0.is_empty() {
            skipped += 1;
            continue;
        }

        let mut attrs = BTreeMap::new();
        for (field, value) in record {
            attrs.insert(normalize_name(&field), attr_from_dbase(value));
        }
        features.push(Feature { geometry, attrs });
    }
    if skipped > 0 {
        warn!("{name}: skipped {skipped} records without polygon geometry");
    }

    if !transform.is_identity() {
        features.par_iter_mut().for_each(|feature| {
            feature.geometry = feature.geometry.map_coords(|c| {
                let (x, y) = transform.to_wgs84(c.x, c.y);
                geo::coord! { x: x, y: y }
            });
        });
    }

    let layer = assemble(name, features);
    info!(
        "{name}: {} features, {} columns from {}",
        layer.len(),
        layer.columns.len(),
        path.display()
    );
    Ok(layer)
}

fn load_geojson(path: &Path, name: &str) -> Result<Layer> {
    let file =
        File::open(path).with_context(|| format!("opening GeoJSON {}", path.display()))?;
    let geojson = GeoJson::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("{} is not a FeatureCollection", path.display())),
    };

    let mut features = Vec::new();
    for feature in collection.features {
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let geometry: geo::Geometry<f64> = geometry
            .value
            .try_into()
            .map_err(|e| anyhow!("converting GeoJSON geometry: {e:?}"))?;
        let geometry = match geometry {
            geo::Geometry::MultiPolygon(mp) => mp,
            geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            _ => continue,
        };
        if geometry.0.is_empty() {
            continue;
        }

        let mut attrs = BTreeMap::new();
        if let Some(props) = feature.properties {
            for (key, value) in props {
                attrs.insert(normalize_name(&key), attr_from_json(&value));
            }
        }
        features.push(Feature { geometry, attrs });
    }

    let layer = assemble(name, features);
    info!(
        "{name}: {} features, {} columns from {}",
        layer.len(),
        layer.columns.len(),
        path.display()
    );
    Ok(layer)
}

fn assemble(name: &str, features: Vec<Feature>) -> Layer {
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for feature in &features {
        columns.extend(feature.attrs.keys().cloned());
    }
    Layer {
        name: name.to_string(),
        columns: columns.into_iter().collect(),
        features,
    }
}

/// Read the sibling `.prj` into a coordinate transform. Missing or
/// unreadable projections degrade to the identity with a warning, matching
/// how far a run can usefully carry on with raw coordinates.
fn read_projection(shp_path: &Path) -> CrsTransform {
    let prj = shp_path.with_extension("prj");
    let raw = match fs::read(&prj) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(
                "no .prj next to {}, assuming coordinates are already lon/lat",
                shp_path.display()
            );
            return CrsTransform::Identity;
        }
    };
    match CrsTransform::from_prj(&String::from_utf8_lossy(&raw)) {
        Ok(transform) => transform,
        Err(err) => {
            warn!(
                "could not interpret {}: {err:#}; leaving coordinates untouched",
                prj.display()
            );
            CrsTransform::Identity
        }
    }
}

pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn attr_from_dbase(value: FieldValue) -> AttrValue {
    match value {
        FieldValue::Character(Some(s)) => text_attr(s),
        FieldValue::Numeric(Some(v)) => numeric_attr(v),
        FieldValue::Float(Some(v)) => numeric_attr(v as f64),
        FieldValue::Integer(v) => AttrValue::Int(v as i64),
        FieldValue::Double(v) => numeric_attr(v),
        FieldValue::Currency(v) => AttrValue::Float(v),
        FieldValue::Logical(Some(b)) => AttrValue::Bool(b),
        FieldValue::Memo(s) => text_attr(s),
        FieldValue::Date(Some(d)) => {
            AttrValue::Text(format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day()))
        }
        _ => AttrValue::Null,
    }
}

fn attr_from_json(value: &serde_json::Value) -> AttrValue {
    match value {
        serde_json::Value::Null => AttrValue::Null,
        serde_json::Value::Bool(b) => AttrValue::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(v) => AttrValue::Int(v),
            None => n.as_f64().map(AttrValue::Float).unwrap_or(AttrValue::Null),
        },
        serde_json::Value::String(s) => text_attr(s.clone()),
        other => AttrValue::Text(other.to_string()),
    }
}

fn text_attr(s: String) -> AttrValue {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        AttrValue::Null
    } else if trimmed.len() == s.len() {
        AttrValue::Text(s)
    } else {
        AttrValue::Text(trimmed.to_string())
    }
}

/// dBASE numerics carry whole numbers more often than not; keep them integers
/// so tables and keys don't grow spurious decimals.
fn numeric_attr(v: f64) -> AttrValue {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
        AttrValue::Int(v as i64)
    } else {
        AttrValue::Float(v)
    }
}

/// First candidate that exists as a column, exact match.
pub fn pick_col(layer: &Layer, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|c| layer.has_column(c))
        .map(|c| c.to_string())
}

fn resolve(
    layer: &Layer,
    role: &str,
    configured: &Option<String>,
    candidates: &[&str],
) -> Option<String> {
    if let Some(name) = configured {
        let normalized = normalize_name(name);
        if layer.has_column(&normalized) {
            return Some(normalized);
        }
        warn!(
            "configured {role} column '{name}' not present in {}, guessing instead",
            layer.name
        );
    }
    pick_col(layer, candidates)
}

/// Map the usual INE section fields, honoring configured overrides. Every
/// role is optional here; operations that cannot run without one bail at the
/// point of use.
pub fn guess_section_columns(layer: &Layer, overrides: &FieldOverrides) -> SectionColumns {
    SectionColumns {
        entity: resolve(layer, "entity", &overrides.entity, ENTITY_COLS),
        municipality: resolve(
            layer,
            "municipality",
            &overrides.municipality,
            MUNICIPALITY_COLS,
        ),
        district_local: resolve(
            layer,
            "local district",
            &overrides.district_local,
            DISTRICT_LOCAL_COLS,
        ),
        district_federal: resolve(
            layer,
            "federal district",
            &overrides.district_federal,
            DISTRICT_FEDERAL_COLS,
        ),
        section: resolve(layer, "section", &overrides.section, SECTION_COLS),
        block_count: resolve(
            layer,
            "block count",
            &overrides.block_count,
            BLOCK_COUNT_COLS,
        ),
        voters: resolve(layer, "voters", &overrides.voters, VOTERS_COLS),
        pop18: resolve(layer, "adult population", &overrides.pop18, POP18_COLS),
    }
}

pub fn guess_block_columns(layer: &Layer, overrides: &FieldOverrides) -> BlockColumns {
    BlockColumns {
        section: resolve(layer, "section", &overrides.block_section, &["SECCION"]),
        pop18: resolve(layer, "adult population", &overrides.pop18, POP18_COLS),
    }
}

/// District and section columns for the per-district KMZ. Falls back to the
/// first column so oddly-named layers still convert, with a warning.
pub fn guess_convert_columns(
    layer: &Layer,
    overrides: &FieldOverrides,
) -> Result<(String, String)> {
    let first = |role: &str| -> Result<String> {
        let fallback = layer
            .columns
            .first()
            .cloned()
            .with_context(|| format!("{} has no attribute columns", layer.name))?;
        warn!(
            "no {role} column recognized in {}, using '{fallback}'",
            layer.name
        );
        Ok(fallback)
    };

    let district = match resolve(
        layer,
        "district",
        &overrides.district_local,
        DISTRICT_LOCAL_COLS,
    ) {
        Some(column) => column,
        None => first("district")?,
    };
    let section = match resolve(layer, "section", &overrides.section, SECTION_COLS) {
        Some(column) => column,
        None => first("section")?,
    };
    Ok((district, section))
}
