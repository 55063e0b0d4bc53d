//! Tabular and GeoJSON artifacts: section/block tables as CSV, the
//! three-sheet workbook, and FeatureCollections shared with the map page and
//! the server.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::Workbook;
use serde_json::Value;

use crate::processing::Summary;
use crate::types::{AttrValue, Feature, Layer, SectionColumns};

/// Fixed front columns of the blocks table, matching INEGI's key order.
const BLOCK_FRONT_COLS: &[&str] = &[
    "CVE_ENT",
    "CVE_MUN",
    "CVE_LOC",
    "CVE_AGEB",
    "CVE_MZA",
    "TIPOMZA",
];

pub fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::Text(s) => Value::String(s.clone()),
        AttrValue::Int(v) => Value::from(*v),
        AttrValue::Float(v) => Value::from(*v),
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Null => Value::Null,
    }
}

/// Build a FeatureCollection from a layer, with `extra` properties appended
/// per feature (the map page uses this to inject fill colors).
pub fn feature_collection(
    layer: &Layer,
    mut extra: impl FnMut(&Feature) -> Vec<(String, Value)>,
) -> geojson::FeatureCollection {
    let features = layer
        .features
        .iter()
        .map(|feature| {
            let mut properties = geojson::JsonObject::new();
            for (key, value) in &feature.attrs {
                if !value.is_null() {
                    properties.insert(key.clone(), attr_to_json(value));
                }
            }
            for (key, value) in extra(feature) {
                properties.insert(key, value);
            }
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(
                    &feature.geometry,
                ))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn write_geojson(layer: &Layer, path: &Path) -> Result<()> {
    let collection = feature_collection(layer, |_| Vec::new());
    let file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer(file, &collection)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Column order for the sections table: role columns first when recognized,
/// everything else after in layer order.
pub fn section_table_columns(layer: &Layer, cols: &SectionColumns) -> Vec<String> {
    let roles = [
        &cols.entity,
        &cols.municipality,
        &cols.district_local,
        &cols.district_federal,
        &cols.section,
        &cols.block_count,
        &cols.pop18,
        &cols.voters,
    ];
    let mut ordered: Vec<String> = roles.iter().filter_map(|c| (*c).clone()).collect();
    for column in &layer.columns {
        if !ordered.contains(column) {
            ordered.push(column.clone());
        }
    }
    ordered
}

/// Column order for the blocks table: INEGI key columns, then the roles we
/// added or guessed, then the rest.
pub fn block_table_columns(layer: &Layer) -> Vec<String> {
    let mut ordered: Vec<String> = BLOCK_FRONT_COLS
        .iter()
        .filter(|c| layer.has_column(c))
        .map(|c| c.to_string())
        .collect();
    for extra in ["SECCION", "POB18MAS"] {
        if layer.has_column(extra) && !ordered.contains(&extra.to_string()) {
            ordered.push(extra.to_string());
        }
    }
    for column in &layer.columns {
        if !ordered.contains(column) {
            ordered.push(column.clone());
        }
    }
    ordered
}

pub fn write_csv(layer: &Layer, columns: &[String], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(columns)?;
    for feature in &layer.features {
        let row: Vec<String> = columns
            .iter()
            .map(|c| {
                feature
                    .attrs
                    .get(c)
                    .map(AttrValue::to_string)
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&row)?;
    }
    writer
        .flush()
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// The workbook: RESUMEN with the headline numbers, SECCIONES, and MANZANAS
/// when blocks are present. Sheet names are capped at Excel's 31 chars.
pub fn write_workbook(
    sections: &Layer,
    section_columns: &[String],
    blocks: Option<(&Layer, &[String])>,
    summary: &Summary,
    path: &Path,
) -> Result<()> {
    let mut workbook = Workbook::new();

    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name("RESUMEN"))?;
    let mut row = 0u32;
    for (label, value) in [
        ("SECCIONES", Some(summary.sections as i64)),
        ("MANZANAS_RECORTE", summary.blocks_clipped.map(|v| v as i64)),
        ("MANZANAS_SUM_SECCIONES", summary.block_count_sum),
        ("POB18MAS_TOTAL", summary.pop18_sum),
        ("VOTANTES_TOTAL", summary.voters_sum),
    ] {
        let Some(value) = value else { continue };
        sheet.write_string(row, 0, label)?;
        sheet.write_number(row, 1, value as f64)?;
        row += 1;
    }

    write_table_sheet(&mut workbook, "SECCIONES", sections, section_columns)?;
    if let Some((layer, columns)) = blocks {
        write_table_sheet(&mut workbook, "MANZANAS", layer, columns)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn write_table_sheet(
    workbook: &mut Workbook,
    name: &str,
    layer: &Layer,
    columns: &[String],
) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name(name))?;
    for (col, column) in columns.iter().enumerate() {
        sheet.write_string(0, col as u16, column.as_str())?;
    }
    for (row, feature) in layer.features.iter().enumerate() {
        let row = (row + 1) as u32;
        for (col, column) in columns.iter().enumerate() {
            let col = col as u16;
            match feature.attrs.get(column) {
                Some(AttrValue::Int(v)) => {
                    sheet.write_number(row, col, *v as f64)?;
                }
                Some(AttrValue::Float(v)) => {
                    sheet.write_number(row, col, *v)?;
                }
                Some(AttrValue::Null) | None => {}
                Some(value) => {
                    sheet.write_string(row, col, &value.to_string())?;
                }
            }
        }
    }
    Ok(())
}

fn sheet_name(name: &str) -> &str {
    &name[..name.len().min(31)]
}
