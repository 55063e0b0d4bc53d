//! The run modes behind the subcommands: per-district KMZ conversion, the
//! export bundle, and the shared load/filter/join front half.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::data;
use crate::export;
use crate::kml;
use crate::processing;
use crate::render;
use crate::types::{BlockColumns, FieldKey, Layer, SectionColumns};
use crate::workspace::Workspace;

/// Everything the export and serve paths need once the inputs are on disk:
/// filtered sections, clipped blocks, and the resolved role columns.
pub struct Inputs {
    pub sections: Layer,
    pub section_cols: SectionColumns,
    pub blocks: Option<Layer>,
    pub block_cols: Option<BlockColumns>,
}

/// Load the configured layers, apply the filters, and cut the blocks down to
/// the filtered sections.
pub fn load_inputs(config: &AppConfig) -> Result<Inputs> {
    // 1. Read the layers
    let (sections, blocks) = read_layers(config, true)?;

    // 2. Resolve columns and narrow the sections
    let section_cols = data::guess_section_columns(&sections, &config.fields);
    let sections = processing::apply_section_filters(&sections, &section_cols, &config.filters)?;

    // 3. Cut the blocks to the visible window and tie them to sections
    let mut block_cols = None;
    let blocks = blocks.map(|raw| {
        let mut clipped = processing::clip_blocks(&raw, &sections);
        let mut cols = data::guess_block_columns(&clipped, &config.fields);
        match (cols.section.clone(), &section_cols.section) {
            (Some(_), Some(section_col)) => {
                // The block layer carries its own section numbers: keep only
                // the filtered ones when both sides parse as numbers.
                if let Some(wanted) = numeric_section_keys(&sections, section_col) {
                    clipped = processing::refine_blocks_by_section(&clipped, &cols, &wanted);
                }
            }
            (None, Some(section_col)) => {
                if processing::assign_block_sections(&mut clipped, &sections, section_col) > 0 {
                    cols.section = Some("SECCION".to_string());
                }
            }
            _ => {}
        }
        block_cols = Some(cols);
        clipped
    });

    Ok(Inputs {
        sections,
        section_cols,
        blocks,
        block_cols,
    })
}

/// `convert`: one KMZ with a folder per district, each section colored and
/// labeled at its centroid.
pub fn run_convert(config: &AppConfig) -> Result<PathBuf> {
    // 1. Load the sections layer; the district KMZ never draws blocks
    let (sections, _) = read_layers(config, false)?;

    // 2. Resolve columns and filters
    let section_cols = data::guess_section_columns(&sections, &config.fields);
    let sections = processing::apply_section_filters(&sections, &section_cols, &config.filters)?;
    let (district_col, section_col) = data::guess_convert_columns(&sections, &config.fields)?;

    // 3. Build the document and pack it
    let fill_alpha = config.style.fill_alpha.unwrap_or(150);
    let document = kml::district_document(
        &sections,
        &district_col,
        &section_col,
        config.style.mode,
        fill_alpha,
    )?;
    let bytes = kml::kmz_bytes(&document)?;

    fs::create_dir_all(&config.output.dir)
        .with_context(|| format!("creating {}", config.output.dir.display()))?;
    let path = config.output.dir.join("secciones_por_distrito.kmz");
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    info!("wrote {}", path.display());
    Ok(path)
}

/// `export`: the whole bundle. CSV tables, the workbook, colored KMZ,
/// GeoJSON, and the standalone map page.
pub fn run_export(config: &AppConfig) -> Result<()> {
    // 1. Load, filter, clip
    let inputs = load_inputs(config)?;
    let out = &config.output.dir;
    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    // 2. Tables
    let section_table = export::section_table_columns(&inputs.sections, &inputs.section_cols);
    export::write_csv(&inputs.sections, &section_table, &out.join("sections.csv"))?;
    let block_table = inputs.blocks.as_ref().map(export::block_table_columns);
    if let (Some(blocks), Some(columns)) = (&inputs.blocks, &block_table) {
        export::write_csv(blocks, columns, &out.join("blocks.csv"))?;
    }

    // 3. Workbook with the summary sheet
    let summary = processing::summarize(
        &inputs.sections,
        &inputs.section_cols,
        inputs.blocks.as_ref(),
    );
    let block_sheets = match (&inputs.blocks, &block_table) {
        (Some(layer), Some(columns)) => Some((layer, columns.as_slice())),
        _ => None,
    };
    export::write_workbook(
        &inputs.sections,
        &section_table,
        block_sheets,
        &summary,
        &out.join("export.xlsx"),
    )?;

    // 4. Colored KMZ
    let kmz_blocks = if config.output.kmz_include_blocks {
        inputs.blocks.as_ref()
    } else {
        None
    };
    let document = kml::export_document(
        &inputs.sections,
        inputs.section_cols.section.as_deref(),
        kmz_blocks,
        config.style.fill_alpha.unwrap_or(140),
        config.output.kmz_max_blocks,
    )?;
    fs::write(out.join("export.kmz"), kml::kmz_bytes(&document)?)
        .with_context(|| format!("writing {}", out.join("export.kmz").display()))?;

    // 5. Map page and GeoJSON
    let page = render::map_page(
        &inputs.sections,
        &inputs.section_cols,
        inputs.blocks.as_ref(),
        &config.map,
        config.output.kmz_max_blocks,
    )?;
    fs::write(out.join("map.html"), page)
        .with_context(|| format!("writing {}", out.join("map.html").display()))?;
    export::write_geojson(&inputs.sections, &out.join("sections.geojson"))?;
    if let Some(blocks) = &inputs.blocks {
        export::write_geojson(blocks, &out.join("blocks.geojson"))?;
    }

    info!(
        "export complete: {} sections, {} blocks → {}",
        summary.sections,
        summary.blocks_clipped.unwrap_or(0),
        out.display()
    );
    Ok(())
}

/// Distinct section numbers of the filtered layer. `None` when any value is
/// textual; the block refine only runs on cleanly numeric keys.
fn numeric_section_keys(sections: &Layer, column: &str) -> Option<Vec<i64>> {
    sections
        .distinct_keys(column)
        .into_iter()
        .map(|key| match key {
            FieldKey::Num(v) => Some(v),
            FieldKey::Text(_) => None,
        })
        .collect()
}

fn read_layers(config: &AppConfig, with_blocks: bool) -> Result<(Layer, Option<Layer>)> {
    let input = &config.input;
    if let Some(zip) = &input.zip {
        let workspace = Workspace::prepare(zip)?;
        let sections_path = workspace
            .pick_sections(input.sections_layer.as_deref())
            .to_path_buf();
        let blocks_path = if with_blocks {
            workspace
                .pick_blocks(input.blocks_layer.as_deref(), &sections_path)
                .map(PathBuf::from)
        } else {
            None
        };

        let sections = data::load_vector_layer(&sections_path, "secciones")?;
        let blocks = match blocks_path {
            Some(path) => Some(data::load_vector_layer(&path, "manzanas")?),
            None if with_blocks => {
                warn!("no blocks layer recognized in {}", zip.display());
                None
            }
            None => None,
        };
        Ok((sections, blocks))
    } else {
        let sections_path = input
            .sections
            .as_ref()
            .context("config carries neither input.zip nor input.sections")?;
        let sections = data::load_vector_layer(sections_path, "secciones")?;
        let blocks = match (&input.blocks, with_blocks) {
            (Some(path), true) => Some(data::load_vector_layer(path, "manzanas")?),
            _ => None,
        };
        Ok((sections, blocks))
    }
}
