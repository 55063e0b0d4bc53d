use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub fields: FieldOverrides,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub style: StyleConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Where the cartography comes from: a ZIP holding the shapefiles, or direct
/// paths to a sections (and optionally blocks) layer.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InputConfig {
    pub zip: Option<PathBuf>,
    pub sections: Option<PathBuf>,
    pub blocks: Option<PathBuf>,
    /// Relative `.shp` path inside the ZIP, overriding the name heuristics.
    pub sections_layer: Option<String>,
    pub blocks_layer: Option<String>,
}

/// Explicit column names; anything left unset is guessed from the usual
/// INE/INEGI field names.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FieldOverrides {
    pub entity: Option<String>,
    pub municipality: Option<String>,
    pub district_local: Option<String>,
    pub district_federal: Option<String>,
    pub section: Option<String>,
    pub block_count: Option<String>,
    pub voters: Option<String>,
    pub pop18: Option<String>,
    pub block_section: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    pub district_local: Option<i64>,
    pub district_federal: Option<i64>,
    pub municipality: Option<i64>,
    /// Empty means all sections.
    #[serde(default)]
    pub sections: Vec<i64>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.district_local.is_none()
            && self.district_federal.is_none()
            && self.municipality.is_none()
            && self.sections.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    /// One palette color per district, shared by all its sections.
    #[default]
    DistrictPalette,
    /// Deterministic color per section value.
    Section,
    /// Fresh random color per section.
    Random,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StyleConfig {
    #[serde(default)]
    pub mode: ColorMode,
    /// Polygon fill opacity 0-255; defaults differ per artifact (150 for the
    /// district KMZ, 140 for the export KMZ).
    pub fill_alpha: Option<u8>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Basemap {
    #[default]
    EsriRelief,
    OpenTopo,
    Osm,
    EsriImagery,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    #[serde(default)]
    pub basemap: Basemap,
    #[serde(default)]
    pub show_blocks: bool,
    #[serde(default = "default_true")]
    pub show_labels: bool,
    #[serde(default = "default_label_size")]
    pub label_size_px: u32,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            basemap: Basemap::default(),
            show_blocks: false,
            show_labels: true,
            label_size_px: default_label_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_out_dir")]
    pub dir: PathBuf,
    /// Include the manzanas folder in the export KMZ (can get heavy).
    #[serde(default)]
    pub kmz_include_blocks: bool,
    #[serde(default = "default_kmz_max_blocks")]
    pub kmz_max_blocks: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: default_out_dir(),
            kmz_include_blocks: false,
            kmz_max_blocks: default_kmz_max_blocks(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_label_size() -> u32 {
    16
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_kmz_max_blocks() -> usize {
    6000
}

fn default_port() -> u16 {
    8080
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating, so command-line overrides can land first.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.zip.is_none() && self.input.sections.is_none() {
            bail!("config needs either input.zip or input.sections");
        }
        if self.input.zip.is_some() && self.input.sections.is_some() {
            bail!("input.zip and input.sections are mutually exclusive");
        }
        Ok(())
    }
}
