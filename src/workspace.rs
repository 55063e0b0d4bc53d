//! Unpacks an INE/INEGI cartography ZIP into a temporary workspace and finds
//! the shapefiles inside it. Downloads often nest a ZIP per entity inside the
//! outer archive, so extraction recurses a couple of levels.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tempfile::TempDir;
use tracing::warn;
use walkdir::WalkDir;
use zip::ZipArchive;

const NESTED_ZIP_DEPTH: usize = 2;

pub struct Workspace {
    // Keeps the extraction directory alive; dropping it deletes the files.
    _root: TempDir,
    pub shapefiles: Vec<PathBuf>,
}

impl Workspace {
    /// Extract `zip_path` (and any ZIPs inside it) and index the `.shp`
    /// files found. Fails only when the outer archive is unreadable or no
    /// shapefile turns up at all.
    pub fn prepare(zip_path: &Path) -> Result<Workspace> {
        let root = tempfile::Builder::new()
            .prefix("seccion-mapper-")
            .tempdir()
            .context("creating extraction workspace")?;

        extract_zip(zip_path, root.path())
            .with_context(|| format!("extracting {}", zip_path.display()))?;
        extract_nested_zips(root.path());

        let shapefiles = list_shapefiles(root.path());
        if shapefiles.is_empty() {
            bail!("no .shp files inside {}", zip_path.display());
        }
        Ok(Workspace {
            _root: root,
            shapefiles,
        })
    }

    /// Sections layer: explicit request first, then name heuristics, then the
    /// first shapefile in path order.
    pub fn pick_sections(&self, requested: Option<&str>) -> &Path {
        if let Some(req) = requested {
            match find_requested(&self.shapefiles, req) {
                Some(p) => return p,
                None => warn!("requested sections layer '{req}' not found, picking automatically"),
            }
        }
        if let Some(p) = auto_pick_sections(&self.shapefiles) {
            return p;
        }
        if self.shapefiles.len() > 1 {
            warn!(
                "no shapefile looks like a sections layer, using {}",
                self.shapefiles[0].display()
            );
        }
        &self.shapefiles[0]
    }

    /// Blocks layer, or `None` when there is nothing usable. A pick that
    /// lands on the sections layer itself is discarded.
    pub fn pick_blocks(&self, requested: Option<&str>, sections: &Path) -> Option<&Path> {
        let picked = match requested {
            Some(req) => match find_requested(&self.shapefiles, req) {
                Some(p) => Some(p),
                None => {
                    warn!("requested blocks layer '{req}' not found, picking automatically");
                    auto_pick_blocks(&self.shapefiles)
                }
            },
            None => auto_pick_blocks(&self.shapefiles),
        }?;
        if picked == sections {
            warn!("blocks pick is the sections layer itself, continuing without blocks");
            return None;
        }
        Some(picked)
    }
}

fn lowered(path: &Path) -> String {
    path.to_string_lossy().to_ascii_lowercase().replace('\\', "/")
}

fn find_requested<'a>(shapefiles: &'a [PathBuf], requested: &str) -> Option<&'a Path> {
    let needle = requested.to_ascii_lowercase();
    shapefiles
        .iter()
        .find(|p| lowered(p).contains(&needle))
        .map(PathBuf::as_path)
}

fn auto_pick_sections(shapefiles: &[PathBuf]) -> Option<&Path> {
    shapefiles
        .iter()
        .find(|p| lowered(p).contains("secciones"))
        .or_else(|| shapefiles.iter().find(|p| lowered(p).contains("seccion")))
        .map(PathBuf::as_path)
}

fn auto_pick_blocks(shapefiles: &[PathBuf]) -> Option<&Path> {
    // INEGI block layers are either MANZANAS.shp or the "<ee>m.shp" state
    // files, with MZA as a last-resort marker.
    static STATE_BLOCKS: OnceLock<Regex> = OnceLock::new();
    let state_blocks =
        STATE_BLOCKS.get_or_init(|| Regex::new(r"(^|/)\d{2}m\.shp$").expect("literal regex"));

    shapefiles
        .iter()
        .find(|p| lowered(p).contains("manzanas"))
        .or_else(|| shapefiles.iter().find(|p| state_blocks.is_match(&lowered(p))))
        .or_else(|| shapefiles.iter().find(|p| lowered(p).contains("mza")))
        .map(PathBuf::as_path)
}

/// Extract every entry, skipping (with a warning) the ones that fail or
/// escape the destination, so one corrupt member does not sink the run.
fn extract_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("reading {} as a ZIP archive", zip_path.display()))?;

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable zip entry #{index}: {err}");
                continue;
            }
        };
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            if let Err(err) = fs::create_dir_all(&target) {
                warn!("could not create {}: {err}", target.display());
            }
            continue;
        }
        if let Some(parent) = target.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("could not create {}: {err}", parent.display());
                continue;
            }
        }
        match File::create(&target) {
            Ok(mut out) => {
                if let Err(err) = io::copy(&mut entry, &mut out) {
                    warn!("could not extract {}: {err}", target.display());
                }
            }
            Err(err) => warn!("could not create {}: {err}", target.display()),
        }
    }
    Ok(())
}

/// ZIPs inside the extracted tree get their own `<name>_unzipped` directory
/// next to them. Two passes cover the usual entity-per-zip layout.
fn extract_nested_zips(root: &Path) {
    for _ in 0..NESTED_ZIP_DEPTH {
        let inner_zips: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| has_extension(p, "zip"))
            .collect();

        let mut extracted_any = false;
        for inner in inner_zips {
            let stem = match inner.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            let target = match inner.parent() {
                Some(parent) => parent.join(format!("{stem}_unzipped")),
                None => continue,
            };
            if target.exists() {
                continue;
            }
            if let Err(err) = fs::create_dir_all(&target) {
                warn!("could not create {}: {err}", target.display());
                continue;
            }
            match extract_zip(&inner, &target) {
                Ok(()) => extracted_any = true,
                Err(err) => warn!("skipping nested zip {}: {err}", inner.display()),
            }
        }
        if !extracted_any {
            break;
        }
    }
}

fn list_shapefiles(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_extension(p, "shp"))
        .collect();
    found.sort();
    found
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}
