//! KML document assembly and KMZ packaging.
//!
//! Two documents exist: the per-district one (a folder per district, inline
//! styles, label points) and the export one (shared styles, SECCIONES and
//! MANZANAS folders, attributes as ExtendedData).

use std::io::{Cursor, Write};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use geo::{LineString, MultiPolygon, Polygon};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use regex::Regex;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::color;
use crate::config::ColorMode;
use crate::geometry;
use crate::processing;
use crate::types::{Feature, Layer};

const KML_NS: &str = "http://www.opengis.net/kml/2.2";

/// Per-district document: one folder per district, each section drawn with
/// its fill plus a small label placemark at the ring centroid.
pub fn district_document(
    sections: &Layer,
    district_col: &str,
    section_col: &str,
    mode: ColorMode,
    fill_alpha: u8,
) -> Result<String> {
    let groups = processing::group_by_district(sections, district_col, section_col);
    let mut rng = rand::thread_rng();
    let line_color = color::to_kml(color::OUTLINE_BROWN, 255);

    let mut doc = KmlDoc::new()?;
    doc.start_with("kml", &[("xmlns", KML_NS)])?;
    doc.start("Document")?;
    doc.leaf("name", "Secciones por distrito")?;

    for (position, (district, entries)) in groups.iter().enumerate() {
        doc.start("Folder")?;
        doc.leaf("name", &format!("Distrito {}", district.padded_label(2)))?;

        for (section, index) in entries {
            let feature = &sections.features[*index];
            let fill = match mode {
                ColorMode::DistrictPalette => color::district_fill(position),
                ColorMode::Section => color::section_color(section),
                ColorMode::Random => color::random_color(&mut rng),
            };
            let name = section.to_string();

            doc.start("Placemark")?;
            doc.leaf("name", &name)?;
            doc.start("Style")?;
            doc.start("LineStyle")?;
            doc.leaf("color", &line_color)?;
            doc.leaf("width", "1.2")?;
            doc.end("LineStyle")?;
            doc.start("PolyStyle")?;
            doc.leaf("color", &color::to_kml(fill, fill_alpha))?;
            doc.leaf("fill", "1")?;
            doc.end("PolyStyle")?;
            doc.end("Style")?;
            doc.geometry(&feature.geometry)?;
            doc.end("Placemark")?;

            // Tiny icon, big label: reads as a text label in Google Earth.
            if let Some((x, y)) = geometry::label_point(&feature.geometry) {
                doc.start("Placemark")?;
                doc.leaf("name", &name)?;
                doc.start("Style")?;
                doc.start("IconStyle")?;
                doc.leaf("scale", "0.1")?;
                doc.end("IconStyle")?;
                doc.start("LabelStyle")?;
                doc.leaf("scale", "1.4")?;
                doc.end("LabelStyle")?;
                doc.end("Style")?;
                doc.start("Point")?;
                doc.leaf("coordinates", &format!("{x:.8},{y:.8},0"))?;
                doc.end("Point")?;
                doc.end("Placemark")?;
            }
        }
        doc.end("Folder")?;
    }

    doc.end("Document")?;
    doc.end("kml")?;
    doc.finish()
}

/// Export document: shared per-section styles up front, then a SECCIONES
/// folder and, when blocks are passed in, a sampled MANZANAS folder. Without
/// a section column the placemarks go out unstyled and unnamed.
pub fn export_document(
    sections: &Layer,
    section_col: Option<&str>,
    blocks: Option<&Layer>,
    fill_alpha: u8,
    max_blocks: usize,
) -> Result<String> {
    let mut doc = KmlDoc::new()?;
    doc.start_with("kml", &[("xmlns", KML_NS)])?;
    doc.start("Document")?;
    doc.leaf("name", "ICC Export")?;

    if let Some(col) = section_col {
        for key in sections.distinct_keys(col) {
            let name = key.to_string();
            doc.start_with("Style", &[("id", &style_id(&name))])?;
            doc.start("LineStyle")?;
            doc.leaf("color", "ff000000")?;
            doc.leaf("width", "2")?;
            doc.end("LineStyle")?;
            doc.start("PolyStyle")?;
            doc.leaf("color", &color::to_kml(color::section_color(&key), fill_alpha))?;
            doc.leaf("fill", "1")?;
            doc.leaf("outline", "1")?;
            doc.end("PolyStyle")?;
            doc.end("Style")?;
        }
    }
    if blocks.is_some() {
        doc.start_with("Style", &[("id", "S_MZA")])?;
        doc.start("LineStyle")?;
        doc.leaf("color", "ff000000")?;
        doc.leaf("width", "1")?;
        doc.end("LineStyle")?;
        doc.start("PolyStyle")?;
        doc.leaf("color", &color::to_kml(color::rgb(0, 0, 0), 10))?;
        doc.leaf("fill", "1")?;
        doc.leaf("outline", "1")?;
        doc.end("PolyStyle")?;
        doc.end("Style")?;
    }

    doc.start("Folder")?;
    doc.leaf("name", "SECCIONES")?;
    for feature in &sections.features {
        doc.start("Placemark")?;
        if let Some(key) = section_col.and_then(|col| feature.key(col)) {
            let name = key.to_string();
            doc.leaf("name", &name)?;
            doc.leaf("styleUrl", &format!("#{}", style_id(&name)))?;
        }
        extended_data(&mut doc, feature, &sections.columns)?;
        doc.geometry(&feature.geometry)?;
        doc.end("Placemark")?;
    }
    doc.end("Folder")?;

    if let Some(blocks) = blocks {
        doc.start("Folder")?;
        doc.leaf("name", "MANZANAS")?;
        for index in processing::sampled_indices(blocks.len(), max_blocks) {
            let feature = &blocks.features[index];
            doc.start("Placemark")?;
            if let Some(id) = feature.attr("CVE_MZA") {
                doc.leaf("name", &id.to_string())?;
            }
            doc.leaf("styleUrl", "#S_MZA")?;
            extended_data(&mut doc, feature, &blocks.columns)?;
            doc.geometry(&feature.geometry)?;
            doc.end("Placemark")?;
        }
        doc.end("Folder")?;
    }

    doc.end("Document")?;
    doc.end("kml")?;
    doc.finish()
}

fn extended_data(doc: &mut KmlDoc, feature: &Feature, columns: &[String]) -> Result<()> {
    let populated: Vec<_> = columns
        .iter()
        .filter_map(|c| feature.attr(c).map(|v| (c, v)))
        .collect();
    if populated.is_empty() {
        return Ok(());
    }
    doc.start("ExtendedData")?;
    for (column, value) in populated {
        doc.start_with("Data", &[("name", column)])?;
        doc.leaf("value", &value.to_string())?;
        doc.end("Data")?;
    }
    doc.end("ExtendedData")?;
    Ok(())
}

/// Style ids may only carry word characters; everything else collapses to
/// underscores and long values get cut.
pub fn style_id(section: &str) -> String {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    let re = NON_WORD.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]+").expect("literal regex"));
    let cleaned: String = re.replace_all(section, "_").chars().take(60).collect();
    format!("S_{cleaned}")
}

/// A KMZ is a ZIP holding a single `doc.kml`.
pub fn kmz_bytes(kml: &str) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(
            "doc.kml",
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
        )
        .context("starting doc.kml entry")?;
    writer.write_all(kml.as_bytes()).context("writing doc.kml")?;
    Ok(writer.finish().context("finishing KMZ")?.into_inner())
}

struct KmlDoc {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl KmlDoc {
    fn new() -> Result<KmlDoc> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(KmlDoc { writer })
    }

    fn start(&mut self, tag: &str) -> Result<()> {
        self.writer.write_event(Event::Start(BytesStart::new(tag)))?;
        Ok(())
    }

    fn start_with(&mut self, tag: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(tag);
        for (key, value) in attributes {
            el.push_attribute((*key, *value));
        }
        self.writer.write_event(Event::Start(el))?;
        Ok(())
    }

    fn end(&mut self, tag: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }

    fn leaf(&mut self, tag: &str, text: &str) -> Result<()> {
        self.start(tag)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(tag)
    }

    fn geometry(&mut self, geometry: &MultiPolygon<f64>) -> Result<()> {
        if geometry.0.len() == 1 {
            return self.polygon(&geometry.0[0]);
        }
        self.start("MultiGeometry")?;
        for polygon in &geometry.0 {
            self.polygon(polygon)?;
        }
        self.end("MultiGeometry")
    }

    fn polygon(&mut self, polygon: &Polygon<f64>) -> Result<()> {
        self.start("Polygon")?;
        self.start("outerBoundaryIs")?;
        self.ring(polygon.exterior())?;
        self.end("outerBoundaryIs")?;
        for interior in polygon.interiors() {
            self.start("innerBoundaryIs")?;
            self.ring(interior)?;
            self.end("innerBoundaryIs")?;
        }
        self.end("Polygon")
    }

    fn ring(&mut self, ring: &LineString<f64>) -> Result<()> {
        self.start("LinearRing")?;
        let coordinates = ring
            .0
            .iter()
            .map(|c| format!("{:.8},{:.8},0", c.x, c.y))
            .collect::<Vec<_>>()
            .join(" ");
        self.leaf("coordinates", &coordinates)?;
        self.end("LinearRing")
    }

    fn finish(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).context("KML is not valid UTF-8")
    }
}
