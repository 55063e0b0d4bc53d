//! Turns loaded layers into what the exports need: filtered sections,
//! blocks cut to the visible window, and per-district groupings.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use geo::{BoundingRect, Contains, Intersects, Point};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use tracing::{info, warn};

use crate::config::FilterConfig;
use crate::geometry;
use crate::types::{AttrValue, BlockColumns, FieldKey, Layer, SectionColumns};

/// Narrow the sections layer by the configured district / municipality /
/// section filters. Filters pointing at columns the layer does not have are
/// ignored with a warning; an empty result is an error since every
/// downstream artifact would be blank.
pub fn apply_section_filters(
    layer: &Layer,
    cols: &SectionColumns,
    filters: &FilterConfig,
) -> Result<Layer> {
    if filters.is_empty() {
        return Ok(layer.clone());
    }

    let mut result = layer.clone();
    let single = [
        (&cols.district_local, filters.district_local, "local district"),
        (
            &cols.district_federal,
            filters.district_federal,
            "federal district",
        ),
        (&cols.municipality, filters.municipality, "municipality"),
    ];
    for (column, wanted, role) in single {
        let Some(wanted) = wanted else { continue };
        match column {
            Some(col) => {
                result = result.filtered(|f| f.key(col) == Some(FieldKey::Num(wanted)));
            }
            None => warn!("no {role} column in {}, ignoring that filter", layer.name),
        }
    }

    if !filters.sections.is_empty() {
        match &cols.section {
            Some(col) => {
                let wanted: BTreeSet<FieldKey> =
                    filters.sections.iter().map(|s| FieldKey::Num(*s)).collect();
                result = result.filtered(|f| {
                    f.key(col).map(|k| wanted.contains(&k)).unwrap_or(false)
                });
            }
            None => warn!("no section column in {}, ignoring that filter", layer.name),
        }
    }

    if result.is_empty() {
        bail!("no sections match the configured filters");
    }
    info!("filters kept {} of {} sections", result.len(), layer.len());
    Ok(result)
}

/// Keep only the blocks whose geometry touches the combined bounding box of
/// the filtered sections. State block files run into the hundreds of
/// thousands of rows, so the exact test runs in parallel behind a cheap
/// bbox check.
pub fn clip_blocks(blocks: &Layer, sections: &Layer) -> Layer {
    let Some(bounds) = geometry::layer_bounds(&sections.features) else {
        return Layer {
            name: blocks.name.clone(),
            columns: blocks.columns.clone(),
            features: Vec::new(),
        };
    };
    let window = bounds.to_polygon();

    let features: Vec<_> = blocks
        .features
        .par_iter()
        .filter(|f| {
            f.geometry
                .bounding_rect()
                .map(|r| r.intersects(&bounds))
                .unwrap_or(false)
                && f.geometry.intersects(&window)
        })
        .cloned()
        .collect();

    info!("clip kept {} of {} blocks", features.len(), blocks.len());
    Layer {
        name: blocks.name.clone(),
        columns: blocks.columns.clone(),
        features,
    }
}

/// Drop clipped blocks whose section number is not in the wanted list. The
/// cut only happens when every block parses cleanly; a single stray value
/// means the section codes are not comparable and the bbox cut stands.
pub fn refine_blocks_by_section(
    blocks: &Layer,
    block_cols: &BlockColumns,
    wanted: &[i64],
) -> Layer {
    if wanted.is_empty() {
        return blocks.clone();
    }
    let Some(col) = &block_cols.section else {
        return blocks.clone();
    };

    let mut values = Vec::with_capacity(blocks.len());
    for feature in &blocks.features {
        match feature.attr(col).and_then(AttrValue::as_i64) {
            Some(v) => values.push(v),
            None => {
                warn!(
                    "{}: non-numeric {col} values, keeping the bounding-box cut",
                    blocks.name
                );
                return blocks.clone();
            }
        }
    }

    let wanted: BTreeSet<i64> = wanted.iter().copied().collect();
    let features = blocks
        .features
        .iter()
        .zip(&values)
        .filter(|(_, v)| wanted.contains(v))
        .map(|(f, _)| f.clone())
        .collect();
    Layer {
        name: blocks.name.clone(),
        columns: blocks.columns.clone(),
        features,
    }
}

struct SectionEnvelope {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for SectionEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Give blocks a SECCION attribute by locating each block's interior point
/// inside the section polygons. Only used when the block layer has no
/// section column of its own. Returns how many blocks got a value.
pub fn assign_block_sections(blocks: &mut Layer, sections: &Layer, section_col: &str) -> usize {
    let entries: Vec<SectionEnvelope> = sections
        .features
        .iter()
        .enumerate()
        .filter_map(|(index, f)| {
            f.geometry.bounding_rect().map(|r| SectionEnvelope {
                index,
                envelope: AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
            })
        })
        .collect();
    let tree = RTree::bulk_load(entries);

    let assigned: Vec<Option<FieldKey>> = blocks
        .features
        .par_iter()
        .map(|block| {
            let (x, y) = geometry::interior_point(&block.geometry)?;
            let point = Point::new(x, y);
            tree.locate_in_envelope_intersecting(&AABB::from_point([x, y]))
                .find_map(|entry| {
                    let section = &sections.features[entry.index];
                    if section.geometry.contains(&point) {
                        section.key(section_col)
                    } else {
                        None
                    }
                })
        })
        .collect();

    let mut count = 0usize;
    for (feature, key) in blocks.features.iter_mut().zip(assigned) {
        let Some(key) = key else { continue };
        let value = match key {
            FieldKey::Num(v) => AttrValue::Int(v),
            FieldKey::Text(s) => AttrValue::Text(s),
        };
        feature.attrs.insert("SECCION".to_string(), value);
        count += 1;
    }
    if count > 0 && !blocks.has_column("SECCION") {
        blocks.columns.push("SECCION".to_string());
        blocks.columns.sort();
    }
    info!(
        "assigned a section to {count} of {} blocks by location",
        blocks.len()
    );
    count
}

/// Sections indexed by district, sections sorted within each district.
/// Features missing either value are left out.
pub fn group_by_district(
    layer: &Layer,
    district_col: &str,
    section_col: &str,
) -> BTreeMap<FieldKey, Vec<(FieldKey, usize)>> {
    let mut groups: BTreeMap<FieldKey, Vec<(FieldKey, usize)>> = BTreeMap::new();
    let mut skipped = 0usize;
    for (index, feature) in layer.features.iter().enumerate() {
        let (Some(district), Some(section)) =
            (feature.key(district_col), feature.key(section_col))
        else {
            skipped += 1;
            continue;
        };
        groups.entry(district).or_default().push((section, index));
    }
    for sections in groups.values_mut() {
        sections.sort();
    }
    if skipped > 0 {
        warn!("{skipped} features without {district_col}/{section_col} left out of the grouping");
    }
    groups
}

/// Indices of the blocks that make it into a KMZ or onto the map when the
/// layer is larger than `max`. Seeded, so the same input draws the same
/// blocks every run.
pub fn sampled_indices(len: usize, max: usize) -> Vec<usize> {
    if len <= max {
        return (0..len).collect();
    }
    let mut rng = StdRng::seed_from_u64(7);
    let mut indices = rand::seq::index::sample(&mut rng, len, max).into_vec();
    indices.sort_unstable();
    indices
}

/// Headline numbers for the summary sheet and the serve page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub sections: usize,
    pub blocks_clipped: Option<usize>,
    pub block_count_sum: Option<i64>,
    pub voters_sum: Option<i64>,
    pub pop18_sum: Option<i64>,
}

pub fn summarize(sections: &Layer, cols: &SectionColumns, blocks: Option<&Layer>) -> Summary {
    let column_sum = |column: &Option<String>| -> Option<i64> {
        column.as_ref().map(|col| {
            sections
                .features
                .iter()
                .filter_map(|f| f.attr(col).and_then(AttrValue::as_f64))
                .sum::<f64>() as i64
        })
    };
    Summary {
        sections: sections.len(),
        blocks_clipped: blocks.map(Layer::len),
        block_count_sum: column_sum(&cols.block_count),
        voters_sum: column_sum(&cols.voters),
        pop18_sum: column_sum(&cols.pop18),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};
    use std::collections::BTreeMap as Map;

    fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
        ]])
    }

    fn feature(
        geometry: MultiPolygon<f64>,
        attrs: &[(&str, AttrValue)],
    ) -> crate::types::Feature {
        let attrs: Map<String, AttrValue> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        crate::types::Feature { geometry, attrs }
    }

    fn layer(name: &str, features: Vec<crate::types::Feature>) -> Layer {
        let mut columns: BTreeSet<String> = BTreeSet::new();
        for f in &features {
            columns.extend(f.attrs.keys().cloned());
        }
        Layer {
            name: name.into(),
            columns: columns.into_iter().collect(),
            features,
        }
    }

    fn section_fixture() -> (Layer, SectionColumns) {
        let features = vec![
            feature(
                square(0.0, 0.0, 1.0),
                &[
                    ("DISTRITO_L", AttrValue::Int(1)),
                    ("SECCION", AttrValue::Int(101)),
                    ("VOTANTES", AttrValue::Int(500)),
                ],
            ),
            feature(
                square(2.0, 0.0, 1.0),
                &[
                    ("DISTRITO_L", AttrValue::Int(1)),
                    ("SECCION", AttrValue::Text("0102".into())),
                    ("VOTANTES", AttrValue::Int(300)),
                ],
            ),
            feature(
                square(4.0, 0.0, 1.0),
                &[
                    ("DISTRITO_L", AttrValue::Int(2)),
                    ("SECCION", AttrValue::Int(201)),
                    ("VOTANTES", AttrValue::Text("250".into())),
                ],
            ),
        ];
        let layer = layer("secciones", features);
        let cols = SectionColumns {
            district_local: Some("DISTRITO_L".into()),
            section: Some("SECCION".into()),
            voters: Some("VOTANTES".into()),
            ..Default::default()
        };
        (layer, cols)
    }

    #[test]
    fn district_filter_narrows_sections() {
        let (layer, cols) = section_fixture();
        let filters = FilterConfig {
            district_local: Some(1),
            ..Default::default()
        };
        let result = apply_section_filters(&layer, &cols, &filters).expect("non-empty result");
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn zero_padded_section_text_matches_numeric_filter() {
        let (layer, cols) = section_fixture();
        let filters = FilterConfig {
            sections: vec![102],
            ..Default::default()
        };
        let result = apply_section_filters(&layer, &cols, &filters).expect("non-empty result");
        assert_eq!(result.len(), 1);
        assert_eq!(
            result.features[0].key("SECCION"),
            Some(FieldKey::Num(102))
        );
    }

    #[test]
    fn filter_on_missing_column_is_ignored() {
        let (layer, mut cols) = section_fixture();
        cols.municipality = None;
        let filters = FilterConfig {
            municipality: Some(99),
            ..Default::default()
        };
        let result = apply_section_filters(&layer, &cols, &filters).expect("nothing filtered");
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn empty_filter_result_is_an_error() {
        let (layer, cols) = section_fixture();
        let filters = FilterConfig {
            district_local: Some(77),
            ..Default::default()
        };
        assert!(apply_section_filters(&layer, &cols, &filters).is_err());
    }

    #[test]
    fn clip_keeps_touching_blocks_only() {
        let (sections, _) = section_fixture();
        let blocks = layer(
            "manzanas",
            vec![
                feature(square(0.2, 0.2, 0.2), &[("CVE_MZA", AttrValue::Int(1))]),
                feature(square(4.9, 0.5, 0.4), &[("CVE_MZA", AttrValue::Int(2))]),
                feature(square(40.0, 40.0, 1.0), &[("CVE_MZA", AttrValue::Int(3))]),
            ],
        );
        let clipped = clip_blocks(&blocks, &sections);
        assert_eq!(clipped.len(), 2);
    }

    #[test]
    fn refine_cuts_by_section_when_values_parse() {
        let blocks = layer(
            "manzanas",
            vec![
                feature(square(0.0, 0.0, 0.1), &[("SECCION", AttrValue::Int(101))]),
                feature(square(1.0, 0.0, 0.1), &[("SECCION", AttrValue::Text("0102".into()))]),
                feature(square(2.0, 0.0, 0.1), &[("SECCION", AttrValue::Int(201))]),
            ],
        );
        let cols = BlockColumns {
            section: Some("SECCION".into()),
            pop18: None,
        };
        let refined = refine_blocks_by_section(&blocks, &cols, &[101, 102]);
        assert_eq!(refined.len(), 2);
    }

    #[test]
    fn refine_backs_off_on_unparseable_values() {
        let blocks = layer(
            "manzanas",
            vec![
                feature(square(0.0, 0.0, 0.1), &[("SECCION", AttrValue::Int(101))]),
                feature(square(1.0, 0.0, 0.1), &[("SECCION", AttrValue::Text("A-1".into()))]),
            ],
        );
        let cols = BlockColumns {
            section: Some("SECCION".into()),
            pop18: None,
        };
        let refined = refine_blocks_by_section(&blocks, &cols, &[101]);
        assert_eq!(refined.len(), 2);
    }

    #[test]
    fn blocks_inherit_sections_by_location() {
        let (sections, _) = section_fixture();
        let mut blocks = layer(
            "manzanas",
            vec![
                feature(square(0.4, 0.4, 0.1), &[("CVE_MZA", AttrValue::Int(1))]),
                feature(square(4.4, 0.4, 0.1), &[("CVE_MZA", AttrValue::Int(2))]),
                feature(square(9.0, 9.0, 0.1), &[("CVE_MZA", AttrValue::Int(3))]),
            ],
        );
        let count = assign_block_sections(&mut blocks, &sections, "SECCION");
        assert_eq!(count, 2);
        assert!(blocks.has_column("SECCION"));
        assert_eq!(blocks.features[0].key("SECCION"), Some(FieldKey::Num(101)));
        assert_eq!(blocks.features[1].key("SECCION"), Some(FieldKey::Num(201)));
        assert_eq!(blocks.features[2].attr("SECCION"), None);
    }

    #[test]
    fn grouping_orders_districts_and_sections() {
        let (layer, _) = section_fixture();
        let groups = group_by_district(&layer, "DISTRITO_L", "SECCION");
        let districts: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(districts, vec![FieldKey::Num(1), FieldKey::Num(2)]);
        let first: Vec<_> = groups[&FieldKey::Num(1)]
            .iter()
            .map(|(s, _)| s.clone())
            .collect();
        assert_eq!(first, vec![FieldKey::Num(101), FieldKey::Num(102)]);
    }

    #[test]
    fn sampling_is_deterministic_and_ordered() {
        assert_eq!(sampled_indices(3, 6), vec![0, 1, 2]);

        let first = sampled_indices(100, 10);
        let second = sampled_indices(100, 10);
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(first.iter().all(|&i| i < 100));
    }

    #[test]
    fn summary_counts_and_sums() {
        let (sections, cols) = section_fixture();
        let blocks = layer("manzanas", vec![feature(square(0.0, 0.0, 0.1), &[])]);
        let summary = summarize(&sections, &cols, Some(&blocks));
        assert_eq!(summary.sections, 3);
        assert_eq!(summary.blocks_clipped, Some(1));
        assert_eq!(summary.voters_sum, Some(1050));
        assert_eq!(summary.block_count_sum, None);
        assert_eq!(summary.pop18_sum, None);

        let without_blocks = summarize(&sections, &cols, None);
        assert_eq!(without_blocks.blocks_clipped, None);
    }
}
