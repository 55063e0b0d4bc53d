//! Fill colors for sections and districts, plus conversions between the
//! `#rrggbb` form Leaflet wants and the `aabbggrr` form KML wants.

use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use rand::Rng;

use crate::types::FieldKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

pub const fn rgb(r: u8, g: u8, b: u8) -> Rgb {
    Rgb { r, g, b }
}

/// INE-style greens used when coloring whole districts, cycled by district
/// position.
pub const DISTRICT_PALETTE: [Rgb; 8] = [
    rgb(166, 219, 160),
    rgb(199, 233, 192),
    rgb(161, 217, 155),
    rgb(116, 196, 118),
    rgb(65, 171, 93),
    rgb(35, 139, 69),
    rgb(0, 109, 44),
    rgb(0, 90, 50),
];

/// Boundary stroke used in the per-district KMZ.
pub const OUTLINE_BROWN: Rgb = rgb(90, 60, 40);

pub fn district_fill(position: usize) -> Rgb {
    DISTRICT_PALETTE[position % DISTRICT_PALETTE.len()]
}

/// Stable per-section fill: hue walks the wheel in 47 degree steps keyed by
/// the section number, so neighbouring sections get visibly different colors
/// and the same section is colored identically on every run.
pub fn section_color(key: &FieldKey) -> Rgb {
    let v = match key {
        FieldKey::Num(n) => *n,
        FieldKey::Text(s) => {
            let mut hasher = FnvHasher::default();
            s.hash(&mut hasher);
            (hasher.finish() % 100_000) as i64
        }
    };
    let h = (v * 47).rem_euclid(360) as f64;
    hsl_to_rgb(h, 0.65, 0.55)
}

pub fn random_color<R: Rng>(rng: &mut R) -> Rgb {
    Rgb {
        r: rng.gen_range(80..=255),
        g: rng.gen_range(80..=255),
        b: rng.gen_range(80..=255),
    }
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> Rgb {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r1, g1, b1) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    Rgb {
        r: ((r1 + m) * 255.0) as u8,
        g: ((g1 + m) * 255.0) as u8,
        b: ((b1 + m) * 255.0) as u8,
    }
}

pub fn to_hex(color: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
}

/// KML stores colors as aabbggrr.
pub fn to_kml(color: Rgb, alpha: u8) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", alpha, color.b, color.g, color.r)
}

/// Parse `#rrggbb` (hash optional). Malformed values render neutral gray
/// rather than failing the export.
pub fn parse_hex(hex: &str) -> Rgb {
    let h = hex.trim_start_matches('#');
    let gray = rgb(0x99, 0x99, 0x99);
    if h.len() != 6 || !h.is_ascii() {
        return gray;
    }
    let byte = |i: usize| u8::from_str_radix(&h[i..i + 2], 16);
    match (byte(0), byte(2), byte(4)) {
        (Ok(r), Ok(g), Ok(b)) => rgb(r, g, b),
        _ => gray,
    }
}

/// Inverse of [`to_kml`]; malformed input decodes as opaque gray.
pub fn parse_kml(kml: &str) -> (Rgb, u8) {
    let fallback = (rgb(0x99, 0x99, 0x99), 255);
    if kml.len() != 8 || !kml.is_ascii() {
        return fallback;
    }
    let byte = |i: usize| u8::from_str_radix(&kml[i..i + 2], 16);
    match (byte(0), byte(2), byte(4), byte(6)) {
        (Ok(a), Ok(b), Ok(g), Ok(r)) => (rgb(r, g, b), a),
        _ => fallback,
    }
}
