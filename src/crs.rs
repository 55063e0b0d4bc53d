//! Sidecar `.prj` handling: parse the ESRI WKT and project shapefile
//! coordinates back to WGS84 lon/lat for Google Earth and Leaflet.
//!
//! INE distributes secciones in UTM zones 11N-16N (Transverse Mercator) and
//! INEGI uses a national Lambert Conformal Conic; both inverses are computed
//! from the spheroid and parameters found in the WKT. Datum shifts between
//! ITRF realizations and WGS84 are centimeter-level and ignored.

use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone)]
pub enum CrsTransform {
    /// Coordinates pass through unchanged: the layer is already lon/lat, or
    /// the `.prj` could not be interpreted and the caller chose to continue.
    Identity,
    TransverseMercator(TransverseMercator),
    LambertConformalConic(LambertConformalConic),
}

impl CrsTransform {
    /// Build a transform from the contents of a `.prj` file.
    pub fn from_prj(wkt: &str) -> Result<CrsTransform> {
        let trimmed = wkt.trim_start_matches('\u{feff}').trim();
        let root = parse_wkt(trimmed)?;
        match root.keyword.to_ascii_uppercase().as_str() {
            "GEOGCS" | "GEOGCRS" => Ok(CrsTransform::Identity),
            "PROJCS" => projected_transform(&root),
            other => bail!("unsupported coordinate system kind: {other}"),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, CrsTransform::Identity)
    }

    /// Projected (x, y) to (lon, lat) in degrees.
    pub fn to_wgs84(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            CrsTransform::Identity => (x, y),
            CrsTransform::TransverseMercator(tm) => tm.inverse(x, y),
            CrsTransform::LambertConformalConic(lcc) => lcc.inverse(x, y),
        }
    }
}

fn projected_transform(root: &WktNode) -> Result<CrsTransform> {
    let projection = root
        .find("PROJECTION")
        .and_then(WktNode::first_str)
        .context("PROJCS carries no PROJECTION node")?
        .to_ascii_lowercase();

    let spheroid = root
        .find("GEOGCS")
        .and_then(|g| g.find("DATUM"))
        .and_then(|d| d.find("SPHEROID"))
        .context("PROJCS carries no SPHEROID node")?;
    let a = spheroid
        .num_at(0)
        .context("SPHEROID without semi-major axis")?;
    let inv_f = spheroid
        .num_at(1)
        .context("SPHEROID without inverse flattening")?;

    // False easting/northing and the incoming coordinates share the PROJCS
    // linear unit.
    let unit = root
        .find("UNIT")
        .and_then(|u| u.num_at(0))
        .unwrap_or(1.0);

    let param = |name: &str| -> f64 {
        root.nodes("PARAMETER")
            .find(|p| {
                p.first_str()
                    .map(|s| s.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
            .and_then(|p| p.num_at(0))
            .unwrap_or(0.0)
    };

    match projection.as_str() {
        "transverse_mercator" | "gauss_kruger" => {
            let scale = root
                .nodes("PARAMETER")
                .find(|p| {
                    p.first_str()
                        .map(|s| s.eq_ignore_ascii_case("scale_factor"))
                        .unwrap_or(false)
                })
                .and_then(|p| p.num_at(0))
                .unwrap_or(1.0);
            Ok(CrsTransform::TransverseMercator(TransverseMercator::new(
                a,
                inv_f,
                scale,
                param("central_meridian"),
                param("latitude_of_origin"),
                param("false_easting") * unit,
                param("false_northing") * unit,
                unit,
            )))
        }
        "lambert_conformal_conic" | "lambert_conformal_conic_2sp" => {
            let sp1 = param("standard_parallel_1");
            let sp2 = {
                let v = param("standard_parallel_2");
                if v == 0.0 && sp1 != 0.0 {
                    sp1
                } else {
                    v
                }
            };
            Ok(CrsTransform::LambertConformalConic(
                LambertConformalConic::new(
                    a,
                    inv_f,
                    sp1,
                    sp2,
                    param("latitude_of_origin"),
                    param("central_meridian"),
                    param("false_easting") * unit,
                    param("false_northing") * unit,
                    unit,
                ),
            ))
        }
        other => bail!("unsupported projection: {other}"),
    }
}

/// Meridional arc length from the equator (Snyder 3-21).
fn meridional_arc(a: f64, e2: f64, phi: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    a * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

/// UTM-style Transverse Mercator, inverse direction (Snyder 8-17..8-25).
#[derive(Debug, Clone)]
pub struct TransverseMercator {
    a: f64,
    e2: f64,
    ep2: f64,
    e1: f64,
    k0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
    m0: f64,
    unit: f64,
}

impl TransverseMercator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: f64,
        inv_f: f64,
        k0: f64,
        lon0_deg: f64,
        lat0_deg: f64,
        false_easting: f64,
        false_northing: f64,
        unit: f64,
    ) -> Self {
        let f = 1.0 / inv_f;
        let e2 = f * (2.0 - f);
        let ep2 = e2 / (1.0 - e2);
        let sqrt1me2 = (1.0 - e2).sqrt();
        let e1 = (1.0 - sqrt1me2) / (1.0 + sqrt1me2);
        let m0 = meridional_arc(a, e2, lat0_deg.to_radians());
        TransverseMercator {
            a,
            e2,
            ep2,
            e1,
            k0,
            lon0: lon0_deg.to_radians(),
            false_easting,
            false_northing,
            m0,
            unit,
        }
    }

    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let x = x * self.unit - self.false_easting;
        let y = y * self.unit - self.false_northing;

        let m = self.m0 + y / self.k0;
        let e2 = self.e2;
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let mu = m / (self.a * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

        let e1 = self.e1;
        let phi1 = mu
            + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
            + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
            + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
            + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

        let sin1 = phi1.sin();
        let cos1 = phi1.cos();
        let tan1 = phi1.tan();
        let c1 = self.ep2 * cos1 * cos1;
        let t1 = tan1 * tan1;
        let n1 = self.a / (1.0 - e2 * sin1 * sin1).sqrt();
        let r1 = self.a * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
        let d = x / (n1 * self.k0);

        let phi = phi1
            - (n1 * tan1 / r1)
                * (d * d / 2.0
                    - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * self.ep2)
                        * d.powi(4)
                        / 24.0
                    + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                        - 252.0 * self.ep2
                        - 3.0 * c1 * c1)
                        * d.powi(6)
                        / 720.0);
        let lam = self.lon0
            + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
                + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * self.ep2 + 24.0 * t1 * t1)
                    * d.powi(5)
                    / 120.0)
                / cos1;

        (lam.to_degrees(), phi.to_degrees())
    }
}

/// Lambert Conformal Conic with two standard parallels, inverse direction
/// (Snyder 15-1..15-11).
#[derive(Debug, Clone)]
pub struct LambertConformalConic {
    a: f64,
    e: f64,
    n: f64,
    big_f: f64,
    rho0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
    unit: f64,
}

impl LambertConformalConic {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: f64,
        inv_f: f64,
        sp1_deg: f64,
        sp2_deg: f64,
        lat0_deg: f64,
        lon0_deg: f64,
        false_easting: f64,
        false_northing: f64,
        unit: f64,
    ) -> Self {
        let f = 1.0 / inv_f;
        let e2 = f * (2.0 - f);
        let e = e2.sqrt();
        let phi1 = sp1_deg.to_radians();
        let phi2 = sp2_deg.to_radians();
        let phi0 = lat0_deg.to_radians();

        let m = |phi: f64| phi.cos() / (1.0 - e2 * phi.sin() * phi.sin()).sqrt();
        let t = |phi: f64| {
            ((std::f64::consts::FRAC_PI_4 - phi / 2.0).tan())
                / ((1.0 - e * phi.sin()) / (1.0 + e * phi.sin())).powf(e / 2.0)
        };

        let m1 = m(phi1);
        let t1 = t(phi1);
        let n = if (phi1 - phi2).abs() < 1e-10 {
            phi1.sin()
        } else {
            (m1.ln() - m(phi2).ln()) / (t1.ln() - t(phi2).ln())
        };
        let big_f = m1 / (n * t1.powf(n));
        let rho0 = a * big_f * t(phi0).powf(n);

        LambertConformalConic {
            a,
            e,
            n,
            big_f,
            rho0,
            lon0: lon0_deg.to_radians(),
            false_easting,
            false_northing,
            unit,
        }
    }

    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let x = x * self.unit - self.false_easting;
        let y = y * self.unit - self.false_northing;

        let sign = if self.n < 0.0 { -1.0 } else { 1.0 };
        let dy = self.rho0 - y;
        let rho = sign * (x * x + dy * dy).sqrt();
        let theta = (sign * x).atan2(sign * dy);
        let t = (rho / (self.a * self.big_f)).powf(1.0 / self.n);

        // Snyder 7-9, iterated.
        let mut phi = std::f64::consts::FRAC_PI_2 - 2.0 * t.atan();
        for _ in 0..8 {
            let es = self.e * phi.sin();
            let next = std::f64::consts::FRAC_PI_2
                - 2.0 * (t * ((1.0 - es) / (1.0 + es)).powf(self.e / 2.0)).atan();
            if (next - phi).abs() < 1e-12 {
                phi = next;
                break;
            }
            phi = next;
        }

        let lam = theta / self.n + self.lon0;
        (lam.to_degrees(), phi.to_degrees())
    }
}

// ---------------------------------------------------------------------------
// Minimal WKT reader: KEYWORD["str", 1.0, NESTED[...]] trees, enough for the
// PROJCS/GEOGCS files shipped alongside INE/INEGI shapefiles.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum WktItem {
    Node(WktNode),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone)]
struct WktNode {
    keyword: String,
    items: Vec<WktItem>,
}

impl WktNode {
    /// First direct child node with the given keyword (case-insensitive).
    fn find<'a>(&'a self, keyword: &'a str) -> Option<&'a WktNode> {
        self.nodes(keyword).next()
    }

    fn nodes<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a WktNode> {
        self.items.iter().filter_map(move |item| match item {
            WktItem::Node(n) if n.keyword.eq_ignore_ascii_case(keyword) => Some(n),
            _ => None,
        })
    }

    fn first_str(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            WktItem::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// nth numeric item (string items don't count).
    fn num_at(&self, index: usize) -> Option<f64> {
        self.items
            .iter()
            .filter_map(|item| match item {
                WktItem::Num(v) => Some(*v),
                _ => None,
            })
            .nth(index)
    }
}

fn parse_wkt(input: &str) -> Result<WktNode> {
    let mut cursor = Cursor {
        bytes: input.as_bytes(),
        pos: 0,
    };
    cursor.skip_ws();
    let node = cursor.node()?;
    Ok(node)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        if self.pos == start {
            bail!("expected identifier at offset {}", start);
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn quoted(&mut self) -> Result<String> {
        self.pos += 1; // opening quote
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'"' {
                let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        bail!("unterminated string in WKT");
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b) if b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        raw.parse::<f64>()
            .map_err(|_| anyhow!("bad number '{raw}' in WKT"))
    }

    fn node(&mut self) -> Result<WktNode> {
        let keyword = self.ident()?;
        self.skip_ws();
        if self.peek() != Some(b'[') {
            bail!("expected '[' after {keyword}");
        }
        self.pos += 1;

        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => bail!("unterminated {keyword} node"),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'"') => items.push(WktItem::Str(self.quoted()?)),
                Some(b) if b.is_ascii_digit() || b == b'-' || b == b'+' || b == b'.' => {
                    items.push(WktItem::Num(self.number()?));
                }
                Some(_) => {
                    // Identifier: a nested node if '[' follows, otherwise a
                    // bare token (AXIS directions and the like).
                    let save = self.pos;
                    let ident = self.ident()?;
                    self.skip_ws();
                    if self.peek() == Some(b'[') {
                        self.pos = save;
                        items.push(WktItem::Node(self.node()?));
                    } else {
                        items.push(WktItem::Str(ident));
                    }
                }
            }
        }
        Ok(WktNode { keyword, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UTM14_WKT: &str = r#"PROJCS["WGS_1984_UTM_Zone_14N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["False_Easting",500000.0],PARAMETER["False_Northing",0.0],PARAMETER["Central_Meridian",-99.0],PARAMETER["Scale_Factor",0.9996],PARAMETER["Latitude_Of_Origin",0.0],UNIT["Meter",1.0]]"#;

    const MEXICO_LCC_WKT: &str = r#"PROJCS["MEXICO_ITRF_2008_LCC",GEOGCS["GCS_MEXICO_ITRF_2008",DATUM["D_MEXICO_ITRF_2008",SPHEROID["GRS_1980",6378137.0,298.257222101]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Lambert_Conformal_Conic"],PARAMETER["False_Easting",2500000.0],PARAMETER["False_Northing",0.0],PARAMETER["Central_Meridian",-102.0],PARAMETER["Standard_Parallel_1",17.5],PARAMETER["Standard_Parallel_2",29.5],PARAMETER["Latitude_Of_Origin",12.0],UNIT["Meter",1.0]]"#;

    const GEOGRAPHIC_WKT: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

    /// Forward Transverse Mercator (Snyder 8-9..8-13), used to check the
    /// inverse by round-tripping.
    fn tm_forward(
        a: f64,
        inv_f: f64,
        k0: f64,
        lon0_deg: f64,
        lat0_deg: f64,
        fe: f64,
        fln: f64,
        lon_deg: f64,
        lat_deg: f64,
    ) -> (f64, f64) {
        let f = 1.0 / inv_f;
        let e2 = f * (2.0 - f);
        let ep2 = e2 / (1.0 - e2);
        let phi = lat_deg.to_radians();
        let lam = lon_deg.to_radians();
        let lam0 = lon0_deg.to_radians();

        let sinp = phi.sin();
        let cosp = phi.cos();
        let tanp = phi.tan();
        let n = a / (1.0 - e2 * sinp * sinp).sqrt();
        let t = tanp * tanp;
        let c = ep2 * cosp * cosp;
        let aa = (lam - lam0) * cosp;
        let m = meridional_arc(a, e2, phi);
        let m0 = meridional_arc(a, e2, lat0_deg.to_radians());

        let x = fe
            + k0 * n
                * (aa + (1.0 - t + c) * aa.powi(3) / 6.0
                    + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * aa.powi(5) / 120.0);
        let y = fln
            + k0 * (m - m0
                + n * tanp
                    * (aa * aa / 2.0
                        + (5.0 - t + 9.0 * c + 4.0 * c * c) * aa.powi(4) / 24.0
                        + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * aa.powi(6)
                            / 720.0));
        (x, y)
    }

    /// Forward LCC (Snyder 15-1..15-4) for round-trip checks.
    fn lcc_forward(lcc: &LambertConformalConic, lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let phi = lat_deg.to_radians();
        let lam = lon_deg.to_radians();
        let t = ((std::f64::consts::FRAC_PI_4 - phi / 2.0).tan())
            / ((1.0 - lcc.e * phi.sin()) / (1.0 + lcc.e * phi.sin())).powf(lcc.e / 2.0);
        let rho = lcc.a * lcc.big_f * t.powf(lcc.n);
        let theta = lcc.n * (lam - lcc.lon0);
        (
            lcc.false_easting + rho * theta.sin(),
            lcc.false_northing + lcc.rho0 - rho * theta.cos(),
        )
    }

    #[test]
    fn geographic_wkt_is_identity() {
        let transform = CrsTransform::from_prj(GEOGRAPHIC_WKT).expect("geographic WKT parses");
        assert!(transform.is_identity());
        assert_eq!(transform.to_wgs84(-99.5, 19.25), (-99.5, 19.25));
    }

    #[test]
    fn utm14_origin_maps_to_central_meridian() {
        let transform = CrsTransform::from_prj(UTM14_WKT).expect("UTM WKT parses");
        let (lon, lat) = transform.to_wgs84(500_000.0, 0.0);
        assert!((lon - -99.0).abs() < 1e-9, "lon was {lon}");
        assert!(lat.abs() < 1e-9, "lat was {lat}");
    }

    #[test]
    fn utm14_round_trips_mexican_coordinates() {
        let transform = CrsTransform::from_prj(UTM14_WKT).expect("UTM WKT parses");
        for &(lon, lat) in &[(-99.5, 19.3), (-98.2, 21.7), (-100.9, 17.9)] {
            let (x, y) = tm_forward(
                6378137.0,
                298.257223563,
                0.9996,
                -99.0,
                0.0,
                500_000.0,
                0.0,
                lon,
                lat,
            );
            let (lon2, lat2) = transform.to_wgs84(x, y);
            assert!((lon2 - lon).abs() < 1e-7, "lon {lon} came back as {lon2}");
            assert!((lat2 - lat).abs() < 1e-7, "lat {lat} came back as {lat2}");
        }
    }

    #[test]
    fn mexico_lcc_origin_and_round_trip() {
        let transform = CrsTransform::from_prj(MEXICO_LCC_WKT).expect("LCC WKT parses");
        let (lon, lat) = transform.to_wgs84(2_500_000.0, 0.0);
        assert!((lon - -102.0).abs() < 1e-9, "lon was {lon}");
        assert!((lat - 12.0).abs() < 1e-9, "lat was {lat}");

        let lcc = match &transform {
            CrsTransform::LambertConformalConic(lcc) => lcc,
            other => panic!("expected LCC transform, got {other:?}"),
        };
        for &(lon, lat) in &[(-99.1, 19.4), (-106.4, 23.2), (-89.6, 20.97)] {
            let (x, y) = lcc_forward(lcc, lon, lat);
            let (lon2, lat2) = transform.to_wgs84(x, y);
            assert!((lon2 - lon).abs() < 1e-7, "lon {lon} came back as {lon2}");
            assert!((lat2 - lat).abs() < 1e-7, "lat {lat} came back as {lat2}");
        }
    }

    #[test]
    fn unreadable_wkt_is_an_error() {
        assert!(CrsTransform::from_prj("definitely not wkt").is_err());
        assert!(CrsTransform::from_prj("PROJCS[\"broken\"").is_err());
    }

    #[test]
    fn unsupported_projection_is_an_error() {
        let wkt = UTM14_WKT.replace("Transverse_Mercator", "Albers");
        assert!(CrsTransform::from_prj(&wkt).is_err());
    }
}
