//! Small geometry helpers shared by the KML writer, the map renderer and the
//! block/section spatial join.

use geo::{BoundingRect, InteriorPoint, LineString, MultiPolygon, Rect};

use crate::types::Feature;

/// Area-weighted centroid of a ring (shoelace formula). Degenerate rings with
/// near-zero area fall back to the vertex mean so label anchors never vanish
/// on sliver polygons. Returns `None` only for an empty ring.
pub fn ring_centroid(ring: &LineString<f64>) -> Option<(f64, f64)> {
    let coords = &ring.0;
    if coords.is_empty() {
        return None;
    }

    let n = coords.len();
    let mut area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..n {
        let a = coords[i];
        let b = coords[(i + 1) % n];
        let cross = a.x * b.y - b.x * a.y;
        area += cross;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }

    if area.abs() < 1e-9 {
        let inv = 1.0 / n as f64;
        let sx: f64 = coords.iter().map(|c| c.x).sum();
        let sy: f64 = coords.iter().map(|c| c.y).sum();
        return Some((sx * inv, sy * inv));
    }

    area *= 0.5;
    Some((cx / (6.0 * area), cy / (6.0 * area)))
}

/// Anchor for a placemark label: centroid of the first polygon's outer ring.
pub fn label_point(geometry: &MultiPolygon<f64>) -> Option<(f64, f64)> {
    geometry.0.first().and_then(|p| ring_centroid(p.exterior()))
}

/// A point guaranteed to fall inside the geometry, for on-map labels where a
/// centroid may land outside a concave section.
pub fn interior_point(geometry: &MultiPolygon<f64>) -> Option<(f64, f64)> {
    geometry.interior_point().map(|p| (p.x(), p.y()))
}

/// Combined bounding rectangle of a feature slice. `None` when no feature has
/// any geometry.
pub fn layer_bounds(features: &[Feature]) -> Option<Rect<f64>> {
    features
        .iter()
        .filter_map(|f| f.geometry.bounding_rect())
        .reduce(|acc, r| {
            Rect::new(
                geo::coord! {
                    x: acc.min().x.min(r.min().x),
                    y: acc.min().y.min(r.min().y),
                },
                geo::coord! {
                    x: acc.max().x.max(r.max().x),
                    y: acc.max().y.max(r.max().y),
                },
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};
    use std::collections::BTreeMap;

    fn feature(geometry: MultiPolygon<f64>) -> Feature {
        Feature {
            geometry,
            attrs: BTreeMap::new(),
        }
    }

    #[test]
    fn unit_square_centroid() {
        let ring = LineString::from(vec![
            (0.0, 0.0),
            (1.0, 0.0),
            (1.0, 1.0),
            (0.0, 1.0),
            (0.0, 0.0),
        ]);
        let (x, y) = ring_centroid(&ring).expect("square has a centroid");
        assert!((x - 0.5).abs() < 1e-12);
        assert!((y - 0.5).abs() < 1e-12);
    }

    #[test]
    fn l_shape_centroid_is_area_weighted() {
        // Two unit-ish rectangles: [0,2]x[0,1] and [0,1]x[1,2]. The combined
        // centroid is (2.5/3, 2.5/3), not the vertex mean.
        let ring = LineString::from(vec![
            (0.0, 0.0),
            (2.0, 0.0),
            (2.0, 1.0),
            (1.0, 1.0),
            (1.0, 2.0),
            (0.0, 2.0),
            (0.0, 0.0),
        ]);
        let (x, y) = ring_centroid(&ring).expect("L shape has a centroid");
        assert!((x - 2.5 / 3.0).abs() < 1e-12, "x was {x}");
        assert!((y - 2.5 / 3.0).abs() < 1e-12, "y was {y}");
    }

    #[test]
    fn winding_direction_does_not_matter() {
        let ccw = LineString::from(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 2.0), (0.0, 2.0)]);
        let cw = LineString::from(vec![(0.0, 0.0), (0.0, 2.0), (4.0, 2.0), (4.0, 0.0)]);
        assert_eq!(ring_centroid(&ccw), ring_centroid(&cw));
    }

    #[test]
    fn degenerate_ring_falls_back_to_vertex_mean() {
        let collinear = LineString::from(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]);
        let (x, y) = ring_centroid(&collinear).expect("fallback still yields a point");
        assert!((x - 1.0).abs() < 1e-12);
        assert!((y - 1.0).abs() < 1e-12);

        let empty = LineString::new(Vec::new());
        assert_eq!(ring_centroid(&empty), None);
    }

    #[test]
    fn label_point_uses_first_polygon() {
        let multi = MultiPolygon::new(vec![
            polygon![
                (x: 10.0, y: 10.0),
                (x: 12.0, y: 10.0),
                (x: 12.0, y: 12.0),
                (x: 10.0, y: 12.0),
            ],
            polygon![
                (x: 50.0, y: 50.0),
                (x: 51.0, y: 50.0),
                (x: 51.0, y: 51.0),
                (x: 50.0, y: 51.0),
            ],
        ]);
        let (x, y) = label_point(&multi).expect("non-empty geometry");
        assert!((x - 11.0).abs() < 1e-9);
        assert!((y - 11.0).abs() < 1e-9);
    }

    #[test]
    fn interior_point_lands_inside() {
        let multi = MultiPolygon::new(vec![polygon![
            (x: -99.2, y: 19.3),
            (x: -99.0, y: 19.3),
            (x: -99.0, y: 19.5),
            (x: -99.2, y: 19.5),
        ]]);
        let (x, y) = interior_point(&multi).expect("non-empty geometry");
        assert!((-99.2..=-99.0).contains(&x));
        assert!((19.3..=19.5).contains(&y));
    }

    #[test]
    fn layer_bounds_merges_features() {
        let features = vec![
            feature(MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0),
                (x: 1.0, y: 0.0),
                (x: 1.0, y: 1.0),
                (x: 0.0, y: 1.0),
            ]])),
            feature(MultiPolygon::new(vec![polygon![
                (x: 5.0, y: -2.0),
                (x: 6.0, y: -2.0),
                (x: 6.0, y: 3.0),
                (x: 5.0, y: 3.0),
            ]])),
        ];
        let rect = layer_bounds(&features).expect("two features with geometry");
        assert_eq!(rect.min().x, 0.0);
        assert_eq!(rect.min().y, -2.0);
        assert_eq!(rect.max().x, 6.0);
        assert_eq!(rect.max().y, 3.0);

        assert!(layer_bounds(&[]).is_none());
    }
}
