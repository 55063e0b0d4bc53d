//! Serves the filtered cartography over HTTP: the map page at the root, the
//! GeoJSON the page reads, and a point lookup answering "which section
//! contains this coordinate".

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use geo::{BoundingRect, Contains, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

use crate::config::AppConfig;
use crate::export;
use crate::render;
use crate::types::{Layer, SectionColumns};

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

pub struct AppState {
    page: String,
    sections: Layer,
    sections_geojson: String,
    blocks_geojson: Option<String>,
    tree: RTree<SectionEnvelope>,
}

impl AppState {
    /// Render the page and GeoJSON once and index the section envelopes; the
    /// handlers only clone strings and walk the tree.
    pub fn build(
        config: &AppConfig,
        sections: Layer,
        cols: &SectionColumns,
        blocks: Option<Layer>,
    ) -> Result<AppState> {
        let page = render::map_page(
            &sections,
            cols,
            blocks.as_ref(),
            &config.map,
            config.output.kmz_max_blocks,
        )?;
        let sections_geojson =
            serde_json::to_string(&export::feature_collection(&sections, |_| Vec::new()))
                .context("serializing sections GeoJSON")?;
        let blocks_geojson = match &blocks {
            Some(layer) => Some(
                serde_json::to_string(&export::feature_collection(layer, |_| Vec::new()))
                    .context("serializing blocks GeoJSON")?,
            ),
            None => None,
        };

        let entries: Vec<SectionEnvelope> = sections
            .features
            .iter()
            .enumerate()
            .filter_map(|(index, feature)| {
                feature.geometry.bounding_rect().map(|r| SectionEnvelope {
                    index,
                    envelope: AABB::from_corners(
                        [r.min().x, r.min().y],
                        [r.max().x, r.max().y],
                    ),
                })
            })
            .collect();
        let tree = RTree::bulk_load(entries);

        Ok(AppState {
            page,
            sections,
            sections_geojson,
            blocks_geojson,
            tree,
        })
    }
}

pub async fn start_server(
    config: &AppConfig,
    sections: Layer,
    cols: &SectionColumns,
    blocks: Option<Layer>,
) -> Result<()> {
    info!("indexing {} sections for lookup", sections.len());
    let state = Arc::new(AppState::build(config, sections, cols, blocks)?);

    let mut app = Router::new()
        .route("/", get(map_page))
        .route("/data/sections.geojson", get(sections_geojson))
        .route("/data/blocks.geojson", get(blocks_geojson))
        .route("/api/section", get(section_lookup));
    if config.output.dir.is_dir() {
        app = app.nest_service("/exports", ServeDir::new(&config.output.dir));
    }
    let app = app.layer(CorsLayer::permissive()).with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn map_page(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.page.clone())
}

fn geojson_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/geo+json")], body).into_response()
}

async fn sections_geojson(State(state): State<Arc<AppState>>) -> Response {
    geojson_response(state.sections_geojson.clone())
}

async fn blocks_geojson(State(state): State<Arc<AppState>>) -> Response {
    match &state.blocks_geojson {
        Some(body) => geojson_response(body.clone()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct LookupParams {
    lat: f64,
    lon: f64,
}

/// Attributes of the section containing the queried point, `null` when the
/// point falls outside every section.
async fn section_lookup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> Json<Option<Map<String, Value>>> {
    let point = Point::new(params.lon, params.lat);
    let found = state
        .tree
        .locate_in_envelope_intersecting(&AABB::from_point([params.lon, params.lat]))
        .find_map(|entry| {
            let feature = &state.sections.features[entry.index];
            if feature.geometry.contains(&point) {
                Some(
                    feature
                        .attrs
                        .iter()
                        .filter(|(_, value)| !value.is_null())
                        .map(|(key, value)| (key.clone(), export::attr_to_json(value)))
                        .collect(),
                )
            } else {
                None
            }
        });
    Json(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttrValue, Feature};
    use geo::{polygon, MultiPolygon};
    use std::collections::{BTreeMap, BTreeSet};

    fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
        ]])
    }

    fn feature(geometry: MultiPolygon<f64>, attrs: &[(&str, AttrValue)]) -> Feature {
        let attrs: BTreeMap<String, AttrValue> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Feature { geometry, attrs }
    }

    fn layer(name: &str, features: Vec<Feature>) -> Layer {
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

    fn test_state(blocks: Option<Layer>) -> Arc<AppState> {
        let config: AppConfig = toml::from_str(
            r#"
            [input]
            sections = "secciones.shp"
            "#,
        )
        .expect("config parses");
        let sections = layer(
            "secciones",
            vec![
                feature(
                    square(-99.25, 19.25, 0.25),
                    &[
                        ("SECCION", AttrValue::Int(101)),
                        ("NOMBRE", AttrValue::Null),
                    ],
                ),
                feature(
                    square(-99.0, 19.25, 0.25),
                    &[("SECCION", AttrValue::Int(102))],
                ),
            ],
        );
        let cols = SectionColumns {
            section: Some("SECCION".into()),
            ..Default::default()
        };
        Arc::new(AppState::build(&config, sections, &cols, blocks).expect("state builds"))
    }

    #[tokio::test]
    async fn lookup_finds_the_containing_section() {
        let state = test_state(None);
        let Json(found) = section_lookup(
            State(state),
            Query(LookupParams {
                lat: 19.3,
                lon: -99.1,
            }),
        )
        .await;
        let attrs = found.expect("point lies inside a section");
        assert_eq!(attrs.get("SECCION"), Some(&Value::from(101)));
        // Nulls are not echoed back.
        assert!(!attrs.contains_key("NOMBRE"));
    }

    #[tokio::test]
    async fn lookup_outside_every_section_is_null() {
        let state = test_state(None);
        let Json(found) = section_lookup(
            State(state),
            Query(LookupParams {
                lat: 25.0,
                lon: -110.0,
            }),
        )
        .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn blocks_endpoint_mirrors_input() {
        let state = test_state(None);
        let response = blocks_geojson(State(state)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let blocks = layer(
            "manzanas",
            vec![feature(
                square(-99.2, 19.3, 0.01),
                &[("CVE_MZA", AttrValue::Int(1))],
            )],
        );
        let state = test_state(Some(blocks));
        let response = blocks_geojson(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn root_serves_the_map_page() {
        let state = test_state(None);
        let Html(page) = map_page(State(state)).await;
        assert!(page.contains("leaflet"));
        assert!(page.contains(r#""SECCION":101"#));
    }
}
