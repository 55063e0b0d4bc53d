//! Electoral cartography toolkit for INE/INEGI shapefile bundles: filters
//! secciones and manzanas, converts them to per-district KMZ, exports tables
//! and maps, and serves an interactive viewer.

pub mod color;
pub mod config;
pub mod crs;
pub mod data;
pub mod export;
pub mod geometry;
pub mod kml;
pub mod pipeline;
pub mod processing;
pub mod render;
pub mod server;
pub mod types;
pub mod workspace;
