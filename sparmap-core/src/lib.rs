//! Core geometry primitives for the sparmap workspace.
//!
//! This crate has no I/O and no external dependencies; it provides the
//! numeric building blocks the cache, session and renderer crates share:
//!
//! - [`geo`]: points, boxes, web-Mercator projection and polyline math
//! - [`mcoord`]: the delta-compressed 16-bit coordinate codec used by the
//!   geometry cache's line store
//! - [`wkt`]: a micro-parser for the WKT subset the backend emits
//! - [`grid`]: a uniform spatial grid over web-Mercator space

pub mod geo;
pub mod grid;
pub mod mcoord;
pub mod wkt;

pub use geo::{FBox, FLine, FPoint, Point};
pub use grid::Grid;
