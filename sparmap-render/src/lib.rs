//! Heatmap rasteriser.
//!
//! Renders a session's three spatial grids into a PNG tile for an
//! arbitrary bbox/size. Points and line sample footprints stamp a
//! Gaussian kernel into a float accumulator; line bounding boxes add a
//! diffuse rectangular overlay. The accumulator is log-normalised and
//! mapped through a colour ramp. Individual line vertex streams are never
//! read — the sample grid already encodes the sub-cell footprint — so
//! per-tile work is bounded by the visible cells and their samples.

pub mod ramp;

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};
use thiserror::Error;

use sparmap_core::geo::{FBox, FPoint};
use sparmap_session::{Requestor, SessionError};

pub use ramp::ColorRamp;

/// Largest accepted tile edge.
pub const MAX_TILE_EDGE: u32 = 8192;

/// Weight added per pixel of a line's bounding-box overlay.
const BBOX_OVERLAY_WEIGHT: f32 = 0.05;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid render request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("PNG encoding failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// One tile request in web-Mercator space.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub bbox: FBox,
    pub width: u32,
    pub height: u32,
}

/// Rasterises session grids into PNG tiles.
pub struct HeatmapRenderer {
    ramp: ColorRamp,
    kernel: Vec<f32>,
    kernel_r: i32,
}

impl HeatmapRenderer {
    pub fn new() -> Self {
        Self::with_ramp(ColorRamp::heat())
    }

    pub fn with_ramp(ramp: ColorRamp) -> Self {
        let kernel_r = 4i32;
        let sigma = 1.6f32;
        let side = (2 * kernel_r + 1) as usize;
        let mut kernel = Vec::with_capacity(side * side);
        for dy in -kernel_r..=kernel_r {
            for dx in -kernel_r..=kernel_r {
                let d2 = (dx * dx + dy * dy) as f32;
                kernel.push((-d2 / (2.0 * sigma * sigma)).exp());
            }
        }
        Self {
            ramp,
            kernel,
            kernel_r,
        }
    }

    /// Render a PNG tile for `view` from the session's grids.
    pub fn render(&self, req: &Requestor, view: &RenderRequest) -> Result<Vec<u8>> {
        if view.width == 0
            || view.height == 0
            || view.width > MAX_TILE_EDGE
            || view.height > MAX_TILE_EDGE
        {
            return Err(RenderError::Invalid(format!(
                "tile size {}x{} out of range",
                view.width, view.height
            )));
        }
        if !view.bbox.is_valid() || view.bbox.width() <= 0.0 || view.bbox.height() <= 0.0 {
            return Err(RenderError::Invalid("degenerate bbox".into()));
        }

        let w = view.width as usize;
        let h = view.height as usize;
        let sx = w as f64 / view.bbox.width() as f64;
        let sy = h as f64 / view.bbox.height() as f64;
        let mut acc = vec![0f32; w * h];

        // widen the grid walk so kernels of just-off-tile objects still
        // reach into the tile
        let reach_x = (self.kernel_r as f64 / sx) as f32;
        let reach_y = (self.kernel_r as f64 / sy) as f32;
        let walk = FBox::new(
            FPoint::new(view.bbox.ll.x - reach_x, view.bbox.ll.y - reach_y),
            FPoint::new(view.bbox.ur.x + reach_x, view.bbox.ur.y + reach_y),
        );

        let stamp = |acc: &mut [f32], p: FPoint, weight: f32| {
            let px = ((p.x - view.bbox.ll.x) as f64 * sx).floor() as i32;
            let py = (h as i32 - 1) - ((p.y - view.bbox.ll.y) as f64 * sy).floor() as i32;
            let side = 2 * self.kernel_r + 1;
            for dy in -self.kernel_r..=self.kernel_r {
                let y = py + dy;
                if y < 0 || y >= h as i32 {
                    continue;
                }
                for dx in -self.kernel_r..=self.kernel_r {
                    let x = px + dx;
                    if x < 0 || x >= w as i32 {
                        continue;
                    }
                    let k = self.kernel
                        [((dy + self.kernel_r) * side + (dx + self.kernel_r)) as usize];
                    acc[y as usize * w + x as usize] += weight * k;
                }
            }
        };

        req.for_each_visible_point(&walk, &mut |p| stamp(&mut acc, p, 1.0))?;
        req.for_each_visible_sample(&walk, &mut |p| stamp(&mut acc, p, 1.0))?;
        req.for_each_visible_line_bbox(&walk, &mut |b| {
            if !b.intersects(&view.bbox) {
                return;
            }
            let x0 = (((b.ll.x - view.bbox.ll.x) as f64 * sx).floor() as i64).max(0) as usize;
            let x1 = ((((b.ur.x - view.bbox.ll.x) as f64 * sx).ceil() as i64).min(w as i64 - 1))
                .max(0) as usize;
            let fy0 = (h as i64 - 1) - (((b.ur.y - view.bbox.ll.y) as f64 * sy).ceil() as i64);
            let fy1 = (h as i64 - 1) - (((b.ll.y - view.bbox.ll.y) as f64 * sy).floor() as i64);
            let y0 = fy0.max(0) as usize;
            let y1 = fy1.min(h as i64 - 1).max(0) as usize;
            if x0 > x1 || y0 > y1 {
                return;
            }
            for y in y0..=y1 {
                for x in x0..=x1 {
                    acc[y * w + x] += BBOX_OVERLAY_WEIGHT;
                }
            }
        })?;

        let max = acc.iter().fold(0.0f32, |m, &v| m.max(v));
        let norm = if max > 0.0 { (1.0 + max).ln() } else { 1.0 };

        let mut pixels = Vec::with_capacity(w * h * 4);
        for &v in &acc {
            let t = if v > 0.0 { (1.0 + v).ln() / norm } else { 0.0 };
            pixels.extend_from_slice(&self.ramp.eval(t));
        }

        let img = RgbaImage::from_raw(view.width, view.height, pixels)
            .ok_or_else(|| RenderError::Encode("pixel buffer size mismatch".into()))?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| RenderError::Encode(e.to_string()))?;

        tracing::debug!(
            width = view.width,
            height = view.height,
            max_intensity = max,
            "rendered heatmap tile"
        );
        Ok(out.into_inner())
    }
}

impl Default for HeatmapRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparmap_cache::{GeomCache, IdMapping, SparqlBackend};
    use sparmap_core::geo::Point;
    use sparmap_core::mcoord;
    use std::sync::Arc;

    fn session_with_point_and_line() -> Requestor {
        let line = vec![Point::new(0.0f32, -500.0), Point::new(900.0, -500.0)];
        let mut line_points = Vec::new();
        mcoord::encode_line(&line, false, &mut line_points);
        let cache = Arc::new(GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            vec![Point::new(500.0, 500.0)],
            line_points,
            vec![0],
            vec![
                IdMapping { qid: 1, gid: 0 },
                IdMapping {
                    qid: 2,
                    gid: sparmap_cache::I_OFFSET,
                },
            ],
        ));
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![
            IdMapping { qid: 1, gid: 0 },
            IdMapping { qid: 2, gid: 1 },
        ])
        .unwrap();
        req
    }

    fn decode(png: &[u8]) -> RgbaImage {
        image::load_from_memory_with_format(png, ImageFormat::Png)
            .unwrap()
            .to_rgba8()
    }

    #[test]
    fn test_render_produces_decodable_png() {
        let req = session_with_point_and_line();
        let renderer = HeatmapRenderer::new();
        let view = RenderRequest {
            bbox: FBox::new(Point::new(-1000.0, -1000.0), Point::new(1000.0, 1000.0)),
            width: 128,
            height: 128,
        };
        let png = renderer.render(&req, &view).unwrap();
        let img = decode(&png);
        assert_eq!(img.width(), 128);
        assert_eq!(img.height(), 128);

        // the point at (500, 500) maps to pixel (96, 32); it is the
        // hottest spot so it must be opaque-ish
        let px = img.get_pixel(96, 32);
        assert!(px[3] > 0, "expected heat at the point location");

        // the far corner holds nothing
        let cold = img.get_pixel(1, 1);
        assert_eq!(cold[3], 0);
    }

    #[test]
    fn test_render_empty_view_is_transparent() {
        let req = session_with_point_and_line();
        let renderer = HeatmapRenderer::new();
        let view = RenderRequest {
            bbox: FBox::new(Point::new(100_000.0, 100_000.0), Point::new(101_000.0, 101_000.0)),
            width: 32,
            height: 32,
        };
        let png = renderer.render(&req, &view).unwrap();
        let img = decode(&png);
        assert!(img.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_render_rejects_bad_requests() {
        let req = session_with_point_and_line();
        let renderer = HeatmapRenderer::new();
        let bad_size = RenderRequest {
            bbox: FBox::new(Point::new(0.0, 0.0), Point::new(1.0, 1.0)),
            width: 0,
            height: 10,
        };
        assert!(matches!(
            renderer.render(&req, &bad_size),
            Err(RenderError::Invalid(_))
        ));

        let bad_bbox = RenderRequest {
            bbox: FBox::new(Point::new(1.0, 1.0), Point::new(0.0, 0.0)),
            width: 10,
            height: 10,
        };
        assert!(matches!(
            renderer.render(&req, &bad_bbox),
            Err(RenderError::Invalid(_))
        ));
    }

    #[test]
    fn test_render_not_built_session_errors() {
        let cache = Arc::new(GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ));
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        let renderer = HeatmapRenderer::new();
        let view = RenderRequest {
            bbox: FBox::new(Point::new(0.0, 0.0), Point::new(1.0, 1.0)),
            width: 8,
            height: 8,
        };
        assert!(matches!(
            renderer.render(&req, &view),
            Err(RenderError::Session(SessionError::NotReady))
        ));
    }
}
