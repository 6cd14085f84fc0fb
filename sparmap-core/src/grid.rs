//! Axis-aligned uniform grid over web-Mercator space.
//!
//! Cell geometry is frozen at construction. Cells hold flat payload vectors;
//! bbox queries append the payloads of every overlapping cell, duplicates
//! included — callers deduplicate when they need to.

use crate::geo::{FBox, FPoint, Point};

#[derive(Debug, Clone)]
pub struct Grid<V> {
    cell_w: f32,
    cell_h: f32,
    bbox: FBox,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<V>>,
    len: usize,
}

impl<V: Copy> Grid<V> {
    /// Cell counts a grid of this geometry would have, for memory
    /// projections before construction.
    pub fn dims(cell_w: f32, cell_h: f32, bbox: &FBox) -> (usize, usize) {
        if !bbox.is_valid() || cell_w <= 0.0 || cell_h <= 0.0 {
            return (0, 0);
        }
        (
            (bbox.width() as f64 / cell_w as f64).ceil().max(1.0) as usize,
            (bbox.height() as f64 / cell_h as f64).ceil().max(1.0) as usize,
        )
    }

    pub fn new(cell_w: f32, cell_h: f32, bbox: FBox) -> Self {
        let (cols, rows) = Self::dims(cell_w, cell_h, &bbox);
        Self {
            cell_w,
            cell_h,
            bbox,
            cols,
            rows,
            cells: vec![Vec::new(); cols * rows],
            len: 0,
        }
    }

    pub fn bbox(&self) -> &FBox {
        &self.bbox
    }

    pub fn cell_w(&self) -> f32 {
        self.cell_w
    }

    pub fn cell_h(&self) -> f32 {
        self.cell_h
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_cells(&self) -> usize {
        self.cols * self.rows
    }

    /// Total payloads stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cell column for an x coordinate, rounded toward negative infinity;
    /// may fall outside `0..cols` for out-of-bbox input.
    pub fn cell_x(&self, x: f32) -> i64 {
        ((x - self.bbox.ll.x) as f64 / self.cell_w as f64).floor() as i64
    }

    /// Cell row for a y coordinate, rounded toward negative infinity.
    pub fn cell_y(&self, y: f32) -> i64 {
        ((y - self.bbox.ll.y) as f64 / self.cell_h as f64).floor() as i64
    }

    /// World coordinates of a cell's lower-left corner.
    pub fn cell_origin(&self, cx: usize, cy: usize) -> FPoint {
        Point::new(
            self.bbox.ll.x + cx as f32 * self.cell_w,
            self.bbox.ll.y + cy as f32 * self.cell_h,
        )
    }

    /// Clamped inclusive cell ranges overlapping `b`, or `None` when the
    /// query is disjoint from the grid.
    pub fn cell_range(&self, b: &FBox) -> Option<(std::ops::RangeInclusive<usize>, std::ops::RangeInclusive<usize>)> {
        if self.num_cells() == 0 || !b.is_valid() {
            return None;
        }
        let cx0 = self.cell_x(b.ll.x).max(0);
        let cy0 = self.cell_y(b.ll.y).max(0);
        let cx1 = self.cell_x(b.ur.x).min(self.cols as i64 - 1);
        let cy1 = self.cell_y(b.ur.y).min(self.rows as i64 - 1);
        if cx0 > cx1 || cy0 > cy1 {
            return None;
        }
        Some((cx0 as usize..=cx1 as usize, cy0 as usize..=cy1 as usize))
    }

    /// Payloads of one cell.
    pub fn cell(&self, cx: usize, cy: usize) -> &[V] {
        &self.cells[cy * self.cols + cx]
    }

    /// Insert a payload into the single cell covering `p`. Points outside
    /// the grid bbox are ignored.
    pub fn add_point(&mut self, p: FPoint, v: V) {
        let cx = self.cell_x(p.x);
        let cy = self.cell_y(p.y);
        if cx < 0 || cy < 0 || cx >= self.cols as i64 || cy >= self.rows as i64 {
            return;
        }
        self.add_cell(cx as usize, cy as usize, v);
    }

    /// Insert a payload into every cell overlapping `b`.
    pub fn add_bbox(&mut self, b: &FBox, v: V) {
        let Some((xs, ys)) = self.cell_range(b) else {
            return;
        };
        for cy in ys {
            for cx in xs.clone() {
                self.add_cell(cx, cy, v);
            }
        }
    }

    /// Direct cell insert.
    pub fn add_cell(&mut self, cx: usize, cy: usize, v: V) {
        self.cells[cy * self.cols + cx].push(v);
        self.len += 1;
    }

    /// Append the payloads of every cell overlapping `b` to `out`.
    pub fn get(&self, b: &FBox, out: &mut Vec<V>) {
        let Some((xs, ys)) = self.cell_range(b) else {
            return;
        };
        for cy in ys {
            for cx in xs.clone() {
                out.extend_from_slice(self.cell(cx, cy));
            }
        }
    }

    /// Rough heap footprint, for the session memory ledger.
    pub fn memory_usage(&self) -> u64 {
        self.num_cells() as u64 * std::mem::size_of::<Vec<V>>() as u64
            + self.len as u64 * std::mem::size_of::<V>() as u64
    }
}
