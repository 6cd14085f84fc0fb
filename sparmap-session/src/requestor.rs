//! Per-session materialisation of one query's result set.
//!
//! A [`Requestor`] is created per `(backend, query)` pair. Building it
//! fetches the query's binary id stream, joins it against the shared
//! [`GeomCache`], computes result bounding boxes and populates three
//! spatial grids: points, line bounding boxes and line sample footprints.
//! After publication the built state is strictly read-only; nearest-object
//! lookups and tile rendering read it concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use sparmap_cache::{CacheError, GeomCache, Gid, IdMapping, RelObject, I_OFFSET, INVALID_GID};
use sparmap_core::geo::{self, FBox, FLine, FPoint, Point};
use sparmap_core::grid::Grid;
use sparmap_core::mcoord;

use crate::error::{Result, SessionError};
use crate::mem::check_budget;
use crate::query::{prep_query, row_query, TsvRows};

/// Grid cell edge length in web-Mercator units.
const GRID_SIZE: f32 = 65_536.0;

/// Sub-cell resolution of the sample footprint grid.
const SUB_CELLS: f32 = 256.0;

/// Objects between memory-guard probes during grid fills.
const MEM_CHECK_INTERVAL: usize = 100_000;

/// Segment distances below this end a line scan early.
const DIST_EPSILON: f64 = 1e-4;

/// A nearest-object lookup result.
#[derive(Debug, Clone)]
pub struct NearestHit {
    pub id: Gid,
    pub row: u32,
    pub pos: FPoint,
    pub dist: f64,
}

struct Built {
    objects: Vec<RelObject>,
    point_bbox: FBox,
    line_bbox: FBox,
    pgrid: Grid<u32>,
    lgrid: Grid<u32>,
    lpgrid: Grid<Point<u8>>,
}

/// One session's query state against a shared geometry cache.
pub struct Requestor {
    cache: Arc<GeomCache>,
    query: String,
    max_memory: u64,
    building: AtomicBool,
    build_lock: Mutex<()>,
    built: RwLock<Option<Built>>,
}

impl Requestor {
    pub fn new(cache: Arc<GeomCache>, query: impl Into<String>, max_memory: u64) -> Self {
        Self {
            cache,
            query: query.into(),
            max_memory,
            building: AtomicBool::new(false),
            build_lock: Mutex::new(()),
            built: RwLock::new(None),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_ready(&self) -> bool {
        self.built.read().is_some()
    }

    /// Whether a build is in flight; building sessions are exempt from
    /// eviction.
    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    /// Build the session. Re-entrant: a second call while ready is a
    /// no-op, a concurrent call blocks until the first build finishes.
    pub fn request(&self) -> Result<()> {
        let _guard = self.build_lock.lock();
        if self.built.read().is_some() {
            return Ok(());
        }
        if !self.cache.ready() {
            return Err(SessionError::CacheNotReady);
        }
        self.building.store(true, Ordering::SeqCst);
        let result = self.fetch_ids().and_then(|ids| self.build_inner(ids));
        self.building.store(false, Ordering::SeqCst);
        *self.built.write() = Some(result?);
        Ok(())
    }

    /// Build from an already-fetched id list. [`Requestor::request`]
    /// fetches the id stream and delegates here.
    pub fn build_from_ids(&self, ids: Vec<IdMapping>) -> Result<()> {
        let _guard = self.build_lock.lock();
        if self.built.read().is_some() {
            return Ok(());
        }
        if !self.cache.ready() {
            return Err(SessionError::CacheNotReady);
        }
        let built = self.build_inner(ids)?;
        *self.built.write() = Some(built);
        Ok(())
    }

    fn fetch_ids(&self) -> Result<Vec<IdMapping>> {
        let prepped = prep_query(&self.query);
        tracing::info!(query = %prepped, "requesting result ids");
        let mut collector = IdCollector::new();
        self.cache
            .backend()
            .stream_ids(&prepped, |chunk| {
                collector.feed(chunk);
                Ok(())
            })?;
        collector.finish()
    }

    fn build_inner(&self, mut ids: Vec<IdMapping>) -> Result<Built> {
        tracing::info!(ids = ids.len(), "sorting result ids");
        ids.par_sort_by_key(|m| m.qid);

        let objects = self.cache.get_rel_objects(&ids);
        drop(ids);
        tracing::info!(objects = objects.len(), "joined against geometry cache");

        let cache = self.cache.as_ref();
        let (point_bbox, line_bbox) = objects
            .par_iter()
            .fold(
                || (FBox::default(), FBox::default()),
                |(mut pb, mut lb), &(gid, _)| {
                    if gid < I_OFFSET {
                        pb.extend(cache.points()[gid as usize]);
                    } else if gid != INVALID_GID {
                        lb = lb.extended(&cache.line_bbox((gid - I_OFFSET) as usize));
                    }
                    (pb, lb)
                },
            )
            .reduce(
                || (FBox::default(), FBox::default()),
                |(pa, la), (pb, lb)| (pa.extended(&pb), la.extended(&lb)),
            );

        // avoid zero-area grids when the result is a single object
        let point_bbox = point_bbox.padded(1.0);
        let line_bbox = line_bbox.padded(1.0);

        let (pc, pr) = Grid::<u32>::dims(GRID_SIZE, GRID_SIZE, &point_bbox);
        let (lc, lr) = Grid::<Point<u8>>::dims(GRID_SIZE, GRID_SIZE, &line_bbox);
        check_budget(8 * (pc * pr) as u64, self.max_memory)?;
        check_budget(8 * (lc * lr) as u64, self.max_memory)?;
        check_budget(8 * (lc * lr) as u64, self.max_memory)?;
        tracing::info!(
            point_cells = pc * pr,
            line_cells = lc * lr,
            "building session grids"
        );

        let mut pgrid: Grid<u32> = Grid::new(GRID_SIZE, GRID_SIZE, point_bbox);
        let mut lgrid: Grid<u32> = Grid::new(GRID_SIZE, GRID_SIZE, line_bbox);
        let mut lpgrid: Grid<Point<u8>> = Grid::new(GRID_SIZE, GRID_SIZE, line_bbox);

        let budget = self.max_memory;
        let first_err: Mutex<Option<SessionError>> = Mutex::new(None);
        rayon::scope(|s| {
            s.spawn(|_| {
                if let Err(e) = fill_point_grid(&objects, cache, &mut pgrid, budget) {
                    first_err.lock().get_or_insert(e);
                }
            });
            s.spawn(|_| {
                if let Err(e) = fill_line_grid(&objects, cache, &mut lgrid, budget) {
                    first_err.lock().get_or_insert(e);
                }
            });
            s.spawn(|_| {
                if let Err(e) = fill_sample_grid(&objects, cache, &mut lpgrid, budget) {
                    first_err.lock().get_or_insert(e);
                }
            });
        });
        if let Some(e) = first_err.into_inner() {
            return Err(e);
        }

        Ok(Built {
            objects,
            point_bbox,
            line_bbox,
            pgrid,
            lgrid,
            lpgrid,
        })
    }

    /// Bounding box of the whole result set.
    pub fn bounds(&self) -> Result<FBox> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        Ok(built.point_bbox.extended(&built.line_bbox))
    }

    /// Bytes held by the built state, for the eviction ledger.
    pub fn memory_usage(&self) -> u64 {
        match self.built.read().as_ref() {
            Some(b) => {
                b.objects.len() as u64 * std::mem::size_of::<RelObject>() as u64
                    + b.pgrid.memory_usage()
                    + b.lgrid.memory_usage()
                    + b.lpgrid.memory_usage()
            }
            None => 0,
        }
    }

    /// Nearest object to `rp` within radius `rad`, or `None`.
    pub fn get_nearest(&self, rp: FPoint, rad: f64) -> Result<Option<NearestHit>> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        let cache = self.cache.as_ref();
        let search = FBox::around(rp).padded(rad as f32);

        let (pt, ln) = rayon::join(
            || nearest_point(built, cache, rp, &search),
            || nearest_line(built, cache, rp, rad, &search),
        );

        if let Some((d_pt, oid)) = pt {
            let d_ln = ln.as_ref().map(|l| l.dist).unwrap_or(f64::MAX);
            if d_pt < rad && d_pt <= d_ln {
                let (gid, row) = built.objects[oid];
                return Ok(Some(NearestHit {
                    id: gid,
                    row,
                    pos: cache.points()[gid as usize],
                    dist: d_pt,
                }));
            }
        }

        // no `l.dist <= d_pt` check needed here: the point branch above
        // already returned for every case where the point wins (point in
        // radius and at most the line distance), so reaching this branch
        // means no point qualified. Keep the branch order if editing.
        if let Some(l) = ln {
            if l.dist < rad {
                let (gid, row) = built.objects[l.oid];
                let lid = (gid - I_OFFSET) as usize;
                let pos = if l.inside {
                    rp
                } else {
                    let line: FLine = mcoord::vertices(cache.line_slice(lid)).collect();
                    geo::project_on_polyline(&line, rp)
                };
                return Ok(Some(NearestHit {
                    id: gid,
                    row,
                    pos,
                    dist: l.dist,
                }));
            }
        }

        Ok(None)
    }

    /// Nearest object plus its attribute row fetched from the backend.
    pub fn get_nearest_with_attrs(
        &self,
        rp: FPoint,
        rad: f64,
    ) -> Result<Option<(NearestHit, Vec<(String, String)>)>> {
        match self.get_nearest(rp, rad)? {
            Some(hit) => {
                let attrs = self.request_row(hit.row)?;
                Ok(Some((hit, attrs)))
            }
            None => Ok(None),
        }
    }

    /// Fetch one result row's column name/value pairs via
    /// `OFFSET n LIMIT 1`.
    pub fn request_row(&self, row: u32) -> Result<Vec<(String, String)>> {
        let q = row_query(&self.query, row);
        tracing::info!(row, "requesting attribute row");
        let body = self.cache.backend().fetch_tsv(&q, 0, 1)?;
        let mut lines = body.lines();
        let cols = TsvRows::parse_header(lines.next().unwrap_or(""));
        let values = lines.next().unwrap_or("");
        Ok(cols
            .into_iter()
            .zip(values.split('\t').map(|v| v.trim_end_matches('\r').to_string()))
            .collect())
    }

    /// Stream every row of the full result set to `cb` in chunks; a `cb`
    /// error aborts the transfer and is returned to the caller.
    pub fn request_rows<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(Vec<Vec<String>>) -> Result<()>,
    {
        let mut parser = TsvRows::new();
        let mut cb_err: Option<SessionError> = None;
        let res = self.cache.backend().stream_tsv(
            &self.query,
            0,
            sparmap_cache::MAX_ROWS,
            |chunk| {
                let rows = parser.feed(chunk);
                if rows.is_empty() {
                    return Ok(());
                }
                cb(rows).map_err(|e| {
                    cb_err = Some(e);
                    CacheError::Protocol("row stream aborted by consumer".into())
                })
            },
        );
        if let Some(e) = cb_err {
            return Err(e);
        }
        res?;
        Ok(())
    }

    /// All point sub-geometries of the source row behind object `oid`.
    pub fn geom_point_geoms(&self, oid: usize) -> Result<Vec<FPoint>> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        let mut out = Vec::new();
        for &(gid, _) in &built.objects[object_span(&built.objects, oid)] {
            if gid < I_OFFSET {
                out.push(self.cache.points()[gid as usize]);
            }
        }
        Ok(out)
    }

    /// All open-line sub-geometries of the source row behind object `oid`,
    /// simplified with `eps`.
    pub fn geom_line_geoms(&self, oid: usize, eps: f64) -> Result<Vec<FLine>> {
        self.collect_line_geoms(oid, eps, false)
    }

    /// All area sub-geometries of the source row behind object `oid`,
    /// simplified with `eps`.
    pub fn geom_poly_geoms(&self, oid: usize, eps: f64) -> Result<Vec<FLine>> {
        self.collect_line_geoms(oid, eps, true)
    }

    fn collect_line_geoms(&self, oid: usize, eps: f64, want_area: bool) -> Result<Vec<FLine>> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        let mut out = Vec::new();
        for &(gid, _) in &built.objects[object_span(&built.objects, oid)] {
            if gid >= I_OFFSET && gid != INVALID_GID {
                let lid = (gid - I_OFFSET) as usize;
                if self.cache.line_is_area(lid) != want_area {
                    continue;
                }
                let line: FLine = mcoord::vertices(self.cache.line_slice(lid)).collect();
                out.push(geo::simplify(&line, eps));
            }
        }
        Ok(out)
    }

    /// Visit every indexed point whose grid cell overlaps `bbox`.
    pub fn for_each_visible_point(
        &self,
        bbox: &FBox,
        f: &mut dyn FnMut(FPoint),
    ) -> Result<()> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        if let Some((xs, ys)) = built.pgrid.cell_range(bbox) {
            for cy in ys {
                for cx in xs.clone() {
                    for &i in built.pgrid.cell(cx, cy) {
                        let gid = built.objects[i as usize].0;
                        f(self.cache.points()[gid as usize]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit every line sample footprint whose grid cell overlaps `bbox`.
    pub fn for_each_visible_sample(
        &self,
        bbox: &FBox,
        f: &mut dyn FnMut(FPoint),
    ) -> Result<()> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        let grid = &built.lpgrid;
        let sub_w = grid.cell_w() / SUB_CELLS;
        let sub_h = grid.cell_h() / SUB_CELLS;
        if let Some((xs, ys)) = grid.cell_range(bbox) {
            for cy in ys {
                for cx in xs.clone() {
                    let origin = grid.cell_origin(cx, cy);
                    for s in grid.cell(cx, cy) {
                        f(Point::new(
                            origin.x + (s.x as f32 + 0.5) * sub_w,
                            origin.y + (s.y as f32 + 0.5) * sub_h,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit the bounding box of every line overlapping `bbox`, once per
    /// line.
    pub fn for_each_visible_line_bbox(
        &self,
        bbox: &FBox,
        f: &mut dyn FnMut(&FBox),
    ) -> Result<()> {
        let guard = self.built.read();
        let built = guard.as_ref().ok_or(SessionError::NotReady)?;
        let mut cand = Vec::new();
        built.lgrid.get(bbox, &mut cand);
        cand.sort_unstable();
        cand.dedup();
        for i in cand {
            let gid = built.objects[i as usize].0;
            let b = self.cache.line_bbox((gid - I_OFFSET) as usize);
            if b.intersects(bbox) {
                f(&b);
            }
        }
        Ok(())
    }
}

/// Backward/forward walk over the contiguous object range sharing `oid`'s
/// result row. The backward walk stops when the row differs or index 0 is
/// reached.
fn object_span(objects: &[RelObject], oid: usize) -> std::ops::Range<usize> {
    let row = objects[oid].1;
    let mut lo = oid;
    while lo > 0 && objects[lo - 1].1 == row {
        lo -= 1;
    }
    let mut hi = oid + 1;
    while hi < objects.len() && objects[hi].1 == row {
        hi += 1;
    }
    lo..hi
}

/// Accumulates the binary id stream into `(qid, row)` pairs.
struct IdCollector {
    cur: [u8; 8],
    cur_byte: usize,
    ids: Vec<IdMapping>,
}

impl IdCollector {
    fn new() -> Self {
        Self {
            cur: [0; 8],
            cur_byte: 0,
            ids: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        for &b in chunk {
            self.cur[self.cur_byte] = b;
            self.cur_byte = (self.cur_byte + 1) % 8;
            if self.cur_byte == 0 {
                let qid = u64::from_le_bytes(self.cur);
                self.ids.push(IdMapping {
                    qid,
                    gid: self.ids.len() as u32,
                });
            }
        }
    }

    fn finish(self) -> Result<Vec<IdMapping>> {
        if self.cur_byte != 0 {
            return Err(SessionError::Cache(CacheError::Protocol(format!(
                "binary id stream ended mid-value ({} trailing bytes)",
                self.cur_byte
            ))));
        }
        Ok(self.ids)
    }
}

fn fill_point_grid(
    objects: &[RelObject],
    cache: &GeomCache,
    grid: &mut Grid<u32>,
    budget: u64,
) -> Result<()> {
    for (i, &(gid, _)) in objects.iter().enumerate() {
        if gid < I_OFFSET {
            grid.add_point(cache.points()[gid as usize], i as u32);
        }
        if (i + 1) % MEM_CHECK_INTERVAL == 0 {
            check_budget(1, budget)?;
        }
    }
    Ok(())
}

fn fill_line_grid(
    objects: &[RelObject],
    cache: &GeomCache,
    grid: &mut Grid<u32>,
    budget: u64,
) -> Result<()> {
    for (i, &(gid, _)) in objects.iter().enumerate() {
        if gid >= I_OFFSET && gid != INVALID_GID {
            let lid = (gid - I_OFFSET) as usize;
            grid.add_bbox(&cache.line_bbox(lid), i as u32);
        }
        if (i + 1) % MEM_CHECK_INTERVAL == 0 {
            check_budget(1, budget)?;
        }
    }
    Ok(())
}

fn fill_sample_grid(
    objects: &[RelObject],
    cache: &GeomCache,
    grid: &mut Grid<Point<u8>>,
    budget: u64,
) -> Result<()> {
    let sub_w = grid.cell_w() / SUB_CELLS;
    let sub_h = grid.cell_h() / SUB_CELLS;
    for (i, &(gid, _)) in objects.iter().enumerate() {
        if gid >= I_OFFSET && gid != INVALID_GID {
            let lid = (gid - I_OFFSET) as usize;
            let mut first = true;
            let mut last = Point::new(0u8, 0u8);
            let mut last_cell = (0i64, 0i64);
            for v in mcoord::vertices(cache.line_slice(lid)) {
                let cx = grid.cell_x(v.x);
                let cy = grid.cell_y(v.y);
                if cx < 0 || cy < 0 || cx >= grid.cols() as i64 || cy >= grid.rows() as i64 {
                    continue;
                }
                let origin = grid.cell_origin(cx as usize, cy as usize);
                let s = Point::new(
                    (((v.x - origin.x) / sub_w) as i64).clamp(0, 255) as u8,
                    (((v.y - origin.y) / sub_h) as i64).clamp(0, 255) as u8,
                );
                // the first vertex always emits; later ones only when they
                // land in a new sub-cell
                if first || s != last || (cx, cy) != last_cell {
                    grid.add_cell(cx as usize, cy as usize, s);
                    first = false;
                    last = s;
                    last_cell = (cx, cy);
                }
            }
        }
        if (i + 1) % MEM_CHECK_INTERVAL == 0 {
            check_budget(1, budget)?;
        }
    }
    Ok(())
}

fn nearest_point(
    built: &Built,
    cache: &GeomCache,
    rp: FPoint,
    search: &FBox,
) -> Option<(f64, usize)> {
    let mut cand = Vec::new();
    built.pgrid.get(search, &mut cand);
    cand.sort_unstable();
    cand.dedup();

    let mut best: Option<(f64, usize)> = None;
    for i in cand {
        let oid = i as usize;
        let p = cache.points()[built.objects[oid].0 as usize];
        if !search.contains(p) {
            continue;
        }
        let d = geo::dist(p, rp);
        if best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, oid));
        }
    }
    best
}

struct LineCand {
    dist: f64,
    oid: usize,
    inside: bool,
}

fn nearest_line(
    built: &Built,
    cache: &GeomCache,
    rp: FPoint,
    rad: f64,
    search: &FBox,
) -> Option<LineCand> {
    let mut cand = Vec::new();
    built.lgrid.get(search, &mut cand);
    cand.sort_unstable();
    cand.dedup();

    let mut best: Option<LineCand> = None;
    for i in cand {
        let oid = i as usize;
        let lid = (built.objects[oid].0 - I_OFFSET) as usize;
        if !cache.line_bbox(lid).intersects(search) {
            continue;
        }

        let slice = cache.line_slice(lid);
        let area = mcoord::is_area(slice);
        let mut d = f64::INFINITY;
        let mut inside = false;
        let mut early = false;
        let mut prev: Option<FPoint> = None;
        for v in mcoord::vertices(slice) {
            if let Some(a) = prev {
                let dt = geo::dist_to_segment(a, v, rp);
                if dt < d {
                    d = dt;
                }
                if area && geo::crosses_ray(a, v, rp) {
                    inside = !inside;
                }
                if dt < DIST_EPSILON {
                    d = 0.0;
                    early = true;
                    break;
                }
            }
            prev = Some(v);
        }

        // smaller objects strictly inside the area stay preferable
        let contained = !early && area && inside;
        if contained {
            d = rad / 4.0;
        }

        if best.as_ref().map_or(true, |b| d < b.dist) {
            best = Some(LineCand {
                dist: d,
                oid,
                inside: contained,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparmap_cache::SparqlBackend;

    /// Assemble a cache holding the given points and encoded lines.
    fn test_cache(points: Vec<FPoint>, lines: Vec<(FLine, bool)>, qid_to_id: Vec<IdMapping>) -> Arc<GeomCache> {
        let mut line_points = Vec::new();
        let mut line_offsets = Vec::new();
        for (line, is_area) in &lines {
            line_offsets.push(line_points.len() as u64);
            mcoord::encode_line(line, *is_area, &mut line_points);
        }
        Arc::new(GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            points,
            line_points,
            line_offsets,
            qid_to_id,
        ))
    }

    fn mapping(qid: u64, gid: Gid) -> IdMapping {
        IdMapping { qid, gid }
    }

    #[test]
    fn test_single_point_session() {
        let p = geo::web_merc(7.85, 48.0);
        let cache = test_cache(vec![p], Vec::new(), vec![mapping(5, 0)]);
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![mapping(5, 0)]).unwrap();

        let bounds = req.bounds().unwrap();
        assert!(bounds.contains(p));
        // padded by one unit on each side
        assert!(bounds.width() >= 2.0);

        let hit = req.get_nearest(p, 10.0).unwrap().expect("hit");
        assert_eq!(hit.id, 0);
        assert_eq!(hit.row, 0);
        assert!(hit.dist < 1e-3);
    }

    #[test]
    fn test_build_is_idempotent() {
        let p = geo::web_merc(1.0, 1.0);
        let cache = test_cache(vec![p], Vec::new(), vec![mapping(5, 0)]);
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![mapping(5, 0)]).unwrap();
        let usage = req.memory_usage();
        // second build with different ids is a no-op
        req.build_from_ids(Vec::new()).unwrap();
        assert_eq!(req.memory_usage(), usage);
        assert!(req.get_nearest(p, 10.0).unwrap().is_some());
    }

    #[test]
    fn test_not_built_errors() {
        let cache = test_cache(Vec::new(), Vec::new(), Vec::new());
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        assert!(matches!(
            req.get_nearest(Point::new(0.0, 0.0), 1.0),
            Err(SessionError::NotReady)
        ));
        assert!(matches!(req.bounds(), Err(SessionError::NotReady)));
    }

    #[test]
    fn test_cache_not_ready_errors() {
        let cache = Arc::new(GeomCache::new("http://localhost:7001", 0).unwrap());
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        assert!(matches!(
            req.build_from_ids(Vec::new()),
            Err(SessionError::CacheNotReady)
        ));
    }

    #[test]
    fn test_nearest_line() {
        // a line along y = 0 from (0,0) to (1000,0), in raw mercator units
        let line: FLine = vec![Point::new(0.0, 0.0), Point::new(1000.0, 0.0)];
        let cache = test_cache(Vec::new(), vec![(line, false)], vec![mapping(3, I_OFFSET)]);
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![mapping(3, 0)]).unwrap();

        let hit = req
            .get_nearest(Point::new(500.0, 30.0), 100.0)
            .unwrap()
            .expect("hit");
        assert_eq!(hit.id, I_OFFSET);
        assert!((hit.dist - 30.0).abs() < 1.5, "dist {}", hit.dist);
        // projection lands on the line
        assert!(hit.pos.y.abs() < 1.5);
        assert!((hit.pos.x - 500.0).abs() < 1.5);

        // outside the radius: no hit
        assert!(req
            .get_nearest(Point::new(500.0, 500.0), 100.0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_point_inside_polygon_wins() {
        // square polygon 0..1000 with a point strictly inside
        let ring: FLine = vec![
            Point::new(0.0, 0.0),
            Point::new(1000.0, 0.0),
            Point::new(1000.0, 1000.0),
            Point::new(0.0, 1000.0),
            Point::new(0.0, 0.0),
        ];
        let inner = Point::new(400.0, 400.0);
        let cache = test_cache(
            vec![inner],
            vec![(ring, true)],
            vec![mapping(1, 0), mapping(2, I_OFFSET)],
        );
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![mapping(1, 0), mapping(2, 1)]).unwrap();

        // probe exactly at the inner point: the polygon's distance is
        // overwritten to rad/4, so the point wins
        let hit = req.get_nearest(inner, 100.0).unwrap().expect("hit");
        assert_eq!(hit.id, 0);
        assert!(hit.dist < 1e-3);

        // probing elsewhere inside the polygon (far from the point) still
        // reports the polygon, at the rad/4 tiebreak distance, positioned
        // at the probe itself
        let probe = Point::new(600.0, 700.0);
        let hit = req.get_nearest(probe, 100.0).unwrap().expect("hit");
        assert_eq!(hit.id, I_OFFSET);
        assert!((hit.dist - 25.0).abs() < 1e-6);
        assert_eq!(hit.pos, probe);
    }

    #[test]
    fn test_multi_geometry_span_walks() {
        let lines: Vec<(FLine, bool)> = vec![
            (vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)], false),
            (vec![Point::new(20.0, 0.0), Point::new(30.0, 0.0)], false),
            (vec![Point::new(40.0, 0.0), Point::new(50.0, 0.0)], false),
        ];
        let cache = test_cache(
            Vec::new(),
            lines,
            vec![
                mapping(1, I_OFFSET),
                mapping(1, I_OFFSET + 1),
                mapping(2, I_OFFSET + 2),
            ],
        );
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        // rows: qid 1 -> row 0 (two geoms), qid 2 -> row 1
        req.build_from_ids(vec![mapping(1, 0), mapping(2, 1)]).unwrap();

        // oid 0: backward walk stops at index 0 without wrapping
        let geoms = req.geom_line_geoms(0, 0.0).unwrap();
        assert_eq!(geoms.len(), 2);
        let geoms = req.geom_line_geoms(1, 0.0).unwrap();
        assert_eq!(geoms.len(), 2);
        let geoms = req.geom_line_geoms(2, 0.0).unwrap();
        assert_eq!(geoms.len(), 1);
        assert!(req.geom_point_geoms(2).unwrap().is_empty());
    }

    #[test]
    fn test_sample_grid_has_footprint() {
        let line: FLine = vec![Point::new(0.0, 0.0), Point::new(5000.0, 0.0)];
        let cache = test_cache(Vec::new(), vec![(line, false)], vec![mapping(3, I_OFFSET)]);
        let req = Requestor::new(cache, "SELECT ?g WHERE { ?s ?p ?g }", 0);
        req.build_from_ids(vec![mapping(3, 0)]).unwrap();

        let view = FBox::new(Point::new(-100.0, -100.0), Point::new(6000.0, 100.0));
        let mut samples = Vec::new();
        req.for_each_visible_sample(&view, &mut |p| samples.push(p))
            .unwrap();
        assert!(!samples.is_empty());
        for s in &samples {
            assert!(s.y.abs() <= 260.0, "sample {:?} off the line", s);
        }

        let mut boxes = Vec::new();
        req.for_each_visible_line_bbox(&view, &mut |b| boxes.push(*b))
            .unwrap();
        assert_eq!(boxes.len(), 1);
    }
}
