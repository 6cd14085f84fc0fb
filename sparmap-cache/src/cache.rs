//! The geometry cache: build, join, accessors, persistence.

use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use rayon::prelude::*;

use sparmap_core::geo::{FBox, FPoint, Point};
use sparmap_core::mcoord;

use crate::backend::SparqlBackend;
use crate::error::{CacheError, Result};
use crate::ids::IdsIngest;
use crate::ingest::WktIngest;
use crate::{IdMapping, RelObject};

/// Fixed corpus query: every geometry of the backend, ordered so that
/// identical WKT literals are adjacent.
const GEOMETRY_QUERY: &str = "SELECT ?geometry WHERE { \
     ?s <http://www.opengis.net/ont/geosparql#hasGeometry> ?geometry \
     } ORDER BY ?geometry";

const COUNT_QUERY: &str = "SELECT (COUNT(?geometry) AS ?count) WHERE { \
     ?s <http://www.opengis.net/ont/geosparql#hasGeometry> ?geometry \
     }";

/// WKT-pass page size (rows per OFFSET request).
const PAGE_SIZE: u64 = 1_000_000;

const CACHE_MAGIC: [u8; 4] = *b"SMGC";
const CACHE_VERSION: u8 = 1;
const CACHE_HEADER_LEN: usize = 8;

/// Compressed geometry corpus of one backend, shared across sessions.
///
/// Built once per backend URL (or reloaded from disk) and strictly
/// read-only afterwards.
pub struct GeomCache {
    backend: SparqlBackend,
    max_memory: u64,
    points: Vec<FPoint>,
    line_points: Vec<Point<i16>>,
    lines: Vec<u64>,
    qid_to_id: Vec<IdMapping>,
    ready: bool,
}

impl GeomCache {
    /// An empty, not-yet-built cache for `backend_url`. `max_memory` of 0
    /// disables budget checks.
    pub fn new(backend_url: &str, max_memory: u64) -> Result<Self> {
        Ok(Self {
            backend: SparqlBackend::new(backend_url)?,
            max_memory,
            points: Vec::new(),
            line_points: Vec::new(),
            lines: Vec::new(),
            qid_to_id: Vec::new(),
            ready: false,
        })
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn backend(&self) -> &SparqlBackend {
        &self.backend
    }

    pub fn backend_url(&self) -> &str {
        self.backend.url()
    }

    /// Two-pass ingest: stream the WKT corpus into compressed tables, then
    /// attach backend row ids and sort the join table.
    pub fn build(&mut self) -> Result<()> {
        let total = self.request_size()?;
        tracing::info!(backend = self.backend.url(), total, "building geometry cache");

        let mut ingest = WktIngest::new(total)?;
        loop {
            let offset = ingest.rows();
            ingest.reset_part();
            let backend = &self.backend;
            backend.stream_tsv(GEOMETRY_QUERY, offset, PAGE_SIZE, |chunk| ingest.feed(chunk))?;
            if ingest.rows() == offset {
                break;
            }
        }
        tracing::info!(
            rows = ingest.rows(),
            unique = ingest.unique_geoms(),
            "WKT pass complete"
        );

        let tables = ingest.finish(self.max_memory)?;
        self.points = tables.points;
        self.line_points = tables.line_points;
        self.lines = tables.lines;
        self.qid_to_id = tables.qid_to_id;

        self.request_ids()?;
        self.sort();
        self.ready = true;

        tracing::info!(
            points = self.points.len(),
            lines = self.lines.len(),
            mappings = self.qid_to_id.len(),
            "geometry cache ready"
        );
        Ok(())
    }

    fn request_size(&self) -> Result<u64> {
        let body = self.backend.fetch_tsv(COUNT_QUERY, 0, 1)?;
        Ok(body
            .lines()
            .nth(1)
            .map(str::trim)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    fn request_ids(&mut self) -> Result<()> {
        let expected = self.qid_to_id.len();
        let mut ids = IdsIngest::new();
        let backend = &self.backend;
        let qid_to_id = &mut self.qid_to_id;
        backend.stream_ids(GEOMETRY_QUERY, |chunk| {
            ids.feed(chunk, qid_to_id);
            Ok(())
        })?;
        ids.finish()?;
        if ids.rows() != expected {
            tracing::warn!(
                wkt_rows = expected,
                id_rows = ids.rows(),
                "row counts of the two ingest passes disagree"
            );
        }
        tracing::info!(rows = ids.rows(), max_qid = ids.max_qid(), "binary id pass complete");
        Ok(())
    }

    /// Stable parallel sort by qid; continuations keep their insertion
    /// order behind their primary.
    fn sort(&mut self) {
        self.qid_to_id.par_sort_by_key(|m| m.qid);
    }

    /// Join a qid-sorted id list against the cache, yielding
    /// `(gid, result row)` pairs in order. Both cursors gallop
    /// (exponential probe, then binary search) across runs the other side
    /// skips. Sentinel gids are emitted so row numbering stays aligned
    /// with the backend's result order.
    pub fn get_rel_objects(&self, ids: &[IdMapping]) -> Vec<RelObject> {
        let mut ret = Vec::with_capacity(ids.len());
        let mut i = 0;
        let mut j = 0;
        while i < ids.len() && j < self.qid_to_id.len() {
            if ids[i].qid == self.qid_to_id[j].qid {
                ret.push((self.qid_to_id[j].gid, ids[i].gid));
                j += 1;
            } else if ids[i].qid < self.qid_to_id[j].qid {
                i = gallop_to(ids, i, self.qid_to_id[j].qid);
            } else {
                j = gallop_to(&self.qid_to_id, j, ids[i].qid);
            }
        }
        ret
    }

    pub fn points(&self) -> &[FPoint] {
        &self.points
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    /// Start offset of line `lid` in the M-coord store.
    pub fn line(&self, lid: usize) -> u64 {
        self.lines[lid]
    }

    /// End offset (exclusive) of line `lid`.
    pub fn line_end(&self, lid: usize) -> u64 {
        if lid + 1 < self.lines.len() {
            self.lines[lid + 1]
        } else {
            self.line_points.len() as u64
        }
    }

    pub fn line_points(&self) -> &[Point<i16>] {
        &self.line_points
    }

    /// The M-coord entries of line `lid`.
    pub fn line_slice(&self, lid: usize) -> &[Point<i16>] {
        &self.line_points[self.line(lid) as usize..self.line_end(lid) as usize]
    }

    /// Bounding box from the line's encoded prefix.
    pub fn line_bbox(&self, lid: usize) -> FBox {
        mcoord::decode_bbox(self.line_slice(lid))
    }

    /// Whether line `lid` encodes an area (closed ring).
    pub fn line_is_area(&self, lid: usize) -> bool {
        mcoord::is_area(self.line_slice(lid))
    }

    /// Bytes held by the in-memory tables.
    pub fn memory_usage(&self) -> u64 {
        self.points.len() as u64 * 8
            + self.line_points.len() as u64 * 4
            + self.lines.len() as u64 * 8
            + self.qid_to_id.len() as u64 * IdMapping::SIZE as u64
    }

    /// Persist the four tables behind a magic + version header.
    pub fn serialize_to_disk(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::with_capacity(256 * 1024, std::fs::File::create(path)?);
        w.write_all(&CACHE_MAGIC)?;
        w.write_all(&[CACHE_VERSION, 0, 0, 0])?;

        w.write_all(&(self.points.len() as u64).to_le_bytes())?;
        for p in &self.points {
            w.write_all(&p.x.to_le_bytes())?;
            w.write_all(&p.y.to_le_bytes())?;
        }

        w.write_all(&(self.line_points.len() as u64).to_le_bytes())?;
        for p in &self.line_points {
            w.write_all(&p.x.to_le_bytes())?;
            w.write_all(&p.y.to_le_bytes())?;
        }

        w.write_all(&(self.lines.len() as u64).to_le_bytes())?;
        for l in &self.lines {
            w.write_all(&l.to_le_bytes())?;
        }

        w.write_all(&(self.qid_to_id.len() as u64).to_le_bytes())?;
        let mut buf = [0u8; IdMapping::SIZE];
        for m in &self.qid_to_id {
            m.write_le(&mut buf);
            w.write_all(&buf)?;
        }

        w.flush()?;
        Ok(())
    }

    /// Reload a cache persisted with [`GeomCache::serialize_to_disk`].
    pub fn from_disk(backend_url: &str, max_memory: u64, path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < CACHE_HEADER_LEN {
            return Err(CacheError::Format("cache file too short".into()));
        }
        if mmap[0..4] != CACHE_MAGIC {
            return Err(CacheError::Format("invalid cache magic".into()));
        }
        if mmap[4] != CACHE_VERSION {
            return Err(CacheError::Format(format!(
                "unsupported cache version {}",
                mmap[4]
            )));
        }
        if max_memory > 0 && mmap.len() as u64 > max_memory {
            return Err(CacheError::OutOfMemory {
                needed: mmap.len() as u64,
                budget: max_memory,
            });
        }

        let mut cur = Cursor {
            data: &mmap,
            pos: CACHE_HEADER_LEN,
        };

        let n = cur.read_u64()? as usize;
        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            points.push(Point::new(cur.read_f32()?, cur.read_f32()?));
        }

        let n = cur.read_u64()? as usize;
        let mut line_points = Vec::with_capacity(n);
        for _ in 0..n {
            line_points.push(Point::new(cur.read_i16()?, cur.read_i16()?));
        }

        let n = cur.read_u64()? as usize;
        let mut lines = Vec::with_capacity(n);
        for _ in 0..n {
            lines.push(cur.read_u64()?);
        }

        let n = cur.read_u64()? as usize;
        let mut qid_to_id = Vec::with_capacity(n);
        for _ in 0..n {
            let buf: [u8; IdMapping::SIZE] = cur.read_array()?;
            qid_to_id.push(IdMapping::read_le(&buf));
        }

        tracing::info!(
            path = %path.as_ref().display(),
            points = points.len(),
            lines = lines.len(),
            "loaded geometry cache from disk"
        );

        Ok(Self::from_parts(
            SparqlBackend::new(backend_url)?,
            max_memory,
            points,
            line_points,
            lines,
            qid_to_id,
        ))
    }

    /// Assemble a ready cache from pre-built tables (disk loader, tests).
    pub fn from_parts(
        backend: SparqlBackend,
        max_memory: u64,
        points: Vec<FPoint>,
        line_points: Vec<Point<i16>>,
        lines: Vec<u64>,
        qid_to_id: Vec<IdMapping>,
    ) -> Self {
        Self {
            backend,
            max_memory,
            points,
            line_points,
            lines,
            qid_to_id,
            ready: true,
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.data.len() {
            return Err(CacheError::Format(format!(
                "truncated cache file at offset {}",
                self.pos
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }
}

/// First index `>= lo` whose qid is `>= target`, via exponential probing
/// followed by binary search within the final gallop window.
fn gallop_to(v: &[IdMapping], lo: usize, target: u64) -> usize {
    let mut step = 1usize;
    let mut base = lo;
    while base + step < v.len() && v[base + step].qid < target {
        base += step;
        step *= 2;
    }
    let hi = (base + step + 1).min(v.len());
    base + v[base..hi].partition_point(|m| m.qid < target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Gid, INVALID_GID, I_OFFSET};

    fn mapping(qid: u64, gid: Gid) -> IdMapping {
        IdMapping { qid, gid }
    }

    fn cache_with_mappings(qid_to_id: Vec<IdMapping>) -> GeomCache {
        GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            qid_to_id,
        )
    }

    #[test]
    fn test_gallop_to() {
        let v: Vec<IdMapping> = (0..100).map(|i| mapping(i * 10, i as Gid)).collect();
        assert_eq!(gallop_to(&v, 0, 0), 0);
        assert_eq!(gallop_to(&v, 0, 5), 1);
        assert_eq!(gallop_to(&v, 0, 500), 50);
        assert_eq!(gallop_to(&v, 10, 990), 99);
        assert_eq!(gallop_to(&v, 0, 10_000), 100);
    }

    #[test]
    fn test_merge_join_basic() {
        let cache = cache_with_mappings(vec![
            mapping(10, 0),
            mapping(20, 1),
            mapping(30, 2),
            mapping(40, 3),
        ]);
        let ids = vec![mapping(20, 0), mapping(40, 1)];
        let objects = cache.get_rel_objects(&ids);
        assert_eq!(objects, vec![(1, 0), (3, 1)]);
    }

    #[test]
    fn test_merge_join_emits_sentinels() {
        let cache = cache_with_mappings(vec![mapping(10, INVALID_GID), mapping(20, 5)]);
        let ids = vec![mapping(10, 0), mapping(20, 1)];
        let objects = cache.get_rel_objects(&ids);
        assert_eq!(objects, vec![(INVALID_GID, 0), (5, 1)]);
    }

    #[test]
    fn test_merge_join_multi_geometry_expands() {
        // one query row whose qid owns three cache entries
        let cache = cache_with_mappings(vec![
            mapping(10, I_OFFSET),
            mapping(10, I_OFFSET + 1),
            mapping(10, I_OFFSET + 2),
            mapping(99, 7),
        ]);
        let ids = vec![mapping(10, 4)];
        let objects = cache.get_rel_objects(&ids);
        assert_eq!(
            objects,
            vec![(I_OFFSET, 4), (I_OFFSET + 1, 4), (I_OFFSET + 2, 4)]
        );
    }

    #[test]
    fn test_merge_join_skips_unknown_ids() {
        let cache = cache_with_mappings(vec![mapping(10, 1), mapping(30, 2)]);
        let ids = vec![mapping(5, 0), mapping(10, 1), mapping(20, 2), mapping(30, 3)];
        let objects = cache.get_rel_objects(&ids);
        assert_eq!(objects, vec![(1, 1), (2, 3)]);
    }

    #[test]
    fn test_line_end_of_last_line() {
        let cache = GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            Vec::new(),
            vec![Point::new(0, 0); 10],
            vec![0, 4],
            Vec::new(),
        );
        assert_eq!(cache.line(0), 0);
        assert_eq!(cache.line_end(0), 4);
        assert_eq!(cache.line(1), 4);
        assert_eq!(cache.line_end(1), 10);
        assert_eq!(cache.line_slice(1).len(), 6);
    }

    #[test]
    fn test_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.cache");

        let points = vec![Point::new(1.5f32, -2.5f32), Point::new(100.0, 200.0)];
        let line_points = vec![Point::new(1i16, 2i16), Point::new(-3, 4)];
        let lines = vec![0u64];
        let qid_to_id = vec![mapping(7, 0), mapping(9, I_OFFSET)];

        let cache = GeomCache::from_parts(
            SparqlBackend::new("http://localhost:7001").unwrap(),
            0,
            points.clone(),
            line_points.clone(),
            lines.clone(),
            qid_to_id.clone(),
        );
        cache.serialize_to_disk(&path).unwrap();

        let loaded = GeomCache::from_disk("http://localhost:7001", 0, &path).unwrap();
        assert!(loaded.ready());
        assert_eq!(loaded.points, points);
        assert_eq!(loaded.line_points, line_points);
        assert_eq!(loaded.lines, lines);
        assert_eq!(loaded.qid_to_id, qid_to_id);

        // identical bytes when re-serialised
        let path2 = dir.path().join("geom2.cache");
        loaded.serialize_to_disk(&path2).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&path2).unwrap());
    }

    #[test]
    fn test_disk_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.cache");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            GeomCache::from_disk("http://localhost:7001", 0, &path),
            Err(CacheError::Format(_))
        ));
    }

    #[test]
    fn test_disk_rejects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.cache");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CACHE_MAGIC);
        bytes.extend_from_slice(&[CACHE_VERSION, 0, 0, 0]);
        bytes.extend_from_slice(&5u64.to_le_bytes()); // claims 5 points, has none
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            GeomCache::from_disk("http://localhost:7001", 0, &path),
            Err(CacheError::Format(_))
        ));
    }

    #[test]
    fn test_sort_is_stable_for_continuations() {
        let mut cache = cache_with_mappings(vec![
            mapping(50, 10),
            mapping(50, 11),
            mapping(50, 12),
            mapping(20, 3),
        ]);
        cache.sort();
        assert_eq!(cache.qid_to_id[0], mapping(20, 3));
        assert_eq!(cache.qid_to_id[1], mapping(50, 10));
        assert_eq!(cache.qid_to_id[2], mapping(50, 11));
        assert_eq!(cache.qid_to_id[3], mapping(50, 12));
    }
}
