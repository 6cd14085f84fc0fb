//! Streaming WKT-pass ingest.
//!
//! [`WktIngest`] is a line-at-a-time state machine fed arbitrary byte
//! fragments of the backend's TSV stream; it is restartable across any
//! fragment boundary. Parsed geometries are compressed straight into four
//! anonymous scratch files (already unlinked, so abnormal termination
//! leaks nothing) and only materialised into vectors once the pass
//! completes.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use sparmap_core::geo::{FLine, FPoint, Point};
use sparmap_core::{mcoord, wkt};

use crate::error::{CacheError, Result};
use crate::{Gid, IdMapping, I_OFFSET, INVALID_GID};

const WRITE_BUF: usize = 256 * 1024;

/// The four scratch outputs of the WKT pass.
pub(crate) struct ScratchFiles {
    points: BufWriter<File>,
    line_points: BufWriter<File>,
    lines: BufWriter<File>,
    qid_to_id: BufWriter<File>,
    pub num_points: u64,
    pub num_line_points: u64,
    pub num_lines: u64,
    pub num_mappings: u64,
}

impl ScratchFiles {
    fn new() -> io::Result<Self> {
        // tempfile() hands back unlinked descriptors
        Ok(Self {
            points: BufWriter::with_capacity(WRITE_BUF, tempfile::tempfile()?),
            line_points: BufWriter::with_capacity(WRITE_BUF, tempfile::tempfile()?),
            lines: BufWriter::with_capacity(WRITE_BUF, tempfile::tempfile()?),
            qid_to_id: BufWriter::with_capacity(WRITE_BUF, tempfile::tempfile()?),
            num_points: 0,
            num_line_points: 0,
            num_lines: 0,
            num_mappings: 0,
        })
    }

    fn write_point(&mut self, p: FPoint) -> io::Result<Gid> {
        self.points.write_all(&p.x.to_le_bytes())?;
        self.points.write_all(&p.y.to_le_bytes())?;
        self.num_points += 1;
        Ok((self.num_points - 1) as Gid)
    }

    fn write_line(&mut self, encoded: &[Point<i16>]) -> io::Result<Gid> {
        self.lines.write_all(&self.num_line_points.to_le_bytes())?;
        self.num_lines += 1;
        for p in encoded {
            self.line_points.write_all(&p.x.to_le_bytes())?;
            self.line_points.write_all(&p.y.to_le_bytes())?;
        }
        self.num_line_points += encoded.len() as u64;
        Ok(I_OFFSET + (self.num_lines - 1) as Gid)
    }

    fn write_mapping(&mut self, m: IdMapping) -> io::Result<()> {
        let mut buf = [0u8; IdMapping::SIZE];
        m.write_le(&mut buf);
        self.qid_to_id.write_all(&buf)?;
        self.num_mappings += 1;
        Ok(())
    }

    /// Projected in-memory size of the final tables.
    pub fn projected_bytes(&self) -> u64 {
        self.num_points * 8
            + self.num_line_points * 4
            + self.num_lines * 8
            + self.num_mappings * IdMapping::SIZE as u64
    }
}

/// In-memory tables materialised from the scratch files.
pub(crate) struct CacheTables {
    pub points: Vec<FPoint>,
    pub line_points: Vec<Point<i16>>,
    pub lines: Vec<u64>,
    pub qid_to_id: Vec<IdMapping>,
}

fn reopen(w: BufWriter<File>) -> io::Result<BufReader<File>> {
    let mut f = w.into_inner().map_err(|e| e.into_error())?;
    f.seek(SeekFrom::Start(0))?;
    Ok(BufReader::with_capacity(WRITE_BUF, f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    InHeader,
    InRow,
}

/// What one geometry column parsed into.
enum ParsedGeom {
    Point(FPoint),
    /// Sub-geometry vertex sequences in source order (empty sequences kept
    /// so continuation numbering matches the source).
    Lines(Vec<FLine>, bool),
    Invalid,
}

/// Restartable TSV → geometry state machine.
pub(crate) struct WktIngest {
    state: ParseState,
    dangling: Vec<u8>,
    prev: Vec<u8>,
    last: IdMapping,
    cur_row: u64,
    total_rows: u64,
    unique_geoms: u64,
    scratch: ScratchFiles,
    enc_buf: Vec<Point<i16>>,
}

impl WktIngest {
    pub fn new(total_rows: u64) -> io::Result<Self> {
        Ok(Self {
            state: ParseState::InHeader,
            dangling: Vec::with_capacity(10_000),
            prev: Vec::new(),
            // no previous row: qid != 0 so nothing dedups against it
            last: IdMapping {
                qid: u64::MAX,
                gid: INVALID_GID,
            },
            cur_row: 0,
            total_rows,
            unique_geoms: 0,
            scratch: ScratchFiles::new()?,
            enc_buf: Vec::new(),
        })
    }

    /// Rows fully ingested so far (drives OFFSET paging).
    pub fn rows(&self) -> u64 {
        self.cur_row
    }

    pub fn unique_geoms(&self) -> u64 {
        self.unique_geoms
    }

    /// Reset per-part parser state; every page response starts with its own
    /// TSV header line.
    pub fn reset_part(&mut self) {
        self.state = ParseState::InHeader;
        self.dangling.clear();
    }

    /// Feed one fragment. Restartable across arbitrary byte boundaries.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        for &b in chunk {
            match self.state {
                ParseState::InHeader => {
                    if b == b'\n' {
                        self.state = ParseState::InRow;
                    }
                }
                ParseState::InRow => {
                    if b == b'\t' || b == b'\n' {
                        self.handle_column()?;
                        if b == b'\n' {
                            self.cur_row += 1;
                            if self.cur_row % 1_000_000 == 0 {
                                let pct = if self.total_rows > 0 {
                                    self.cur_row as f64 / self.total_rows as f64 * 100.0
                                } else {
                                    0.0
                                };
                                tracing::info!(
                                    row = self.cur_row,
                                    pct,
                                    points = self.scratch.num_points,
                                    lines = self.scratch.num_lines,
                                    "ingesting geometries"
                                );
                            }
                        }
                        self.prev = std::mem::take(&mut self.dangling);
                    } else {
                        self.dangling.push(b);
                    }
                }
            }
        }
        Ok(())
    }

    /// Materialise the scratch files into vectors, checking the projected
    /// size against `budget` (0 disables the check).
    pub fn finish(mut self, budget: u64) -> Result<CacheTables> {
        let needed = self.scratch.projected_bytes();
        if budget > 0 && needed > budget {
            return Err(CacheError::OutOfMemory { needed, budget });
        }

        tracing::info!(
            rows = self.cur_row,
            unique = self.unique_geoms,
            points = self.scratch.num_points,
            lines = self.scratch.num_lines,
            "materialising cache tables"
        );

        let mut points = Vec::with_capacity(self.scratch.num_points as usize);
        let mut r = reopen(self.scratch.points)?;
        let mut buf8 = [0u8; 8];
        for _ in 0..self.scratch.num_points {
            r.read_exact(&mut buf8)?;
            points.push(Point::new(
                f32::from_le_bytes(buf8[0..4].try_into().unwrap()),
                f32::from_le_bytes(buf8[4..8].try_into().unwrap()),
            ));
        }

        let mut line_points = Vec::with_capacity(self.scratch.num_line_points as usize);
        let mut r = reopen(self.scratch.line_points)?;
        let mut buf4 = [0u8; 4];
        for _ in 0..self.scratch.num_line_points {
            r.read_exact(&mut buf4)?;
            line_points.push(Point::new(
                i16::from_le_bytes(buf4[0..2].try_into().unwrap()),
                i16::from_le_bytes(buf4[2..4].try_into().unwrap()),
            ));
        }

        let mut lines = Vec::with_capacity(self.scratch.num_lines as usize);
        let mut r = reopen(self.scratch.lines)?;
        for _ in 0..self.scratch.num_lines {
            r.read_exact(&mut buf8)?;
            lines.push(u64::from_le_bytes(buf8));
        }

        let mut qid_to_id = Vec::with_capacity(self.scratch.num_mappings as usize);
        let mut r = reopen(self.scratch.qid_to_id)?;
        let mut buf12 = [0u8; IdMapping::SIZE];
        for _ in 0..self.scratch.num_mappings {
            r.read_exact(&mut buf12)?;
            qid_to_id.push(IdMapping::read_le(&buf12));
        }

        Ok(CacheTables {
            points,
            line_points,
            lines,
            qid_to_id,
        })
    }

    fn handle_column(&mut self) -> Result<()> {
        // consecutive identical WKT behind a primary row reuses its gid;
        // results are ORDER BY ?geometry so this is the only dedup needed
        if self.last.qid == 0 && self.dangling == self.prev {
            let m = IdMapping {
                qid: 0,
                gid: self.last.gid,
            };
            self.set_mapping(m)?;
            return Ok(());
        }

        let parsed = match std::str::from_utf8(&self.dangling) {
            Ok(col) => parse_geom_column(col),
            Err(_) => ParsedGeom::Invalid,
        };

        match parsed {
            ParsedGeom::Point(p) => {
                self.unique_geoms += 1;
                let gid = self.scratch.write_point(p)?;
                self.set_mapping(IdMapping { qid: 0, gid })?;
            }
            ParsedGeom::Lines(rings, is_area) => {
                self.unique_geoms += 1;
                let mut i = 0u64;
                for ring in &rings {
                    if ring.is_empty() {
                        if i == 0 {
                            self.set_sentinel()?;
                        }
                    } else {
                        self.enc_buf.clear();
                        mcoord::encode_line(ring, is_area, &mut self.enc_buf);
                        let encoded = std::mem::take(&mut self.enc_buf);
                        let gid = self.scratch.write_line(&encoded)?;
                        self.enc_buf = encoded;
                        self.set_mapping(IdMapping {
                            qid: u64::from(i != 0),
                            gid,
                        })?;
                    }
                    i += 1;
                }
                if i == 0 {
                    self.set_sentinel()?;
                }
            }
            ParsedGeom::Invalid => self.set_sentinel()?,
        }
        Ok(())
    }

    fn set_mapping(&mut self, m: IdMapping) -> Result<()> {
        self.last = m;
        self.scratch.write_mapping(m)?;
        Ok(())
    }

    fn set_sentinel(&mut self) -> Result<()> {
        self.set_mapping(IdMapping {
            qid: 0,
            gid: INVALID_GID,
        })
    }
}

/// Classify and parse one TSV geometry column. The column text still
/// carries the TSV quoting and an optional `^^<…wktLiteral>` suffix, which
/// the coordinate scanners stop short of.
fn parse_geom_column(col: &str) -> ParsedGeom {
    if let Some(rest) = col.strip_prefix("\"POINT(") {
        match wkt::parse_point(rest) {
            Some(p) => ParsedGeom::Point(p),
            None => ParsedGeom::Invalid,
        }
    } else if let Some(rest) = col.strip_prefix("\"LINESTRING(") {
        ParsedGeom::Lines(vec![wkt::parse_line_string(rest)], false)
    } else if let Some(rest) = col.strip_prefix("\"MULTILINESTRING(") {
        ParsedGeom::Lines(parse_rings(rest), false)
    } else if let Some(rest) = col.strip_prefix("\"POLYGON(") {
        ParsedGeom::Lines(parse_rings(rest), true)
    } else if let Some(rest) = col.strip_prefix("\"MULTIPOLYGON(") {
        ParsedGeom::Lines(parse_rings(rest), true)
    } else {
        ParsedGeom::Invalid
    }
}

fn parse_rings(body: &str) -> Vec<FLine> {
    wkt::ring_offsets(body)
        .map(|off| wkt::parse_line_string(&body[off..]))
        .collect()
}
