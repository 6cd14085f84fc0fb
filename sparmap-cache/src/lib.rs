//! Compressed geometry cache for a SPARQL backend.
//!
//! The cache ingests the backend's entire geometry corpus once (a streaming
//! TSV pass that compresses WKT into compact binary tables, then a binary
//! id pass that attaches the backend's per-row identifiers), and afterwards
//! serves geometry lookups and the id join for every session built against
//! that backend.

pub mod backend;
pub mod error;

mod cache;
mod ids;
mod ingest;

pub use backend::{SparqlBackend, MAX_ROWS};
pub use cache::GeomCache;
pub use error::{CacheError, Result};

/// Internal geometry identifier.
///
/// Partitioned by [`I_OFFSET`]: values below it index the point table,
/// values in `I_OFFSET..INVALID_GID` index the line table (after
/// subtracting the offset), and [`INVALID_GID`] marks a row without a
/// usable geometry.
pub type Gid = u32;

/// First line-table id; point ids stay below this.
pub const I_OFFSET: Gid = 1 << 31;

/// Sentinel for rows whose geometry could not be parsed.
pub const INVALID_GID: Gid = Gid::MAX;

/// Join-key pair. During the WKT pass `qid` holds only a flag (0 =
/// primary geometry of its row, 1 = continuation of a multi-geometry);
/// the binary id pass overwrites it with the backend's real row id.
///
/// On the query side the same layout carries `(backend qid, result row)`
/// pairs, with the row number in `gid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub qid: u64,
    pub gid: Gid,
}

impl IdMapping {
    pub const SIZE: usize = 12;

    pub fn write_le(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..8].copy_from_slice(&self.qid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.gid.to_le_bytes());
    }

    pub fn read_le(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            qid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            gid: Gid::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// `(geometry id, result row)` pair produced by the id join.
pub type RelObject = (Gid, u32);
