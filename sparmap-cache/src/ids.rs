//! Binary id-pass ingest.
//!
//! The backend streams one little-endian `u64` per result row with no
//! framing. Each decoded id lands in the next `qid_to_id` slot, replacing
//! the placeholder flag written by the WKT pass; continuation rows (flag 1)
//! inherit the id of the preceding primary row.

use crate::error::{CacheError, Result};
use crate::IdMapping;

pub(crate) struct IdsIngest {
    cur: [u8; 8],
    cur_byte: usize,
    cur_row: usize,
    max_qid: u64,
}

impl IdsIngest {
    pub fn new() -> Self {
        Self {
            cur: [0; 8],
            cur_byte: 0,
            cur_row: 0,
            max_qid: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.cur_row
    }

    pub fn max_qid(&self) -> u64 {
        self.max_qid
    }

    /// Feed one fragment; restartable across arbitrary byte boundaries.
    pub fn feed(&mut self, chunk: &[u8], qid_to_id: &mut [IdMapping]) {
        for &b in chunk {
            self.cur[self.cur_byte] = b;
            self.cur_byte = (self.cur_byte + 1) % 8;
            if self.cur_byte != 0 {
                continue;
            }

            let qid = u64::from_le_bytes(self.cur);
            if self.cur_row < qid_to_id.len() && qid_to_id[self.cur_row].qid == 0 {
                qid_to_id[self.cur_row].qid = qid;
                if qid > self.max_qid {
                    self.max_qid = qid;
                }
            } else {
                tracing::warn!(
                    row = self.cur_row,
                    mappings = qid_to_id.len(),
                    "binary id stream out of sync"
                );
            }

            // continuation geometries of the same source row follow their
            // primary directly and inherit its id
            while self.cur_row + 1 < qid_to_id.len() && qid_to_id[self.cur_row + 1].qid == 1 {
                self.cur_row += 1;
                qid_to_id[self.cur_row].qid = qid;
            }

            self.cur_row += 1;
            if self.cur_row % 1_000_000 == 0 {
                tracing::info!(row = self.cur_row, "binary id pass");
            }
        }
    }

    /// A partial trailing id means the stream was cut mid-row.
    pub fn finish(&self) -> Result<()> {
        if self.cur_byte != 0 {
            return Err(CacheError::Protocol(format!(
                "binary id stream ended mid-value ({} trailing bytes)",
                self.cur_byte
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_GID;

    fn mapping(qid: u64, gid: u32) -> IdMapping {
        IdMapping { qid, gid }
    }

    #[test]
    fn test_overwrites_placeholders_in_order() {
        let mut m = vec![mapping(0, 10), mapping(0, 11)];
        let mut ing = IdsIngest::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&77u64.to_le_bytes());
        ing.feed(&bytes, &mut m);
        ing.finish().unwrap();
        assert_eq!(m[0].qid, 42);
        assert_eq!(m[1].qid, 77);
        assert_eq!(ing.rows(), 2);
        assert_eq!(ing.max_qid(), 77);
    }

    #[test]
    fn test_continuations_inherit_qid() {
        // primary, continuation, continuation, then a fresh primary
        let mut m = vec![mapping(0, 1), mapping(1, 2), mapping(1, 3), mapping(0, 4)];
        let mut ing = IdsIngest::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&200u64.to_le_bytes());
        ing.feed(&bytes, &mut m);
        ing.finish().unwrap();
        assert_eq!(m[0].qid, 100);
        assert_eq!(m[1].qid, 100);
        assert_eq!(m[2].qid, 100);
        assert_eq!(m[3].qid, 200);
    }

    #[test]
    fn test_sentinel_rows_still_get_ids() {
        let mut m = vec![mapping(0, INVALID_GID), mapping(0, 5)];
        let mut ing = IdsIngest::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&9u64.to_le_bytes());
        ing.feed(&bytes, &mut m);
        assert_eq!(m[0].qid, 7);
        assert_eq!(m[0].gid, INVALID_GID);
        assert_eq!(m[1].qid, 9);
    }

    #[test]
    fn test_fragmented_feed() {
        let mut m = vec![mapping(0, 1)];
        let mut ing = IdsIngest::new();
        let bytes = 0xDEAD_BEEF_CAFE_F00Du64.to_le_bytes();
        ing.feed(&bytes[..3], &mut m);
        ing.feed(&bytes[3..], &mut m);
        ing.finish().unwrap();
        assert_eq!(m[0].qid, 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn test_trailing_partial_is_protocol_error() {
        let mut m = vec![mapping(0, 1)];
        let mut ing = IdsIngest::new();
        ing.feed(&[1, 2, 3], &mut m);
        assert!(matches!(ing.finish(), Err(CacheError::Protocol(_))));
    }
}
