//! SPARQL query rewriting for sessions.
//!
//! The system never parses SPARQL; it only rewrites the outer projection
//! down to the last selected variable and appends paging clauses. Only the
//! first `SELECT … WHERE {` is touched, case-insensitively — nested
//! sub-selects with unusual projections are a known limitation.

use std::sync::OnceLock;

use regex::Regex;

static PROJECTION_RE: OnceLock<Regex> = OnceLock::new();

fn projection_re() -> &'static Regex {
    PROJECTION_RE.get_or_init(|| {
        // the repeated capture group retains its last iteration, i.e. the
        // last projected variable
        Regex::new(r"(?i)select\s*(\?[a-z0-9_+\-]*\s*)+where\s*\{").unwrap()
    })
}

/// Rewrite the outer projection to the last selected variable and append
/// an explicit LIMIT when the query carries none.
pub fn prep_query(query: &str) -> String {
    let mut q = projection_re()
        .replace(query, "SELECT $1 WHERE {")
        .into_owned();
    if !q.to_lowercase().contains("limit") {
        q.push_str(" LIMIT 18446744073709551615");
    }
    q
}

/// Single-row variant for attribute fetches.
pub fn row_query(query: &str, row: u32) -> String {
    format!("{query} OFFSET {row} LIMIT 1")
}

/// Accumulates TSV fragments into complete rows, skipping the header line.
/// Restartable across arbitrary fragment boundaries.
#[derive(Default)]
pub struct TsvRows {
    header_seen: bool,
    dangling: Vec<u8>,
}

impl TsvRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment, returning the rows completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        for &b in chunk {
            if b != b'\n' {
                self.dangling.push(b);
                continue;
            }
            if !self.header_seen {
                self.header_seen = true;
                self.dangling.clear();
                continue;
            }
            let line = std::mem::take(&mut self.dangling);
            if line.is_empty() {
                continue;
            }
            rows.push(
                String::from_utf8_lossy(&line)
                    .split('\t')
                    .map(str::to_string)
                    .collect(),
            );
        }
        rows
    }

    /// Column names from a TSV header line (`?` prefixes stripped).
    pub fn parse_header(line: &str) -> Vec<String> {
        line.trim_end_matches('\r')
            .split('\t')
            .map(|c| c.trim_start_matches('?').to_string())
            .collect()
    }
}
