//! Blocking HTTP client for the SPARQL backend.
//!
//! Both wire modes of the backend are exposed as chunked streaming reads:
//! `text/tab-separated-values` for WKT and attribute rows, and
//! `application/octet-stream` for the raw 8-byte-per-row id export.
//! Transfers are blocking on the calling thread; a callback error aborts
//! the transfer.

use std::io::Read;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;

use crate::error::{CacheError, Result};

/// Row ceiling advertised to the backend (`send=` parameter) and the
/// default LIMIT for unbounded exports.
pub const MAX_ROWS: u64 = u64::MAX;

/// Streaming fragments are read in chunks of at most this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One SPARQL endpoint plus the client used to talk to it.
pub struct SparqlBackend {
    url: String,
    client: Client,
}

impl SparqlBackend {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            // endpoints in the wild run self-signed; transfers can take hours
            .danger_accept_invalid_certs(true)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build the request URL for a query, appending `LIMIT`/`OFFSET` only
    /// when the query does not already carry them.
    pub fn query_url(&self, query: &str, offset: u64, limit: u64) -> String {
        let mut query = query.to_string();
        let lower = query.to_lowercase();
        if !lower.contains("limit") {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        if !lower.contains("offset") {
            query.push_str(&format!(" OFFSET {offset}"));
        }
        let escaped = utf8_percent_encode(&query, NON_ALPHANUMERIC);
        format!("{}/?send={}&query={}", self.url, MAX_ROWS, escaped)
    }

    /// Stream a TSV result set, feeding `f` fragments of at most
    /// [`CHUNK_SIZE`] bytes.
    pub fn stream_tsv<F>(&self, query: &str, offset: u64, limit: u64, f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.stream(
            &self.query_url(query, offset, limit),
            "text/tab-separated-values",
            f,
        )
    }

    /// Stream the binary id export: one little-endian `u64` per result row,
    /// no framing.
    pub fn stream_ids<F>(&self, query: &str, f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.stream(
            &self.query_url(query, 0, MAX_ROWS),
            "application/octet-stream",
            f,
        )
    }

    /// Fetch a small TSV result set wholesale (count pre-pass, row-detail
    /// fetches).
    pub fn fetch_tsv(&self, query: &str, offset: u64, limit: u64) -> Result<String> {
        let mut body = Vec::new();
        self.stream_tsv(query, offset, limit, |chunk| {
            body.extend_from_slice(chunk);
            Ok(())
        })?;
        String::from_utf8(body)
            .map_err(|e| CacheError::Protocol(format!("non-UTF-8 TSV response: {e}")))
    }

    fn stream<F>(&self, url: &str, accept: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        // reqwest advertises accept-encoding for its enabled codecs and
        // decompresses transparently ("accept any" on the wire)
        let resp = self.client.get(url).header(ACCEPT, accept).send()?;
        let mut resp = resp.error_for_status()?;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = resp.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            f(&buf[..n])?;
        }
    }
}
