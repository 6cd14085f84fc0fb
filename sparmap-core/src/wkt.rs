//! Micro-parser for the WKT subset the backend emits.
//!
//! Accepted shapes: `POINT`, `LINESTRING`, `POLYGON`, `MULTILINESTRING`,
//! `MULTIPOLYGON`. Coordinates are WGS84 `lng lat` pairs and are projected
//! to web-Mercator on the fly; pairs that fail to parse or project are
//! dropped silently. Parsed vertex sequences are simplified and densified
//! before storage so the line store stays compact while the sub-cell
//! footprint sampling keeps enough vertices per cell.

use crate::geo::{self, densify, point_valid, simplify, FLine, FPoint};

/// Simplification tolerance applied to every parsed vertex sequence.
pub const SIMPLIFICATION_EPS: f64 = 3.0;

/// Densification interval: the renderer's 200-unit per-pixel threshold
/// times the simplification tolerance.
pub const DENSIFY_DIST: f64 = 600.0;

/// Parse the leading `lng lat` pair of `s` (the text following an opening
/// paren), projected to web-Mercator. `None` for malformed or non-finite
/// coordinates.
pub fn parse_point(s: &str) -> Option<FPoint> {
    let (lng, lat) = parse_coord_pair(s)?;
    let p = geo::web_merc(lng, lat);
    point_valid(p).then_some(p)
}

/// Parse a comma-separated coordinate list up to the closing paren.
/// Invalid pairs are dropped; the surviving vertices are simplified with
/// [`SIMPLIFICATION_EPS`] and densified with [`DENSIFY_DIST`].
pub fn parse_line_string(s: &str) -> FLine {
    let end = s.find(')').unwrap_or(s.len());
    let mut line = FLine::new();
    for part in s[..end].split(',') {
        if let Some((lng, lat)) = parse_coord_pair(part) {
            let p = geo::web_merc(lng, lat);
            if point_valid(p) {
                line.push(p);
            }
        }
    }
    densify(&simplify(&line, SIMPLIFICATION_EPS), DENSIFY_DIST)
}

/// Byte offsets just past each ring-opening paren in a multi-geometry body
/// (the text following the type keyword's own paren). Grouping parens —
/// those immediately followed by another paren — are skipped, which handles
/// the extra nesting level of `MULTIPOLYGON`.
pub fn ring_offsets(body: &str) -> impl Iterator<Item = usize> + '_ {
    let bytes = body.as_bytes();
    bytes.iter().enumerate().filter_map(move |(i, &b)| {
        (b == b'(' && bytes.get(i + 1) != Some(&b'(')).then_some(i + 1)
    })
}

fn parse_coord_pair(s: &str) -> Option<(f64, f64)> {
    let s = s.trim_start();
    let end = s.find([',', ')']).unwrap_or(s.len());
    let mut it = s[..end].split_whitespace();
    let lng = it.next()?.parse::<f64>().ok()?;
    let lat = it.next()?.parse::<f64>().ok()?;
    Some((lng, lat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{dist, web_merc};

    #[test]
    fn test_parse_point() {
        let p = parse_point("7.85 48.00)").unwrap();
        assert!(dist(p, web_merc(7.85, 48.0)) < 1e-3);
    }

    #[test]
    fn test_parse_point_invalid() {
        // "NaN" parses as a float but projects to a non-finite point
        assert!(parse_point("NaN 0)").is_none());
        assert!(parse_point("0 91)").is_none());
        assert!(parse_point("garbage)").is_none());
        assert!(parse_point(")").is_none());
    }

    #[test]
    fn test_parse_line_string() {
        let line = parse_line_string("0 0, 1 1, 2 2)\"^^<ignored>");
        assert!(line.len() >= 2);
        assert!(dist(line[0], web_merc(0.0, 0.0)) < 1e-3);
        assert!(dist(*line.last().unwrap(), web_merc(2.0, 2.0)) < 1e-3);
    }

    #[test]
    fn test_parse_line_string_drops_invalid_pairs() {
        let line = parse_line_string("0 0, bogus, 1 1)");
        assert!(dist(line[0], web_merc(0.0, 0.0)) < 1e-3);
        assert!(dist(*line.last().unwrap(), web_merc(1.0, 1.0)) < 1e-3);
    }

    #[test]
    fn test_parse_line_string_empty() {
        assert!(parse_line_string(")").is_empty());
        assert!(parse_line_string("x y, a b)").is_empty());
    }

    #[test]
    fn test_ring_offsets_polygon() {
        // body as it appears after "POLYGON(": outer ring plus one hole
        let body = "(0 0,1 0,1 1,0 0),(0.2 0.2,0.4 0.2,0.2 0.2))";
        let offsets: Vec<_> = ring_offsets(body).collect();
        assert_eq!(offsets.len(), 2);
        assert!(body[offsets[0]..].starts_with("0 0"));
        assert!(body[offsets[1]..].starts_with("0.2 0.2"));
    }

    #[test]
    fn test_ring_offsets_multipolygon() {
        // body after "MULTIPOLYGON(": two single-ring polygons
        let body = "((0 0,1 0,1 1,0 0)),((2 2,3 2,3 3,2 2)))";
        let offsets: Vec<_> = ring_offsets(body).collect();
        assert_eq!(offsets.len(), 2);
        assert!(body[offsets[0]..].starts_with("0 0"));
        assert!(body[offsets[1]..].starts_with("2 2"));
    }
}
