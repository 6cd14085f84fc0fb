//! Points, boxes and polyline math in web-Mercator space.
//!
//! Coordinates are stored as `f32` (the cache keeps hundreds of millions of
//! them); distance computations run in `f64`.

/// A generic 2-D point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

impl<T> Point<T> {
    pub fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

/// A point in web-Mercator meters.
pub type FPoint = Point<f32>;

/// A polyline in web-Mercator meters.
pub type FLine = Vec<FPoint>;

/// Axis-aligned bounding box.
///
/// The default box is empty (`ll > ur`); [`FBox::extend`] grows it to cover
/// points, and an empty box never intersects or contains anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FBox {
    pub ll: FPoint,
    pub ur: FPoint,
}

impl Default for FBox {
    fn default() -> Self {
        Self {
            ll: Point::new(f32::MAX, f32::MAX),
            ur: Point::new(f32::MIN, f32::MIN),
        }
    }
}

impl FBox {
    pub fn new(ll: FPoint, ur: FPoint) -> Self {
        Self { ll, ur }
    }

    /// A degenerate box covering a single point.
    pub fn around(p: FPoint) -> Self {
        Self { ll: p, ur: p }
    }

    /// An empty box extends to nothing; a valid box has `ll <= ur`.
    pub fn is_valid(&self) -> bool {
        self.ll.x <= self.ur.x && self.ll.y <= self.ur.y
    }

    pub fn width(&self) -> f32 {
        self.ur.x - self.ll.x
    }

    pub fn height(&self) -> f32 {
        self.ur.y - self.ll.y
    }

    /// Grow the box to cover `p`.
    pub fn extend(&mut self, p: FPoint) {
        self.ll.x = self.ll.x.min(p.x);
        self.ll.y = self.ll.y.min(p.y);
        self.ur.x = self.ur.x.max(p.x);
        self.ur.y = self.ur.y.max(p.y);
    }

    /// Union of two boxes.
    pub fn extended(&self, other: &FBox) -> FBox {
        if !other.is_valid() {
            return *self;
        }
        let mut ret = *self;
        ret.extend(other.ll);
        ret.extend(other.ur);
        ret
    }

    /// Box grown by `amount` on every side.
    pub fn padded(&self, amount: f32) -> FBox {
        FBox {
            ll: Point::new(self.ll.x - amount, self.ll.y - amount),
            ur: Point::new(self.ur.x + amount, self.ur.y + amount),
        }
    }

    pub fn intersects(&self, other: &FBox) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.ll.x <= other.ur.x
            && self.ur.x >= other.ll.x
            && self.ll.y <= other.ur.y
            && self.ur.y >= other.ll.y
    }

    pub fn contains(&self, p: FPoint) -> bool {
        p.x >= self.ll.x && p.x <= self.ur.x && p.y >= self.ll.y && p.y <= self.ur.y
    }
}

const EARTH_RADIUS: f64 = 6378137.0;
const DEG_TO_RAD: f64 = 0.017453292519943295;

/// Project a WGS84 longitude/latitude pair to web-Mercator (EPSG:3857).
///
/// Poles and malformed inputs yield non-finite coordinates; callers filter
/// with [`point_valid`].
pub fn web_merc(lng: f64, lat: f64) -> FPoint {
    let x = EARTH_RADIUS * lng * DEG_TO_RAD;
    let a = lat * DEG_TO_RAD;
    let y = (EARTH_RADIUS / 2.0) * ((1.0 + a.sin()) / (1.0 - a.sin())).ln();
    Point::new(x as f32, y as f32)
}

/// A point is valid when both coordinates are finite `f32`s.
pub fn point_valid(p: FPoint) -> bool {
    p.x.is_finite() && p.y.is_finite()
}

/// Euclidean distance.
pub fn dist(a: FPoint, b: FPoint) -> f64 {
    let dx = a.x as f64 - b.x as f64;
    let dy = a.y as f64 - b.y as f64;
    (dx * dx + dy * dy).sqrt()
}

/// Distance from `p` to the segment `a`-`b`.
pub fn dist_to_segment(a: FPoint, b: FPoint, p: FPoint) -> f64 {
    dist(project_on_segment(a, b, p), p)
}

/// The point on segment `a`-`b` closest to `p`.
pub fn project_on_segment(a: FPoint, b: FPoint, p: FPoint) -> FPoint {
    let (ax, ay) = (a.x as f64, a.y as f64);
    let (bx, by) = (b.x as f64, b.y as f64);
    let (px, py) = (p.x as f64, p.y as f64);
    let dx = bx - ax;
    let dy = by - ay;
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return a;
    }
    let t = (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0);
    Point::new((ax + t * dx) as f32, (ay + t * dy) as f32)
}

/// The point on `line` closest to `p`.
pub fn project_on_polyline(line: &[FPoint], p: FPoint) -> FPoint {
    if line.is_empty() {
        return p;
    }
    if line.len() == 1 {
        return line[0];
    }
    let mut best = line[0];
    let mut best_d = f64::MAX;
    for seg in line.windows(2) {
        let cand = project_on_segment(seg[0], seg[1], p);
        let d = dist(cand, p);
        if d < best_d {
            best_d = d;
            best = cand;
        }
    }
    best
}

/// Whether the segment `a`-`b` crosses the horizontal ray extending from `p`
/// toward +x. Toggling a flag per crossing segment yields the even-odd
/// containment test for a closed ring.
pub fn crosses_ray(a: FPoint, b: FPoint, p: FPoint) -> bool {
    let (ax, ay) = (a.x as f64, a.y as f64);
    let (bx, by) = (b.x as f64, b.y as f64);
    let (px, py) = (p.x as f64, p.y as f64);
    if (ay > py) == (by > py) {
        return false;
    }
    px < (bx - ax) * (py - ay) / (by - ay) + ax
}

/// Even-odd containment test for a closed ring.
pub fn ring_contains(ring: &[FPoint], p: FPoint) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        if crosses_ray(ring[j], ring[i], p) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Bounding box of a point sequence.
pub fn bounding_box(line: &[FPoint]) -> FBox {
    let mut b = FBox::default();
    for &p in line {
        b.extend(p);
    }
    b
}

/// Douglas-Peucker simplification with tolerance `eps`.
pub fn simplify(line: &[FPoint], eps: f64) -> FLine {
    if line.len() < 3 {
        return line.to_vec();
    }
    let mut keep = vec![false; line.len()];
    keep[0] = true;
    keep[line.len() - 1] = true;
    simplify_mark(line, 0, line.len() - 1, eps, &mut keep);
    line.iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(&p, _)| p)
        .collect()
}

fn simplify_mark(line: &[FPoint], lo: usize, hi: usize, eps: f64, keep: &mut [bool]) {
    if hi <= lo + 1 {
        return;
    }
    let mut max_d = 0.0;
    let mut max_i = lo;
    for i in lo + 1..hi {
        let d = dist_to_segment(line[lo], line[hi], line[i]);
        if d > max_d {
            max_d = d;
            max_i = i;
        }
    }
    if max_d > eps {
        keep[max_i] = true;
        simplify_mark(line, lo, max_i, eps, keep);
        simplify_mark(line, max_i, hi, eps, keep);
    }
}

/// Insert intermediate vertices so no segment is longer than `max_dist`.
pub fn densify(line: &[FPoint], max_dist: f64) -> FLine {
    if line.len() < 2 {
        return line.to_vec();
    }
    let mut out = Vec::with_capacity(line.len());
    out.push(line[0]);
    for seg in line.windows(2) {
        let (a, b) = (seg[0], seg[1]);
        let d = dist(a, b);
        if d > max_dist {
            let n = (d / max_dist).ceil() as usize;
            for k in 1..n {
                let t = k as f64 / n as f64;
                out.push(Point::new(
                    (a.x as f64 + (b.x as f64 - a.x as f64) * t) as f32,
                    (a.y as f64 + (b.y as f64 - a.y as f64) * t) as f32,
                ));
            }
        }
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_merc_known_point() {
        // Freiburg: 7.85 E, 48.0 N
        let p = web_merc(7.85, 48.0);
        assert!((p.x - 873_857.0).abs() < 100.0, "x was {}", p.x);
        assert!((p.y - 6_106_854.0).abs() < 100.0, "y was {}", p.y);
    }

    #[test]
    fn test_web_merc_pole_is_invalid() {
        assert!(!point_valid(web_merc(0.0, 90.0)));
        assert!(!point_valid(web_merc(f64::NAN, 0.0)));
    }

    #[test]
    fn test_box_extend_and_pad() {
        let mut b = FBox::default();
        assert!(!b.is_valid());
        b.extend(Point::new(1.0, 2.0));
        b.extend(Point::new(-1.0, 5.0));
        assert!(b.is_valid());
        assert_eq!(b.ll, Point::new(-1.0, 2.0));
        assert_eq!(b.ur, Point::new(1.0, 5.0));

        let p = b.padded(1.0);
        assert_eq!(p.ll, Point::new(-2.0, 1.0));
        assert_eq!(p.ur, Point::new(2.0, 6.0));
    }

    #[test]
    fn test_empty_box_stays_empty() {
        let b = FBox::default().padded(1.0);
        assert!(!b.is_valid());
        assert!(!b.intersects(&FBox::around(Point::new(0.0, 0.0))));
    }

    #[test]
    fn test_dist_to_segment() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(10.0, 0.0);
        assert!((dist_to_segment(a, b, Point::new(5.0, 3.0)) - 3.0).abs() < 1e-6);
        // beyond the end: distance to the endpoint
        assert!((dist_to_segment(a, b, Point::new(13.0, 4.0)) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_project_on_polyline() {
        let line = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
        ];
        let p = project_on_polyline(&line, Point::new(12.0, 5.0));
        assert!((p.x - 10.0).abs() < 1e-6);
        assert!((p.y - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_ring_contains() {
        let ring = vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
            Point::new(0.0, 0.0),
        ];
        assert!(ring_contains(&ring, Point::new(2.0, 2.0)));
        assert!(!ring_contains(&ring, Point::new(5.0, 2.0)));
        assert!(!ring_contains(&ring, Point::new(-1.0, -1.0)));
    }

    #[test]
    fn test_simplify_keeps_sharp_corners() {
        let line = vec![
            Point::new(0.0, 0.0),
            Point::new(2.5, 2.6), // nearly on the first leg
            Point::new(5.0, 5.0),
            Point::new(10.0, 0.0),
        ];
        let out = simplify(&line, 3.0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], line[0]);
        assert_eq!(out[1], line[2]);
        assert_eq!(out[2], line[3]);
    }

    #[test]
    fn test_densify_segment_lengths() {
        let line = vec![Point::new(0.0, 0.0), Point::new(0.0, 2000.0)];
        let out = densify(&line, 600.0);
        assert!(out.len() > 2);
        for seg in out.windows(2) {
            assert!(dist(seg[0], seg[1]) <= 600.0 + 1e-3);
        }
        assert_eq!(*out.first().unwrap(), line[0]);
        assert_eq!(*out.last().unwrap(), line[1]);
    }
}
