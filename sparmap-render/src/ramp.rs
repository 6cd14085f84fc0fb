//! Colour ramp: gradient stops interpolated into a 256-entry RGBA LUT.

/// Colour ramp mapping normalised intensity to RGBA.
#[derive(Debug, Clone)]
pub struct ColorRamp {
    lut: Vec<[u8; 4]>,
}

impl ColorRamp {
    /// Build a ramp from sorted `(position, rgba)` stops; positions are
    /// clamped to `0.0..=1.0`.
    pub fn new(stops: &[(f32, [u8; 4])]) -> Self {
        assert!(!stops.is_empty(), "a ramp needs at least one stop");
        let mut lut = Vec::with_capacity(256);
        for i in 0..256 {
            let t = i as f32 / 255.0;
            lut.push(eval_stops(stops, t));
        }
        Self { lut }
    }

    /// The default heat ramp: transparent through blue, cyan, green,
    /// yellow to red.
    pub fn heat() -> Self {
        Self::new(&[
            (0.00, [0, 0, 0, 0]),
            (0.10, [0, 0, 180, 120]),
            (0.35, [0, 200, 255, 180]),
            (0.55, [0, 220, 0, 210]),
            (0.75, [255, 240, 0, 235]),
            (1.00, [255, 0, 0, 255]),
        ])
    }

    /// Colour for a normalised intensity in `0.0..=1.0`.
    pub fn eval(&self, t: f32) -> [u8; 4] {
        let idx = (t.clamp(0.0, 1.0) * 255.0) as usize;
        self.lut[idx]
    }
}

fn eval_stops(stops: &[(f32, [u8; 4])], t: f32) -> [u8; 4] {
    let t = t.clamp(0.0, 1.0);
    if t <= stops[0].0 {
        return stops[0].1;
    }
    for w in stops.windows(2) {
        let (p0, c0) = w[0];
        let (p1, c1) = w[1];
        if t <= p1 {
            let f = if p1 > p0 { (t - p0) / (p1 - p0) } else { 1.0 };
            let mut out = [0u8; 4];
            for k in 0..4 {
                out[k] = (c0[k] as f32 + (c1[k] as f32 - c0[k] as f32) * f).round() as u8;
            }
            return out;
        }
    }
    stops[stops.len() - 1].1
}
