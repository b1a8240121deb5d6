//! Calibration engine: maps raw driver output to real-world values through
//! a set of (raw, real) points.
//!
//! Evaluation rules:
//! - no points: the raw value passes through unchanged
//! - one point `(r0, v0)`: offset-only, `raw + (v0 - r0)`
//! - two or more: piecewise-linear on raw, endpoint slopes extrapolated
//!   outside the hull
//!
//! `Calibration` is an immutable value type. The read pipeline snapshots a
//! sensor's calibration under its entity lock before evaluating, so an
//! update arriving mid-read never affects the in-flight evaluation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalPoint {
    pub raw: f64,
    pub real: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Calibration {
    points: Vec<CalPoint>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut cal = Self::new();
        for (raw, real) in points {
            cal.add_point(raw, real);
        }
        cal
    }

    /// Parse the persisted JSON form (`[]` and `{}` both mean empty — the
    /// latter is what older rows carry).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        if json.trim().is_empty() || json.trim() == "{}" {
            return Ok(Self::new());
        }
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.points).expect("calibration points serialize")
    }

    pub fn points(&self) -> &[CalPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Add a point, replacing any existing point with the same raw value.
    /// Points are kept sorted by raw.
    pub fn add_point(&mut self, raw: f64, real: f64) {
        self.points.retain(|p| p.raw != raw);
        self.points.push(CalPoint { raw, real });
        self.points.sort_by(|a, b| a.raw.total_cmp(&b.raw));
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn evaluate(&self, raw: f64) -> f64 {
        match self.points.len() {
            0 => raw,
            1 => raw + (self.points[0].real - self.points[0].raw),
            _ => self.interpolate(raw),
        }
    }

    fn interpolate(&self, raw: f64) -> f64 {
        let pts = &self.points;
        let first = &pts[0];
        let last = &pts[pts.len() - 1];

        if raw <= first.raw {
            let next = &pts[1];
            let slope = (next.real - first.real) / (next.raw - first.raw);
            return first.real + (raw - first.raw) * slope;
        }
        if raw >= last.raw {
            let prev = &pts[pts.len() - 2];
            let slope = (last.real - prev.real) / (last.raw - prev.raw);
            return last.real + (raw - last.raw) * slope;
        }

        // Interior: find the bracketing interval.
        for window in pts.windows(2) {
            let (lo, hi) = (&window[0], &window[1]);
            if raw >= lo.raw && raw <= hi.raw {
                let ratio = (raw - lo.raw) / (hi.raw - lo.raw);
                return lo.real + ratio * (hi.real - lo.real);
            }
        }
        unreachable!("raw is inside the hull but no interval matched")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Evaluation rules ---------------------------------------------------

    #[test]
    fn empty_calibration_is_identity() {
        let cal = Calibration::new();
        assert_eq!(cal.evaluate(123.456), 123.456);
        assert_eq!(cal.evaluate(-7.0), -7.0);
    }

    #[test]
    fn single_point_is_offset_only() {
        // ORP-style: known 650 mV solution measured 643 mV.
        let cal = Calibration::from_points([(643.0, 650.0)]);
        assert_eq!(cal.evaluate(643.0), 650.0);
        assert_eq!(cal.evaluate(600.0), 607.0);
        assert_eq!(cal.evaluate(0.0), 7.0);
    }

    #[test]
    fn two_point_ph_interpolation() {
        // pH probe: 0.5 V in pH 7 buffer, 3.0 V in pH 4 buffer.
        let cal = Calibration::from_points([(0.5, 7.0), (3.0, 4.0)]);
        assert!((cal.evaluate(1.75) - 5.5).abs() < 1e-12);
    }

    #[test]
    fn evaluate_reproduces_every_stored_point() {
        let cal = Calibration::from_points([(1.0, 10.0), (2.0, 20.0), (4.0, 30.0)]);
        for p in cal.points() {
            assert_eq!(cal.evaluate(p.raw), p.real, "point ({}, {})", p.raw, p.real);
        }
    }

    #[test]
    fn below_hull_extrapolates_first_interval_slope() {
        let cal = Calibration::from_points([(1.0, 10.0), (2.0, 20.0), (4.0, 30.0)]);
        // First interval slope is 10 per raw unit.
        assert!((cal.evaluate(0.0) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn above_hull_extrapolates_last_interval_slope() {
        let cal = Calibration::from_points([(1.0, 10.0), (2.0, 20.0), (4.0, 30.0)]);
        // Last interval slope is 5 per raw unit.
        assert!((cal.evaluate(6.0) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn evaluation_is_continuous_across_knots() {
        let cal = Calibration::from_points([(0.0, 0.0), (10.0, 5.0), (20.0, 50.0)]);
        let eps = 1e-9;
        for knot in [0.0, 10.0, 20.0] {
            let below = cal.evaluate(knot - eps);
            let above = cal.evaluate(knot + eps);
            assert!(
                (below - above).abs() < 1e-6,
                "discontinuity at {knot}: {below} vs {above}"
            );
        }
    }

    #[test]
    fn descending_real_values_supported() {
        // pH falls as voltage rises; raw ordering is what matters.
        let cal = Calibration::from_points([(3.0, 4.0), (0.5, 7.0)]);
        assert_eq!(cal.points()[0].raw, 0.5);
        assert!((cal.evaluate(1.75) - 5.5).abs() < 1e-12);
    }

    // -- Mutation -----------------------------------------------------------

    #[test]
    fn add_point_replaces_same_raw() {
        let mut cal = Calibration::from_points([(1.0, 10.0), (2.0, 20.0)]);
        cal.add_point(1.0, 11.0);
        assert_eq!(cal.len(), 2);
        assert_eq!(cal.evaluate(1.0), 11.0);
    }

    #[test]
    fn add_point_then_evaluate_round_trips_exactly() {
        let mut cal = Calibration::new();
        cal.add_point(0.731, 6.86);
        cal.add_point(2.44, 4.01);
        assert_eq!(cal.evaluate(0.731), 6.86);
        assert_eq!(cal.evaluate(2.44), 4.01);
    }

    #[test]
    fn clear_removes_all_points() {
        let mut cal = Calibration::from_points([(1.0, 2.0)]);
        cal.clear();
        assert!(cal.is_empty());
        assert_eq!(cal.evaluate(5.0), 5.0);
    }

    // -- Persistence --------------------------------------------------------

    #[test]
    fn json_round_trip() {
        let cal = Calibration::from_points([(0.5, 7.0), (3.0, 4.0)]);
        let parsed = Calibration::from_json(&cal.to_json()).unwrap();
        assert_eq!(parsed, cal);
    }

    #[test]
    fn empty_and_legacy_json_parse_as_empty() {
        assert!(Calibration::from_json("").unwrap().is_empty());
        assert!(Calibration::from_json("[]").unwrap().is_empty());
        assert!(Calibration::from_json("{}").unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Calibration::from_json("[{\"raw\":").is_err());
    }
}
