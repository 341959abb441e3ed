//! Keyframe curves.
use std::cmp;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Cubic hermite spline, as implemented by Unity's `AnimationCurve`.
///
/// Engines describe isp against atmospheric pressure, flow against
/// density and Mach number, and thrust against remaining fuel with these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<KeySpec>", into = "Vec<KeySpec>")]
pub struct FloatCurve {
    min_time: f64,
    max_time: f64,
    keys: Vec<Keyframe>,
}

impl Default for FloatCurve {
    fn default() -> Self {
        Self {
            min_time: f64::MAX,
            max_time: f64::MIN,
            keys: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Keyframe {
    time: f64,
    value: f64,
    in_tangent: f64,
    out_tangent: f64,
    auto_tangent: bool,
}

/// Serialized form of a keyframe: `(time, value)` for automatic tangents
/// or `(time, value, in_tangent, out_tangent)`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Auto(f64, f64),
    Tangents(f64, f64, f64, f64),
}

impl FloatCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn min_time(&self) -> f64 {
        self.min_time
    }

    pub fn max_time(&self) -> f64 {
        self.max_time
    }

    pub fn add(&mut self, time: f64, value: f64) {
        self.insert(Keyframe {
            time,
            value,
            in_tangent: 0.0,
            out_tangent: 0.0,
            auto_tangent: true,
        });
    }

    pub fn add_with_tangents(&mut self, time: f64, value: f64, in_tangent: f64, out_tangent: f64) {
        self.insert(Keyframe {
            time,
            value,
            in_tangent,
            out_tangent,
            auto_tangent: false,
        });
    }

    fn insert(&mut self, frame: Keyframe) {
        let i = self
            .keys
            .partition_point(|k| OrderedFloat(k.time) <= OrderedFloat(frame.time));
        self.keys.insert(i, frame);
        self.min_time = cmp::min(OrderedFloat(self.min_time), OrderedFloat(frame.time)).0;
        self.max_time = cmp::max(OrderedFloat(self.max_time), OrderedFloat(frame.time)).0;
        self.recompute_tangents(i);
    }

    fn recompute_tangents(&mut self, i: usize) {
        if self.keys.len() == 1 {
            let only = &mut self.keys[0];
            if only.auto_tangent {
                only.in_tangent = 0.0;
                only.out_tangent = 0.0;
            }
            return;
        }

        self.fix_tangent(i);
        if i != 0 {
            self.fix_tangent(i - 1);
        }
        if i != self.keys.len() - 1 {
            self.fix_tangent(i + 1);
        }
    }

    fn fix_tangent(&mut self, i: usize) {
        let current = self.keys[i];
        if !current.auto_tangent {
            return;
        }

        let last = self.keys.len() - 1;
        // Keys sharing a time form a step and contribute no slope.
        let slope = |a: &Keyframe, b: &Keyframe| {
            let width = b.time - a.time;
            if width == 0.0 {
                0.0
            } else {
                (b.value - a.value) / width
            }
        };

        let tangent = if i == 0 {
            slope(&current, &self.keys[1])
        } else if i == last {
            slope(&self.keys[i - 1], &current)
        } else {
            (slope(&current, &self.keys[i + 1]) + slope(&self.keys[i - 1], &current)) / 2.0
        };

        let frame = &mut self.keys[i];
        frame.in_tangent = tangent;
        frame.out_tangent = tangent;
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        let (Some(first), Some(last)) = (self.keys.first(), self.keys.last()) else {
            return 0.0;
        };

        if t <= self.min_time {
            return first.value;
        }
        if t >= self.max_time {
            return last.value;
        }

        let hi = self.keys.partition_point(|k| k.time <= t);
        let lo = &self.keys[hi - 1];
        if lo.time == t {
            return lo.value;
        }
        let hi = &self.keys[hi];

        interpolant(
            lo.time,
            lo.value,
            lo.out_tangent,
            hi.time,
            hi.value,
            hi.in_tangent,
            t,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn interpolant(x1: f64, y1: f64, yp1: f64, x2: f64, y2: f64, yp2: f64, x: f64) -> f64 {
    let t = (x - x1) / (x2 - x1);
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * y1 + h10 * (x2 - x1) * yp1 + h01 * y2 + h11 * (x2 - x1) * yp2
}

impl From<Vec<KeySpec>> for FloatCurve {
    fn from(keys: Vec<KeySpec>) -> Self {
        keys.into_iter().collect()
    }
}

impl From<FloatCurve> for Vec<KeySpec> {
    fn from(curve: FloatCurve) -> Self {
        curve
            .keys
            .iter()
            .map(|k| {
                if k.auto_tangent {
                    KeySpec::Auto(k.time, k.value)
                } else {
                    KeySpec::Tangents(k.time, k.value, k.in_tangent, k.out_tangent)
                }
            })
            .collect()
    }
}

impl FromIterator<KeySpec> for FloatCurve {
    fn from_iter<T: IntoIterator<Item = KeySpec>>(iter: T) -> Self {
        let mut curve = Self::new();
        for key in iter {
            match key {
                KeySpec::Auto(time, value) => curve.add(time, value),
                KeySpec::Tangents(time, value, in_tangent, out_tangent) => {
                    curve.add_with_tangents(time, value, in_tangent, out_tangent);
                }
            }
        }
        curve
    }
}

impl FromIterator<(f64, f64)> for FloatCurve {
    fn from_iter<T: IntoIterator<Item = (f64, f64)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(time, value)| KeySpec::Auto(time, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_curve_is_zero() {
        assert_eq!(FloatCurve::new().evaluate(0.5), 0.0);
    }

    #[test]
    fn clamps_outside_key_range() {
        let curve: FloatCurve = [(0.0, 320.0), (1.0, 250.0)].into_iter().collect();
        assert_eq!(curve.evaluate(-1.0), 320.0);
        assert_eq!(curve.evaluate(3.0), 250.0);
        assert_eq!(curve.evaluate(1.0), 250.0);
    }

    #[test]
    fn two_auto_keys_interpolate_linearly() {
        let curve: FloatCurve = [(0.0, 320.0), (1.0, 250.0)].into_iter().collect();
        assert!((curve.evaluate(0.5) - 285.0).abs() < 1e-9);
    }

    #[test]
    fn explicit_tangents_shape_the_curve() {
        // Stock terrier-style isp curve.
        let mut curve = FloatCurve::new();
        curve.add_with_tangents(0.0, 345.0, 0.0, 0.0);
        curve.add_with_tangents(1.0, 85.0, 0.0, 0.0);
        let mid = curve.evaluate(0.5);
        assert!((mid - 215.0).abs() < 1e-9);
        // Flat tangents keep the curve near the key close to the key.
        assert!(curve.evaluate(0.05) > 340.0);
    }

    #[test]
    fn steps_stay_finite() {
        let curve: FloatCurve = [(0.0, 300.0), (1.0, 250.0), (1.0, 200.0), (2.0, 100.0)]
            .into_iter()
            .collect();
        for t in [0.25, 0.5, 0.75, 1.25, 1.5, 1.75] {
            let value = curve.evaluate(t);
            assert!(value.is_finite(), "{t}: {value}");
            assert!((100.0..=300.0).contains(&value), "{t}: {value}");
        }
        assert!((curve.evaluate(0.5) - 271.875).abs() < 1e-9);
        assert!((curve.evaluate(1.5) - 156.25).abs() < 1e-9);
        // The later key at a shared time wins.
        assert_eq!(curve.evaluate(1.0), 200.0);
    }

    #[test]
    fn keys_are_kept_sorted() {
        let curve: FloatCurve = [(2.0, 0.0), (0.0, 1.0), (1.0, 0.5)].into_iter().collect();
        assert_eq!(curve.min_time(), 0.0);
        assert_eq!(curve.max_time(), 2.0);
        assert!((curve.evaluate(1.0) - 0.5).abs() < 1e-12);
    }
}
