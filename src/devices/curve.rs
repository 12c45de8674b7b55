//! SoC-dependent charging power curve.

use serde::Deserialize;

use crate::error::SimError;

/// Piecewise-linear bound on charging power as a function of state of charge.
///
/// Breakpoints are `(soc, power)` pairs with strictly increasing SoC covering
/// the whole `[0, 1]` range. Power between breakpoints is linearly
/// interpolated; outside `[0, 1]` the nearest endpoint value applies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>")]
pub struct ChargingCurve {
    points: Vec<(f64, f64)>,
    /// Highest power value of any breakpoint.
    pub max_power: f64,
}

impl TryFrom<Vec<[f64; 2]>> for ChargingCurve {
    type Error = SimError;

    fn try_from(points: Vec<[f64; 2]>) -> Result<Self, SimError> {
        ChargingCurve::new(points.into_iter().map(|[s, p]| (s, p)).collect())
    }
}

impl ChargingCurve {
    /// Builds a curve from `(soc, power)` breakpoints.
    ///
    /// # Errors
    ///
    /// Fails when fewer than two points are given, SoC values are not
    /// strictly increasing from 0 to 1, or any power is negative.
    pub fn new(mut points: Vec<(f64, f64)>) -> Result<Self, SimError> {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.len() < 2 {
            return Err(SimError::InvalidScenario(
                "charging curve needs at least two points".into(),
            ));
        }
        if points[0].0 != 0.0 || points[points.len() - 1].0 != 1.0 {
            return Err(SimError::InvalidScenario(
                "charging curve must cover SoC 0 to 1".into(),
            ));
        }
        let mut max_power: f64 = 0.0;
        for (i, &(soc, power)) in points.iter().enumerate() {
            if power < 0.0 {
                return Err(SimError::InvalidScenario(format!(
                    "charging curve power must not be negative (got {power} at SoC {soc})"
                )));
            }
            if i > 0 && soc <= points[i - 1].0 {
                return Err(SimError::InvalidScenario(
                    "charging curve SoC values must be strictly increasing".into(),
                ));
            }
            max_power = max_power.max(power);
        }
        Ok(Self { points, max_power })
    }

    /// Constant curve: the same power limit over the whole SoC range.
    pub fn flat(power: f64) -> Self {
        Self {
            points: vec![(0.0, power), (1.0, power)],
            max_power: power,
        }
    }

    /// Breakpoints of the curve.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Maximum power at the given SoC by linear interpolation.
    pub fn power_at(&self, soc: f64) -> f64 {
        if soc <= self.points[0].0 {
            return self.points[0].1;
        }
        for i in 1..self.points.len() {
            let (soc_b, pow_b) = self.points[i];
            if soc_b >= soc {
                let (soc_a, pow_a) = self.points[i - 1];
                let t = (soc - soc_a) / (soc_b - soc_a);
                return pow_a + (pow_b - pow_a) * t;
            }
        }
        self.points[self.points.len() - 1].1
    }

    /// Indices of the segment enclosing `soc`: the last point at or below and
    /// the first point above. At `soc = 1` the final segment is returned.
    pub fn section_boundary(&self, soc: f64) -> (usize, usize) {
        let mut idx = 0;
        while idx + 2 < self.points.len() && self.points[idx + 1].0 <= soc {
            idx += 1;
        }
        (idx, idx + 1)
    }

    /// New curve with every power capped at `limit`. Intersections of the
    /// original segments with the cap become additional breakpoints, so the
    /// clamped curve is exact, not sampled.
    pub fn clamped(&self, limit: f64) -> ChargingCurve {
        let limit = limit.max(0.0);
        let mut new_points: Vec<(f64, f64)> = Vec::with_capacity(self.points.len() + 2);
        for i in 0..self.points.len() {
            let (soc_a, pow_a) = self.points[i];
            if i + 1 == self.points.len() {
                new_points.push((soc_a, pow_a.min(limit)));
                break;
            }
            let (soc_b, pow_b) = self.points[i + 1];
            new_points.push((soc_a, pow_a.min(limit)));
            // crossing the cap inside a segment adds the intersection
            if (pow_a < limit && pow_b > limit) || (pow_a > limit && pow_b < limit) {
                let t = (limit - pow_a) / (pow_b - pow_a);
                let soc = soc_a + (soc_b - soc_a) * t;
                if soc > soc_a && soc < soc_b {
                    new_points.push((soc, limit));
                }
            }
        }
        let max_power = new_points.iter().fold(0.0_f64, |m, p| m.max(p.1));
        ChargingCurve {
            points: new_points,
            max_power,
        }
    }

    /// New curve with every power multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> ChargingCurve {
        ChargingCurve {
            points: self.points.iter().map(|&(s, p)| (s, p * factor)).collect(),
            max_power: self.max_power * factor,
        }
    }

    /// Hours needed to charge a battery of `capacity` kWh from `soc_from` to
    /// `soc_to` under this curve, with `efficiency` applied to the power that
    /// reaches the cells. Solved in closed form per linear segment: constant
    /// sections move the SoC linearly, sloped sections follow the
    /// exponential solution of `d soc/dt = (m soc + n) / capacity`.
    /// Returns infinity when a zero-power section blocks the way.
    pub fn time_to_reach(&self, soc_from: f64, soc_to: f64, capacity: f64, efficiency: f64) -> f64 {
        if soc_to <= soc_from {
            return 0.0;
        }
        let mut soc = soc_from.max(0.0);
        let mut hours = 0.0;
        while soc_to - soc > f64::EPSILON {
            let (idx_1, idx_2) = self.section_boundary(soc);
            let x1 = self.points[idx_1].0;
            let x2 = self.points[idx_2].0.min(soc_to);
            let y1 = self.power_at(x1) * efficiency;
            let y2 = self.power_at(x2) * efficiency;
            let m = (y2 - y1) / (x2 - x1);
            let n = y1 - m * x1;
            if m.abs() < 1e-12 && n.abs() < 1e-12 {
                return f64::INFINITY;
            }
            let t = if m.abs() < 1e-12 {
                (x2 - soc) * capacity / n
            } else {
                let ratio = (x2 + n / m) / (soc + n / m);
                if ratio > 0.0 {
                    ratio.ln() * capacity / m
                } else {
                    return f64::INFINITY;
                }
            };
            if !t.is_finite() || t < 0.0 {
                return f64::INFINITY;
            }
            hours += t;
            soc = x2;
        }
        hours
    }

    /// SoC reached after charging for `hours` under this curve capped at
    /// `power_ceiling`, into a battery of `capacity` kWh with `efficiency`
    /// applied to the stored energy. Closed-form counterpart of
    /// [`ChargingCurve::time_to_reach`].
    pub fn soc_after(
        &self,
        soc_from: f64,
        hours: f64,
        capacity: f64,
        efficiency: f64,
        power_ceiling: f64,
    ) -> f64 {
        self.clamped(power_ceiling)
            .integrate_forward(soc_from, hours, capacity, efficiency)
    }

    /// Forward integration on this curve as-is, stopping at SoC 1.
    pub(crate) fn integrate_forward(
        &self,
        soc_from: f64,
        hours: f64,
        capacity: f64,
        efficiency: f64,
    ) -> f64 {
        let mut soc = soc_from.max(0.0);
        let mut remaining = hours;
        while remaining > 1e-12 && soc < 1.0 {
            let (idx_1, idx_2) = self.section_boundary(soc);
            let x1 = self.points[idx_1].0;
            let x2 = self.points[idx_2].0;
            let y1 = self.power_at(x1) * efficiency;
            let y2 = self.power_at(x2) * efficiency;
            let m = (y2 - y1) / (x2 - x1);
            let n = y1 - m * x1;
            if m.abs() < 1e-12 && n.abs() < 1e-12 {
                // zero-power section, no further progress
                break;
            }
            // time to the section boundary
            let mut t = if m.abs() < 1e-12 {
                (x2 - soc) * capacity / n
            } else {
                let ratio = (x2 + n / m) / (soc + n / m);
                if ratio > 0.0 {
                    ratio.ln() * capacity / m
                } else {
                    remaining
                }
            };
            if !t.is_finite() || t <= 0.0 {
                t = remaining;
            }
            t = t.min(remaining);

            let soc_delta = if m.abs() < 1e-12 {
                n / capacity * t
            } else {
                (soc + n / m) * (m / capacity * t).exp_m1()
            };
            if soc_delta <= 0.0 {
                break;
            }
            soc += soc_delta;
            if x2 - soc < 1e-9 {
                // snap to the section boundary against rounding stalls
                soc = x2;
            }
            remaining -= t;
        }
        soc.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(points: &[(f64, f64)]) -> ChargingCurve {
        ChargingCurve::new(points.to_vec()).unwrap()
    }

    #[test]
    fn rejects_uncovered_range() {
        assert!(ChargingCurve::new(vec![(0.1, 10.0), (1.0, 10.0)]).is_err());
        assert!(ChargingCurve::new(vec![(0.0, 10.0), (0.9, 10.0)]).is_err());
        assert!(ChargingCurve::new(vec![(0.0, 10.0)]).is_err());
    }

    #[test]
    fn rejects_negative_power() {
        assert!(ChargingCurve::new(vec![(0.0, -1.0), (1.0, 10.0)]).is_err());
    }

    #[test]
    fn interpolates_linearly() {
        let c = cc(&[(0.0, 10.0), (0.5, 10.0), (1.0, 2.0)]);
        assert_eq!(c.power_at(0.0), 10.0);
        assert_eq!(c.power_at(0.25), 10.0);
        assert_eq!(c.power_at(0.75), 6.0);
        assert_eq!(c.power_at(1.0), 2.0);
        assert_eq!(c.max_power, 10.0);
    }

    #[test]
    fn endpoint_values_outside_range() {
        let c = cc(&[(0.0, 8.0), (1.0, 4.0)]);
        assert_eq!(c.power_at(-0.5), 8.0);
        assert_eq!(c.power_at(1.5), 4.0);
    }

    #[test]
    fn segment_endpoints_agree_from_both_sides() {
        let c = cc(&[(0.0, 10.0), (0.8, 10.0), (1.0, 2.0)]);
        let below = c.power_at(0.8 - 1e-12);
        let above = c.power_at(0.8 + 1e-12);
        assert!((below - 10.0).abs() < 1e-9);
        assert!((above - 10.0).abs() < 1e-9);
    }

    #[test]
    fn clamp_inserts_intersection() {
        let c = cc(&[(0.0, 10.0), (1.0, 0.0)]);
        let clamped = c.clamped(5.0);
        // cap crossed at soc = 0.5
        assert_eq!(clamped.power_at(0.0), 5.0);
        assert_eq!(clamped.power_at(0.25), 5.0);
        assert!((clamped.power_at(0.5) - 5.0).abs() < 1e-9);
        assert!((clamped.power_at(0.75) - 2.5).abs() < 1e-9);
        assert_eq!(clamped.max_power, 5.0);
    }

    #[test]
    fn clamp_above_curve_is_identity() {
        let c = cc(&[(0.0, 10.0), (0.5, 8.0), (1.0, 2.0)]);
        let clamped = c.clamped(20.0);
        for soc in [0.0, 0.3, 0.5, 0.7, 1.0] {
            assert!((clamped.power_at(soc) - c.power_at(soc)).abs() < 1e-9);
        }
    }

    #[test]
    fn scaled_multiplies_power() {
        let c = cc(&[(0.0, 10.0), (1.0, 4.0)]);
        let half = c.scaled(0.5);
        assert_eq!(half.power_at(0.0), 5.0);
        assert_eq!(half.power_at(1.0), 2.0);
        assert_eq!(half.max_power, 5.0);
    }

    #[test]
    fn section_boundary_lookup() {
        let c = cc(&[(0.0, 10.0), (0.5, 10.0), (1.0, 2.0)]);
        assert_eq!(c.section_boundary(0.0), (0, 1));
        assert_eq!(c.section_boundary(0.3), (0, 1));
        assert_eq!(c.section_boundary(0.5), (1, 2));
        assert_eq!(c.section_boundary(1.0), (1, 2));
    }

    #[test]
    fn time_to_reach_constant_section() {
        // 10 kW into 20 kWh: 0.2 -> 0.7 is 10 kWh, one hour
        let c = cc(&[(0.0, 10.0), (1.0, 10.0)]);
        let t = c.time_to_reach(0.2, 0.7, 20.0, 1.0);
        assert!((t - 1.0).abs() < 1e-9);
        // efficiency stretches the time
        let t = c.time_to_reach(0.2, 0.7, 20.0, 0.5);
        assert!((t - 2.0).abs() < 1e-9);
    }

    #[test]
    fn time_to_reach_is_inverse_of_soc_after() {
        let c = cc(&[(0.0, 22.0), (0.8, 22.0), (1.0, 4.0)]);
        let t = c.time_to_reach(0.3, 0.9, 50.0, 0.95);
        assert!(t.is_finite());
        let soc = c.soc_after(0.3, t, 50.0, 0.95, f64::INFINITY);
        assert!((soc - 0.9).abs() < 1e-6, "soc {soc} after {t} h");
    }

    #[test]
    fn soc_after_respects_power_ceiling() {
        let c = cc(&[(0.0, 22.0), (1.0, 22.0)]);
        let free = c.soc_after(0.0, 1.0, 22.0, 1.0, f64::INFINITY);
        let capped = c.soc_after(0.0, 1.0, 22.0, 1.0, 11.0);
        assert!((free - 1.0).abs() < 1e-9);
        assert!((capped - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_power_section_never_reached() {
        let c = cc(&[(0.0, 10.0), (0.5, 0.0), (1.0, 0.0)]);
        assert!(c.time_to_reach(0.6, 0.9, 10.0, 1.0).is_infinite());
        // forward integration stalls at the dead section
        let soc = c.soc_after(0.4, 100.0, 10.0, 1.0, f64::INFINITY);
        assert!(soc <= 0.5 + 1e-6);
    }

    #[test]
    fn deserializes_from_pairs() {
        let c: ChargingCurve =
            serde_json::from_str("[[0.0, 11.0], [0.8, 11.0], [1.0, 2.0]]").unwrap();
        assert_eq!(c.max_power, 11.0);
        assert_eq!(c.points().len(), 3);
    }
}
