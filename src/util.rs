//! Tariff evaluation and time-window helpers shared across strategies.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Tolerance for floating point comparison throughout the simulator.
pub const EPS: f64 = 1e-5;

/// Iteration ceiling for the binary searches in strategies.
pub const ITERATIONS: usize = 12;

/// Energy tariff attached to a grid connector.
///
/// A fixed tariff is a flat price per kWh. A polynomial tariff is evaluated
/// on the current grid connector load, term 0 being the constant part.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Cost {
    Fixed { value: f64 },
    Polynomial { value: Vec<f64> },
}

impl Cost {
    /// Evaluates the tariff for the quantity `x` (kWh for energy cost, 1 for
    /// the unit price). Polynomials are evaluated by Horner's rule.
    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            Cost::Fixed { value } => value * x,
            Cost::Polynomial { value } => {
                value.iter().rev().fold(0.0, |acc, coeff| acc * x + coeff)
            }
        }
    }

    /// Price of one kWh at the current operating point.
    pub fn unit_price(&self) -> f64 {
        self.evaluate(1.0)
    }
}

/// Recurring window during which the whole fleet is guaranteed to be present.
///
/// `full_days` uses Monday = 0 after normalization at scenario load.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreStandingTime {
    pub times: Vec<(NaiveTime, NaiveTime)>,
    pub full_days: Vec<u32>,
}

/// Checks whether `dt` falls inside the core standing time.
///
/// `None` means no restriction: every time counts as standing time.
/// Windows crossing midnight (`end < start`) are handled.
pub fn within_core_standing_time(
    dt: DateTime<FixedOffset>,
    cst: Option<&CoreStandingTime>,
) -> bool {
    let Some(cst) = cst else {
        return true;
    };
    let weekday = dt.weekday().num_days_from_monday();
    if cst.full_days.contains(&weekday) {
        return true;
    }
    let now = dt.time();
    for &(start, end) in &cst.times {
        if end < start {
            // crossing midnight
            if now >= start || now < end {
                return true;
            }
        } else if now >= start && now <= end {
            return true;
        }
    }
    false
}

/// One season of a grid operator's peak load window table.
#[derive(Debug, Clone, Deserialize)]
pub struct Season {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Daily windows per voltage level, `[start, end)` times.
    #[serde(default)]
    pub windows: BTreeMap<String, Vec<(NaiveTime, NaiveTime)>>,
}

/// Peak load windows of one grid operator, by season name.
pub type OperatorWindows = BTreeMap<String, Season>;

/// Peak load window table: grid operator -> season -> windows.
pub type TimeWindows = BTreeMap<String, OperatorWindows>;

/// Checks whether `dt` lies inside a peak load window of the given voltage
/// level. Returns `None` when the operator table or voltage level is absent.
pub fn within_time_window(
    dt: DateTime<FixedOffset>,
    windows: Option<&OperatorWindows>,
    voltage_level: Option<&str>,
) -> Option<bool> {
    let windows = windows?;
    let voltage_level = voltage_level?;
    let date = dt.date_naive();
    for season in windows.values() {
        if season.start <= date && date <= season.end {
            let daily = match season.windows.get(voltage_level) {
                Some(w) => w,
                None => return Some(false),
            };
            let now = dt.time();
            for &(start, end) in daily {
                if end < start {
                    // crossing midnight
                    if now >= start || now < end {
                        return Some(true);
                    }
                } else if now >= start && now < end {
                    return Some(true);
                }
            }
            // matching season without a matching window
            return Some(false);
        }
    }
    Some(false)
}

/// Timeslot of `dt` within its day at the given interval length.
pub fn timeslot_of_day(dt: DateTime<FixedOffset>, interval_min: i64) -> usize {
    let minutes = i64::from(dt.hour()) * 60 + i64::from(dt.minute());
    (minutes / interval_min) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn fixed_cost_scales_linearly() {
        let c = Cost::Fixed { value: 0.25 };
        assert_eq!(c.evaluate(0.0), 0.0);
        assert_eq!(c.evaluate(4.0), 1.0);
        assert_eq!(c.unit_price(), 0.25);
    }

    #[test]
    fn polynomial_cost_horner() {
        // 1 + 2x + 3x^2 at x = 2 -> 17
        let c = Cost::Polynomial {
            value: vec![1.0, 2.0, 3.0],
        };
        assert!((c.evaluate(2.0) - 17.0).abs() < 1e-12);
        assert!((c.unit_price() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn polynomial_constant_only() {
        let c = Cost::Polynomial { value: vec![5.0] };
        assert_eq!(c.evaluate(100.0), 5.0);
    }

    #[test]
    fn cost_deserializes_both_forms() {
        let f: Cost = serde_json::from_str(r#"{"type": "fixed", "value": 0.3}"#).unwrap();
        assert_eq!(f, Cost::Fixed { value: 0.3 });
        let p: Cost =
            serde_json::from_str(r#"{"type": "polynomial", "value": [1.0, 0.1]}"#).unwrap();
        assert_eq!(
            p,
            Cost::Polynomial {
                value: vec![1.0, 0.1]
            }
        );
    }

    #[test]
    fn core_standing_time_none_is_always_inside() {
        assert!(within_core_standing_time(dt("2020-01-01T12:00:00+01:00"), None));
    }

    #[test]
    fn core_standing_time_overnight_window() {
        let cst = CoreStandingTime {
            times: vec![(
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
            )],
            full_days: vec![],
        };
        assert!(within_core_standing_time(
            dt("2020-01-01T23:30:00+01:00"),
            Some(&cst)
        ));
        assert!(within_core_standing_time(
            dt("2020-01-01T03:00:00+01:00"),
            Some(&cst)
        ));
        assert!(!within_core_standing_time(
            dt("2020-01-01T12:00:00+01:00"),
            Some(&cst)
        ));
    }

    #[test]
    fn core_standing_time_full_day() {
        let cst = CoreStandingTime {
            times: vec![],
            full_days: vec![5, 6], // Saturday, Sunday
        };
        // 2020-01-04 is a Saturday
        assert!(within_core_standing_time(
            dt("2020-01-04T12:00:00+01:00"),
            Some(&cst)
        ));
        assert!(!within_core_standing_time(
            dt("2020-01-06T12:00:00+01:00"),
            Some(&cst)
        ));
    }

    #[test]
    fn time_window_lookup() {
        let mut windows = BTreeMap::new();
        windows.insert(
            "MV".to_string(),
            vec![(
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            )],
        );
        let mut seasons = OperatorWindows::new();
        seasons.insert(
            "winter".to_string(),
            Season {
                start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2020, 3, 31).unwrap(),
                windows,
            },
        );
        let inside = dt("2020-02-01T10:00:00+01:00");
        let outside = dt("2020-02-01T22:00:00+01:00");
        assert_eq!(within_time_window(inside, Some(&seasons), Some("MV")), Some(true));
        assert_eq!(
            within_time_window(outside, Some(&seasons), Some("MV")),
            Some(false)
        );
        // unknown voltage level inside season
        assert_eq!(
            within_time_window(inside, Some(&seasons), Some("HV")),
            Some(false)
        );
        // no table at all
        assert_eq!(within_time_window(inside, None, Some("MV")), None);
    }

    #[test]
    fn timeslot_index() {
        let t = chrono::FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2020, 1, 1, 6, 30, 0)
            .unwrap();
        assert_eq!(timeslot_of_day(t, 15), 26);
        assert_eq!(timeslot_of_day(t, 60), 6);
    }
}
