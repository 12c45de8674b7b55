//! Grid connector: the shared meter and hard power cap of a site.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset};

use crate::util::{timeslot_of_day, Cost};

/// Grid connection point aggregating named load contributions.
///
/// `current_loads` maps a contributor name (fixed load series, charging
/// station, stationary battery, generation series) to its signed power in kW.
/// Generation enters as negative load.
#[derive(Debug, Clone)]
pub struct GridConnector {
    /// Nominal power cap (kW). May be infinite.
    pub max_power: f64,
    /// Cap currently in effect; grid operator signals may lower it.
    pub cur_max_power: f64,
    pub grid_operator: String,
    pub voltage_level: Option<String>,
    /// Number of physical charging points (used by the distributed strategy).
    pub number_cs: Option<usize>,
    pub current_loads: BTreeMap<String, f64>,
    /// Energy tariff in effect.
    pub cost: Option<Cost>,
    /// Grid operator schedule target (kW).
    pub target: Option<f64>,
    /// Charging window flag currently in effect.
    pub window: Option<bool>,
    /// Average fixed load per weekday and timeslot, from the input series.
    avg_fixed_load: Option<Vec<Vec<f64>>>,
}

impl GridConnector {
    pub fn new(max_power: f64) -> Self {
        Self {
            max_power,
            cur_max_power: max_power,
            grid_operator: "default_grid_operator".to_string(),
            voltage_level: None,
            number_cs: None,
            current_loads: BTreeMap::new(),
            cost: None,
            target: None,
            window: None,
            avg_fixed_load: None,
        }
    }

    /// Adds `value` kW under `name`, accumulating with any existing
    /// contribution. Returns the updated total for that name.
    pub fn add_load(&mut self, name: &str, value: f64) -> f64 {
        let entry = self.current_loads.entry(name.to_string()).or_insert(0.0);
        *entry += value;
        *entry
    }

    /// Sum of all current load contributions (kW).
    pub fn current_load(&self) -> f64 {
        self.current_loads.values().sum()
    }

    /// Sum of current loads whose name is not in `exclude`.
    pub fn current_load_excluding(&self, exclude: &[&str]) -> f64 {
        self.current_loads
            .iter()
            .filter(|(name, _)| !exclude.contains(&name.as_str()))
            .map(|(_, v)| v)
            .sum()
    }

    /// Power still available below the active cap (kW; negative when over).
    pub fn headroom(&self) -> f64 {
        self.cur_max_power - self.current_load()
    }

    /// Price of one kWh under the current tariff, infinite without one.
    pub fn unit_price(&self) -> f64 {
        self.cost.as_ref().map_or(f64::INFINITY, Cost::unit_price)
    }

    /// Records weekday/timeslot averages of a fixed load series, adding onto
    /// any previously recorded series.
    ///
    /// `values[i]` applies from `start + i * step`; each simulation timeslot
    /// takes the most recent series value, mirroring how the stepper applies
    /// fixed load events.
    pub fn add_avg_fixed_load_week(
        &mut self,
        start_time: DateTime<FixedOffset>,
        step_duration_s: f64,
        values: &[f64],
        interval_min: i64,
    ) {
        if values.is_empty() {
            return;
        }
        let slots_per_day = (24 * 60 / interval_min) as usize;
        let mut sums = vec![vec![(0.0, 0usize); slots_per_day]; 7];

        let series_end =
            start_time + chrono::Duration::seconds((step_duration_s * values.len() as f64) as i64);
        let mut cur_time = start_time;
        while cur_time < series_end {
            let elapsed_s = (cur_time - start_time).num_seconds() as f64;
            let idx = ((elapsed_s / step_duration_s) as usize).min(values.len() - 1);
            let weekday = cur_time.weekday().num_days_from_monday() as usize;
            let slot = timeslot_of_day(cur_time, interval_min).min(slots_per_day - 1);
            sums[weekday][slot].0 += values[idx];
            sums[weekday][slot].1 += 1;
            cur_time += chrono::Duration::minutes(interval_min);
        }

        let averages: Vec<Vec<f64>> = sums
            .into_iter()
            .map(|day| {
                day.into_iter()
                    .map(|(sum, n)| if n > 0 { sum / n as f64 } else { 0.0 })
                    .collect()
            })
            .collect();

        match &mut self.avg_fixed_load {
            None => self.avg_fixed_load = Some(averages),
            Some(existing) => {
                for (day, new_day) in existing.iter_mut().zip(averages) {
                    for (slot, new_value) in day.iter_mut().zip(new_day) {
                        *slot += new_value;
                    }
                }
            }
        }
    }

    /// Average fixed load expected at `dt` (kW), 0 without recorded series.
    pub fn avg_fixed_load_at(&self, dt: DateTime<FixedOffset>, interval_min: i64) -> f64 {
        let Some(avg) = &self.avg_fixed_load else {
            return 0.0;
        };
        let weekday = dt.weekday().num_days_from_monday() as usize;
        let slot = timeslot_of_day(dt, interval_min);
        avg[weekday].get(slot).copied().unwrap_or(0.0)
    }
}
