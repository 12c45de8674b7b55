//! Post-hoc summary computation from simulation records.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;

use super::engine::SimResult;
use super::types::StepRecord;

/// Feed-in remuneration tiers for PV plants: nominal power cap (kWp) and the
/// rate per kWh fed into the grid, in the tariff's currency. The rate of the
/// smallest tier whose cap covers the plant applies.
const PV_FEED_IN_TIERS: &[(f64, f64)] = &[(10.0, 0.082), (40.0, 0.071), (100.0, 0.058)];

/// Remuneration rate for a PV plant of the given total nominal power.
fn pv_feed_in_rate(nominal_power: f64) -> f64 {
    if nominal_power <= 0.0 {
        return 0.0;
    }
    for &(cap, rate) in PV_FEED_IN_TIERS {
        if nominal_power <= cap {
            return rate;
        }
    }
    let &(cap, rate) = &PV_FEED_IN_TIERS[PV_FEED_IN_TIERS.len() - 1];
    warn!("nominal PV power {nominal_power} kWp beyond the remuneration table (max {cap} kWp)");
    rate
}

/// Per-connector aggregates over a complete run.
#[derive(Debug, Clone, PartialEq)]
pub struct GcSummary {
    /// Energy drawn from the grid (kWh).
    pub drawn_energy_kwh: f64,
    /// Energy fed back into the grid (kWh, positive).
    pub fed_in_energy_kwh: f64,
    /// Highest net load (kW).
    pub peak_load_kw: f64,
    /// Highest net load inside charging windows (kW), if windows were seen.
    pub peak_in_window_kw: Option<f64>,
    /// Highest net load outside charging windows (kW), if windows were seen.
    pub peak_out_window_kw: Option<f64>,
    /// Share of the fleet's vehicle-intervals spent connected here.
    pub standing_share: f64,
    /// Of the connected intervals, the share inside charging windows, if
    /// windows were seen.
    pub standing_in_window_share: Option<f64>,
    /// Cost of the drawn energy in the tariff's currency.
    pub energy_cost: f64,
    /// Earnings for fed-in energy, from the PV remuneration tiers.
    pub feed_in_remuneration: f64,
    /// Net cost: energy cost minus feed-in remuneration.
    pub total_cost: f64,
    /// Steps in which the cap was violated.
    pub overloaded_steps: usize,
}

/// Aggregate summary derived from a complete run.
///
/// Computed post-hoc from the step records so the reported numbers always
/// match the exported time series.
#[derive(Debug, Clone)]
pub struct SummaryReport {
    pub n_steps: usize,
    pub gc: BTreeMap<String, GcSummary>,
    /// Equivalent full cycles per stationary battery (accumulated SoC swing
    /// over two).
    pub battery_cycles: BTreeMap<String, f64>,
    pub desired_misses: usize,
    pub margin_misses: usize,
    /// Vehicles that arrived with a negative SoC, with the times.
    pub negative_soc_events: BTreeMap<String, Vec<String>>,
    /// Fatal condition that ended the run early, if any.
    pub aborted: Option<String>,
}

impl SummaryReport {
    /// Builds the summary from a finished run. `dt_hours` is the interval
    /// length; `pv_nominal` maps grid connector ids to the total nominal
    /// power of their PV plants (kWp), used for the feed-in remuneration.
    pub fn from_result(
        result: &SimResult,
        dt_hours: f64,
        pv_nominal: &BTreeMap<String, f64>,
    ) -> Self {
        let fleet_size = result.records.first().map_or(0, |r| r.vehicle_soc.len());
        let mut gc: BTreeMap<String, GcSummary> = BTreeMap::new();
        // per connector: connected intervals, thereof inside windows
        let mut standing: BTreeMap<String, (usize, usize)> = BTreeMap::new();

        for record in &result.records {
            for (gc_id, r) in &record.gc {
                let entry = gc.entry(gc_id.clone()).or_insert(GcSummary {
                    drawn_energy_kwh: 0.0,
                    fed_in_energy_kwh: 0.0,
                    peak_load_kw: 0.0,
                    peak_in_window_kw: None,
                    peak_out_window_kw: None,
                    standing_share: 0.0,
                    standing_in_window_share: None,
                    energy_cost: 0.0,
                    feed_in_remuneration: 0.0,
                    total_cost: 0.0,
                    overloaded_steps: 0,
                });
                entry.drawn_energy_kwh += r.grid_power.max(0.0) * dt_hours;
                entry.fed_in_energy_kwh += (-r.grid_power).max(0.0) * dt_hours;
                entry.peak_load_kw = entry.peak_load_kw.max(r.grid_power);
                match r.window {
                    Some(true) => {
                        let peak = entry.peak_in_window_kw.get_or_insert(0.0);
                        *peak = peak.max(r.grid_power);
                    }
                    Some(false) => {
                        let peak = entry.peak_out_window_kw.get_or_insert(0.0);
                        *peak = peak.max(r.grid_power);
                    }
                    None => {}
                }
                entry.energy_cost += r.energy_cost;
                if !r.within_limit {
                    entry.overloaded_steps += 1;
                }

                let counts = standing.entry(gc_id.clone()).or_insert((0, 0));
                counts.0 += r.connected_vehicles;
                if r.window == Some(true) {
                    counts.1 += r.connected_vehicles;
                }
            }
        }

        for (gc_id, summary) in &mut gc {
            let (connected, in_window) = standing.get(gc_id).copied().unwrap_or((0, 0));
            let vehicle_intervals = result.records.len() * fleet_size;
            summary.standing_share = if vehicle_intervals > 0 {
                connected as f64 / vehicle_intervals as f64
            } else {
                0.0
            };
            let saw_windows =
                summary.peak_in_window_kw.is_some() || summary.peak_out_window_kw.is_some();
            if saw_windows && connected > 0 {
                summary.standing_in_window_share = Some(in_window as f64 / connected as f64);
            }

            let nominal = pv_nominal.get(gc_id).copied().unwrap_or(0.0);
            if nominal <= 0.0 && summary.fed_in_energy_kwh > 0.0 {
                warn!(
                    "{gc_id} fed energy into the grid without a PV plant, \
                     no remuneration applied"
                );
            }
            summary.feed_in_remuneration = summary.fed_in_energy_kwh * pv_feed_in_rate(nominal);
            summary.total_cost = summary.energy_cost - summary.feed_in_remuneration;
        }

        // one equivalent full cycle is a whole SoC swing down and back up
        let battery_cycles = battery_soc_swings(&result.records)
            .into_iter()
            .map(|(id, swing)| (id, swing / 2.0))
            .collect();

        Self {
            n_steps: result.records.len(),
            gc,
            battery_cycles,
            desired_misses: result.desired_misses,
            margin_misses: result.margin_misses,
            negative_soc_events: result.negative_soc_events.clone(),
            aborted: result.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Accumulated absolute SoC movement per stationary battery, reconstructed
/// from the recorded trajectory.
fn battery_soc_swings(records: &[StepRecord]) -> BTreeMap<String, f64> {
    let mut swings: BTreeMap<String, (f64, Option<f64>)> = BTreeMap::new();
    for record in records {
        for (b_id, &soc) in &record.battery_soc {
            let entry = swings.entry(b_id.clone()).or_insert((0.0, None));
            if let Some(prev) = entry.1 {
                entry.0 += (soc - prev).abs();
            }
            entry.1 = Some(soc);
        }
    }
    swings.into_iter().map(|(id, (swing, _))| (id, swing)).collect()
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Simulation Summary ---")?;
        writeln!(f, "Steps simulated:       {}", self.n_steps)?;
        for (gc_id, s) in &self.gc {
            writeln!(f, "[{gc_id}]")?;
            writeln!(f, "  Energy drawn:        {:.3} kWh", s.drawn_energy_kwh)?;
            writeln!(f, "  Energy fed in:       {:.3} kWh", s.fed_in_energy_kwh)?;
            writeln!(f, "  Peak load:           {:.2} kW", s.peak_load_kw)?;
            if let Some(peak) = s.peak_in_window_kw {
                writeln!(f, "  Peak inside windows: {peak:.2} kW")?;
            }
            if let Some(peak) = s.peak_out_window_kw {
                writeln!(f, "  Peak outside windows:{peak:.2} kW")?;
            }
            match s.standing_in_window_share {
                Some(share) => writeln!(
                    f,
                    "  Standing time share: {:.1}% ({:.1}% inside windows)",
                    s.standing_share * 100.0,
                    share * 100.0
                )?,
                None => writeln!(
                    f,
                    "  Standing time share: {:.1}%",
                    s.standing_share * 100.0
                )?,
            }
            writeln!(f, "  Energy cost:         {:.2}", s.energy_cost)?;
            if s.feed_in_remuneration > 0.0 {
                writeln!(f, "  Feed-in remuneration:{:.2}", s.feed_in_remuneration)?;
            }
            writeln!(f, "  Net cost:            {:.2}", s.total_cost)?;
            if s.overloaded_steps > 0 {
                writeln!(f, "  Overloaded steps:    {}", s.overloaded_steps)?;
            }
        }
        for (b_id, cycles) in &self.battery_cycles {
            writeln!(f, "Battery {b_id}:         {cycles:.2} equiv. cycles")?;
        }
        writeln!(
            f,
            "Desired SoC missed:    {} times ({} beyond margin)",
            self.desired_misses, self.margin_misses
        )?;
        if !self.negative_soc_events.is_empty() {
            writeln!(
                f,
                "Negative SoC arrivals: {}",
                self.negative_soc_events.len()
            )?;
        }
        match &self.aborted {
            Some(reason) => write!(f, "*** ABORTED: {reason} ***"),
            None => write!(f, "Completed without fatal errors"),
        }
    }
}
