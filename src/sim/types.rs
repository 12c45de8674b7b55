//! Core simulation types: timing configuration, world state, step records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, FixedOffset};

use super::event::Event;
use crate::devices::{ChargingStation, GridConnector, Photovoltaics, StationaryBattery, Vehicle};
use crate::util::CoreStandingTime;

/// Timing parameters of one simulation run.
///
/// All step arithmetic is integer steps against `start_time`; datetimes only
/// appear at the I/O boundary and in window checks.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub start_time: DateTime<FixedOffset>,
    /// Length of one interval in minutes.
    pub interval_min: i64,
    pub n_intervals: usize,
    pub core_standing_time: Option<CoreStandingTime>,
}

impl SimConfig {
    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_min)
    }

    /// Interval length in hours.
    pub fn dt_hours(&self) -> f64 {
        self.interval_min as f64 / 60.0
    }

    /// Number of timesteps per hour.
    pub fn ts_per_hour(&self) -> f64 {
        60.0 / self.interval_min as f64
    }

    /// Wall-clock time at the given step (step 0 = first simulated interval).
    pub fn time_at(&self, step: usize) -> DateTime<FixedOffset> {
        self.start_time + Duration::minutes(self.interval_min * step as i64)
    }

    pub fn stop_time(&self) -> DateTime<FixedOffset> {
        self.time_at(self.n_intervals)
    }
}

/// Per-step view handed to strategies.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step: usize,
    pub current_time: DateTime<FixedOffset>,
    pub interval_min: i64,
    pub dt_hours: f64,
    pub ts_per_hour: f64,
    pub stop_time: DateTime<FixedOffset>,
}

impl StepContext {
    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_min)
    }
}

/// Complete mutable state of the simulated site(s).
///
/// String-keyed maps give deterministic lexicographic iteration order, which
/// the reproducibility guarantee relies on. Back-references between
/// components are name strings, never owning pointers.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub vehicles: BTreeMap<String, Vehicle>,
    pub charging_stations: BTreeMap<String, ChargingStation>,
    pub grid_connectors: BTreeMap<String, GridConnector>,
    pub batteries: BTreeMap<String, StationaryBattery>,
    pub photovoltaics: BTreeMap<String, Photovoltaics>,
    /// Load names that carry local generation (for report bookkeeping).
    pub generation_names: BTreeSet<String>,
    /// Signaled events not yet applied, ordered by `(start_time, seq)`.
    /// Strategies read these as their look-ahead horizon.
    pub future_events: Vec<Event>,
}

impl World {
    /// Ids of vehicles connected to a station below the given grid connector,
    /// in lexicographic order.
    pub fn vehicles_at_gc(&self, gc_id: &str) -> Vec<String> {
        self.vehicles
            .iter()
            .filter(|(_, v)| {
                v.connected_charging_station
                    .as_deref()
                    .and_then(|cs_id| self.charging_stations.get(cs_id))
                    .is_some_and(|cs| cs.parent == gc_id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Recorded state of one grid connector after one step.
#[derive(Debug, Clone, PartialEq)]
pub struct GcRecord {
    /// Net power drawn from the grid (kW), feed-in clamped at the cap.
    pub grid_power: f64,
    /// Sum of fixed loads (kW), without stations and batteries.
    pub fixed_load: f64,
    /// Local generation (kW, positive).
    pub generation: f64,
    /// Feed-in surplus beyond all local consumption (kW, positive).
    pub surplus: f64,
    /// Price of one kWh under the active tariff (0 without tariff).
    pub price: f64,
    /// Energy cost of this interval in the tariff's currency.
    pub energy_cost: f64,
    pub target: Option<f64>,
    pub window: Option<bool>,
    /// Vehicles connected to a station below this connector.
    pub connected_vehicles: usize,
    /// False when the cap was violated after allocation.
    pub within_limit: bool,
}

/// One row of the output time series.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub time: DateTime<FixedOffset>,
    pub gc: BTreeMap<String, GcRecord>,
    /// Power per charging station (kW).
    pub cs_power: BTreeMap<String, f64>,
    /// Sum of all charging station powers (kW).
    pub cs_sum: f64,
    /// SoC per vehicle.
    pub vehicle_soc: BTreeMap<String, f64>,
    /// SoC per stationary battery.
    pub battery_soc: BTreeMap<String, f64>,
}

/// What to do when a vehicle's SoC falls below zero on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeSocPolicy {
    /// Abort the run (default).
    #[default]
    Abort,
    /// Warn and keep the negative SoC.
    Allow,
    /// Warn and clamp the SoC to zero.
    Reset,
}
