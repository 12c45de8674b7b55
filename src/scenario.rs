//! Scenario document loading: JSON input to world state and event queue.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Timelike};
use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::devices::{
    Battery, ChargingCurve, ChargingStation, GridConnector, Photovoltaics, StationaryBattery,
    Vehicle, VehicleType, UNLIMITED_CAPACITY,
};
use crate::error::SimError;
use crate::io::series::load_csv_column;
use crate::sim::event::{Event, EventKind, EventQueue};
use crate::sim::types::{SimConfig, World};
use crate::util::{CoreStandingTime, Cost};

/// A loaded scenario, ready to build an engine from.
#[derive(Debug)]
pub struct Scenario {
    pub config: SimConfig,
    pub world: World,
    pub events: EventQueue,
}

// ---------------------------------------------------------------------------
// Raw document structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDocument {
    scenario: RawScenario,
    #[serde(default, alias = "constants")]
    components: RawComponents,
    #[serde(default)]
    events: RawEvents,
}

#[derive(Debug, Deserialize)]
struct RawScenario {
    start_time: DateTime<FixedOffset>,
    /// Interval length in minutes.
    interval: i64,
    n_intervals: Option<usize>,
    stop_time: Option<DateTime<FixedOffset>>,
    core_standing_time: Option<RawCoreStandingTime>,
    /// `"monday0"` (Mon=0..Sun=6) or `"iso"` (Mon=1..Sun=7); required when
    /// `core_standing_time.full_days` is non-empty.
    weekday_convention: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCoreStandingTime {
    #[serde(default)]
    times: Vec<RawTimeWindow>,
    #[serde(default, alias = "no_drive_days")]
    full_days: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct RawTimeWindow {
    /// `[hour, minute]`
    start: [u32; 2],
    end: [u32; 2],
}

#[derive(Debug, Default, Deserialize)]
struct RawComponents {
    #[serde(default)]
    vehicle_types: BTreeMap<String, RawVehicleType>,
    #[serde(default)]
    vehicles: BTreeMap<String, RawVehicle>,
    #[serde(default)]
    charging_stations: BTreeMap<String, RawChargingStation>,
    #[serde(default)]
    grid_connectors: BTreeMap<String, RawGridConnector>,
    #[serde(default)]
    batteries: BTreeMap<String, RawBattery>,
    #[serde(default)]
    photovoltaics: BTreeMap<String, RawPhotovoltaics>,
}

#[derive(Debug, Deserialize)]
struct RawVehicleType {
    capacity: f64,
    charging_curve: ChargingCurve,
    #[serde(default)]
    min_charging_power: f64,
    #[serde(default = "default_efficiency")]
    battery_efficiency: f64,
    #[serde(default)]
    v2g: bool,
    #[serde(default = "default_v2g_power_factor")]
    v2g_power_factor: f64,
    #[serde(default = "default_discharge_limit")]
    discharge_limit: f64,
    discharge_curve: Option<ChargingCurve>,
}

fn default_efficiency() -> f64 {
    0.95
}

fn default_v2g_power_factor() -> f64 {
    0.5
}

fn default_discharge_limit() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct RawVehicle {
    vehicle_type: String,
    #[serde(default)]
    soc: f64,
    #[serde(default)]
    desired_soc: f64,
    connected_charging_station: Option<String>,
    estimated_time_of_departure: Option<DateTime<FixedOffset>>,
    schedule: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawChargingStation {
    parent: String,
    max_power: f64,
    #[serde(default)]
    min_power: f64,
}

#[derive(Debug, Deserialize)]
struct RawGridConnector {
    /// Negative or missing means unlimited.
    max_power: Option<f64>,
    voltage_level: Option<String>,
    #[serde(default = "default_grid_operator")]
    grid_operator: String,
    number_cs: Option<usize>,
    cost: Option<Cost>,
    target: Option<f64>,
    window: Option<bool>,
}

fn default_grid_operator() -> String {
    "default_grid_operator".to_string()
}

#[derive(Debug, Deserialize)]
struct RawBattery {
    parent: String,
    /// `-1` denotes an unlimited store.
    capacity: f64,
    charging_curve: ChargingCurve,
    #[serde(default)]
    min_charging_power: f64,
    #[serde(default)]
    soc: f64,
    #[serde(default = "default_efficiency")]
    efficiency: f64,
    discharge_curve: Option<ChargingCurve>,
}

#[derive(Debug, Deserialize)]
struct RawPhotovoltaics {
    parent: String,
    nominal_power: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvents {
    #[serde(default, alias = "external_load")]
    fixed_load: BTreeMap<String, RawSeries>,
    #[serde(default, alias = "energy_feed_in")]
    local_generation: BTreeMap<String, RawSeries>,
    #[serde(default)]
    grid_operator_signals: Vec<RawGridSignal>,
    #[serde(default)]
    vehicle_events: Vec<RawVehicleEvent>,
    energy_price_from_csv: Option<RawCsvBinding>,
    schedule_from_csv: Option<RawScheduleCsv>,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    start_time: DateTime<FixedOffset>,
    step_duration_s: f64,
    grid_connector_id: String,
    #[serde(default)]
    values: Vec<f64>,
    csv_file: Option<String>,
    column: Option<String>,
    #[serde(default = "default_factor")]
    factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RawGridSignal {
    signal_time: DateTime<FixedOffset>,
    start_time: DateTime<FixedOffset>,
    grid_connector_id: String,
    max_power: Option<f64>,
    cost: Option<Cost>,
    target: Option<f64>,
    window: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawVehicleEvent {
    signal_time: DateTime<FixedOffset>,
    start_time: DateTime<FixedOffset>,
    vehicle_id: String,
    event_type: String,
    #[serde(default)]
    update: RawVehicleUpdate,
}

#[derive(Debug, Default, Deserialize)]
struct RawVehicleUpdate {
    soc_delta: Option<f64>,
    connected_charging_station: Option<String>,
    estimated_time_of_departure: Option<DateTime<FixedOffset>>,
    estimated_time_of_arrival: Option<DateTime<FixedOffset>>,
    desired_soc: Option<f64>,
    schedule: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCsvBinding {
    start_time: DateTime<FixedOffset>,
    step_duration_s: f64,
    grid_connector_id: String,
    csv_file: String,
    column: String,
}

#[derive(Debug, Deserialize)]
struct RawScheduleCsv {
    start_time: DateTime<FixedOffset>,
    step_duration_s: f64,
    grid_connector_id: String,
    csv_file: String,
    column: String,
    #[serde(default = "default_window_column")]
    window_column: String,
}

fn default_window_column() -> String {
    "charge".to_string()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Scenario {
    /// Loads a scenario document from a JSON file. Referenced CSV files are
    /// resolved relative to the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&content, dir)
    }

    /// Parses a scenario from a JSON string.
    pub fn from_json_str(content: &str, dir: &Path) -> Result<Self, SimError> {
        let mut value: Value = serde_json::from_str(content)
            .map_err(|e| SimError::InvalidScenario(e.to_string()))?;
        normalize_keys(&mut value);
        let raw: RawDocument = serde_json::from_value(value)
            .map_err(|e| SimError::InvalidScenario(e.to_string()))?;
        build(raw, dir)
    }
}

/// Rewrites legacy spaced keys (`"grid operator"`, `"voltage level"`) to the
/// underscore forms, with a warning.
fn normalize_keys(value: &mut Value) {
    let renames = [
        ("grid operator", "grid_operator"),
        ("voltage level", "voltage_level"),
    ];
    let key = if value.get("components").is_some() {
        "components"
    } else {
        "constants"
    };
    let Some(connectors) = value
        .get_mut(key)
        .and_then(|c| c.get_mut("grid_connectors"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for (gc_id, gc) in connectors.iter_mut() {
        let Some(obj) = gc.as_object_mut() else {
            continue;
        };
        for (old, new) in renames {
            if let Some(v) = obj.remove(old) {
                warn!("grid connector {gc_id}: key \"{old}\" is deprecated, use \"{new}\"");
                obj.entry(new.to_string()).or_insert(v);
            }
        }
    }
}

fn build(raw: RawDocument, dir: &Path) -> Result<Scenario, SimError> {
    let config = build_config(&raw.scenario)?;
    let mut world = World::default();
    let mut events: Vec<Event> = Vec::new();

    // grid connectors first, everything else points at them
    for (gc_id, raw_gc) in raw.components.grid_connectors {
        let max_power = match raw_gc.max_power {
            Some(p) if p >= 0.0 => p,
            _ => f64::INFINITY,
        };
        let mut gc = GridConnector::new(max_power);
        gc.voltage_level = raw_gc.voltage_level;
        gc.grid_operator = raw_gc.grid_operator;
        gc.number_cs = raw_gc.number_cs;
        gc.cost = raw_gc.cost;
        gc.target = raw_gc.target;
        gc.window = raw_gc.window;
        world.grid_connectors.insert(gc_id, gc);
    }

    for (cs_id, raw_cs) in raw.components.charging_stations {
        if !world.grid_connectors.contains_key(&raw_cs.parent) {
            return Err(SimError::UnknownComponent {
                kind: "grid connector",
                id: format!("{} (parent of station {cs_id})", raw_cs.parent),
            });
        }
        world.charging_stations.insert(
            cs_id,
            ChargingStation::new(raw_cs.parent, raw_cs.max_power, raw_cs.min_power),
        );
    }

    let mut vehicle_types: BTreeMap<String, VehicleType> = BTreeMap::new();
    for (name, raw_vt) in raw.components.vehicle_types {
        let vt = VehicleType::new(
            name.clone(),
            raw_vt.capacity,
            raw_vt.charging_curve,
            raw_vt.min_charging_power,
            raw_vt.battery_efficiency,
            raw_vt.v2g,
            raw_vt.v2g_power_factor,
            raw_vt.discharge_limit,
            raw_vt.discharge_curve,
        );
        vehicle_types.insert(name, vt);
    }

    for (v_id, raw_v) in raw.components.vehicles {
        let Some(vt) = vehicle_types.get(&raw_v.vehicle_type) else {
            return Err(SimError::UnknownComponent {
                kind: "vehicle type",
                id: format!("{} (of vehicle {v_id})", raw_v.vehicle_type),
            });
        };
        if !(0.0..=1.0).contains(&raw_v.soc) || !(0.0..=1.0).contains(&raw_v.desired_soc) {
            return Err(SimError::InvalidScenario(format!(
                "vehicle {v_id}: soc and desired_soc must be within [0, 1]"
            )));
        }
        if let Some(cs_id) = &raw_v.connected_charging_station {
            if !world.charging_stations.contains_key(cs_id) {
                return Err(SimError::UnknownComponent {
                    kind: "charging station",
                    id: format!("{cs_id} (of vehicle {v_id})"),
                });
            }
        }
        let mut vehicle = Vehicle::new(vt.clone(), raw_v.soc, raw_v.desired_soc);
        vehicle.connected_charging_station = raw_v.connected_charging_station;
        vehicle.estimated_time_of_departure = raw_v.estimated_time_of_departure;
        vehicle.schedule = raw_v.schedule;
        world.vehicles.insert(v_id, vehicle);
    }

    for (b_id, raw_bat) in raw.components.batteries {
        if !world.grid_connectors.contains_key(&raw_bat.parent) {
            return Err(SimError::UnknownComponent {
                kind: "grid connector",
                id: format!("{} (parent of battery {b_id})", raw_bat.parent),
            });
        }
        let capacity = if raw_bat.capacity >= 0.0 {
            raw_bat.capacity
        } else {
            UNLIMITED_CAPACITY
        };
        let battery = match raw_bat.discharge_curve {
            Some(curve) => Battery::with_discharge_curve(
                capacity,
                raw_bat.charging_curve,
                curve,
                raw_bat.soc,
                raw_bat.efficiency,
            ),
            None => Battery::new(capacity, raw_bat.charging_curve, raw_bat.soc, raw_bat.efficiency),
        };
        world.batteries.insert(
            b_id,
            StationaryBattery {
                parent: raw_bat.parent,
                battery,
                min_charging_power: raw_bat.min_charging_power,
            },
        );
    }

    for (pv_id, raw_pv) in raw.components.photovoltaics {
        if !world.grid_connectors.contains_key(&raw_pv.parent) {
            return Err(SimError::UnknownComponent {
                kind: "grid connector",
                id: format!("{} (parent of PV {pv_id})", raw_pv.parent),
            });
        }
        world.photovoltaics.insert(
            pv_id,
            Photovoltaics {
                parent: raw_pv.parent,
                nominal_power: raw_pv.nominal_power,
            },
        );
    }

    // input series
    for (name, series) in &raw.events.fixed_load {
        check_gc(&world, &series.grid_connector_id, "fixed load series")?;
        if world.charging_stations.contains_key(name) {
            return Err(SimError::InvalidScenario(format!(
                "fixed load \"{name}\" collides with a charging station id"
            )));
        }
        let values = series_values(series, dir)?;
        // no foresight: each value becomes known as it starts
        for (idx, value) in values.iter().enumerate() {
            let at = series.start_time
                + Duration::seconds((series.step_duration_s * idx as f64) as i64);
            events.push(Event {
                signal_time: at,
                start_time: at,
                seq: 0,
                kind: EventKind::FixedLoad {
                    name: name.clone(),
                    gc_id: series.grid_connector_id.clone(),
                    value: value * series.factor,
                },
            });
        }
        if let Some(gc) = world.grid_connectors.get_mut(&series.grid_connector_id) {
            let scaled: Vec<f64> = values.iter().map(|v| v * series.factor).collect();
            gc.add_avg_fixed_load_week(
                series.start_time,
                series.step_duration_s,
                &scaled,
                config.interval_min,
            );
        }
    }

    for (name, series) in &raw.events.local_generation {
        check_gc(&world, &series.grid_connector_id, "local generation series")?;
        let values = series_values(series, dir)?;
        world.generation_names.insert(name.clone());
        for (idx, value) in values.iter().enumerate() {
            let at = series.start_time
                + Duration::seconds((series.step_duration_s * idx as f64) as i64);
            events.push(Event {
                // generation forecasts are known from the series start
                signal_time: series.start_time,
                start_time: at,
                seq: 0,
                kind: EventKind::LocalGeneration {
                    name: name.clone(),
                    gc_id: series.grid_connector_id.clone(),
                    value: value * series.factor,
                },
            });
        }
    }

    for signal in raw.events.grid_operator_signals {
        check_gc(&world, &signal.grid_connector_id, "grid operator signal")?;
        events.push(Event {
            signal_time: signal.signal_time,
            start_time: signal.start_time,
            seq: 0,
            kind: EventKind::GridSignal {
                gc_id: signal.grid_connector_id,
                max_power: signal.max_power,
                cost: signal.cost,
                target: signal.target,
                window: signal.window,
            },
        });
    }

    if let Some(binding) = &raw.events.energy_price_from_csv {
        check_gc(&world, &binding.grid_connector_id, "energy price series")?;
        let values = load_csv_column(&dir.join(&binding.csv_file), &binding.column)?;
        let step = Duration::seconds(binding.step_duration_s as i64);
        for (idx, value) in values.iter().enumerate() {
            let start_time = binding.start_time + step * idx as i32;
            // day-ahead market: prices are public one day early
            let signal_time = (start_time - Duration::days(1)).max(binding.start_time);
            events.push(Event {
                signal_time,
                start_time,
                seq: 0,
                kind: EventKind::GridSignal {
                    gc_id: binding.grid_connector_id.clone(),
                    max_power: None,
                    cost: Some(Cost::Fixed { value: *value }),
                    target: None,
                    window: None,
                },
            });
        }
    }

    if let Some(binding) = &raw.events.schedule_from_csv {
        check_gc(&world, &binding.grid_connector_id, "schedule series")?;
        events.extend(schedule_events(binding, dir)?);
    }

    for raw_event in raw.events.vehicle_events {
        if !world.vehicles.contains_key(&raw_event.vehicle_id) {
            return Err(SimError::UnknownComponent {
                kind: "vehicle",
                id: format!("{} (in vehicle event)", raw_event.vehicle_id),
            });
        }
        let update = raw_event.update;
        let kind = match raw_event.event_type.as_str() {
            "arrival" => {
                let Some(soc_delta) = update.soc_delta else {
                    return Err(SimError::InvalidScenario(format!(
                        "arrival of {} at {} lacks soc_delta",
                        raw_event.vehicle_id, raw_event.start_time
                    )));
                };
                if soc_delta > 0.0 {
                    return Err(SimError::InvalidScenario(format!(
                        "arrival of {} at {}: soc_delta must be <= 0",
                        raw_event.vehicle_id, raw_event.start_time
                    )));
                }
                if let Some(cs_id) = &update.connected_charging_station {
                    if !world.charging_stations.contains_key(cs_id) {
                        return Err(SimError::UnknownComponent {
                            kind: "charging station",
                            id: format!("{cs_id} (in vehicle event)"),
                        });
                    }
                }
                EventKind::VehicleArrival {
                    vehicle_id: raw_event.vehicle_id,
                    soc_delta,
                    connected_charging_station: update.connected_charging_station,
                    estimated_time_of_departure: update.estimated_time_of_departure,
                    desired_soc: update.desired_soc,
                }
            }
            "departure" => EventKind::VehicleDeparture {
                vehicle_id: raw_event.vehicle_id,
                estimated_time_of_arrival: update.estimated_time_of_arrival,
            },
            "schedule" => {
                let Some(schedule) = update.schedule else {
                    return Err(SimError::InvalidScenario(format!(
                        "schedule event of {} lacks a schedule value",
                        raw_event.vehicle_id
                    )));
                };
                EventKind::VehicleSchedule {
                    vehicle_id: raw_event.vehicle_id,
                    schedule,
                }
            }
            other => {
                return Err(SimError::InvalidScenario(format!(
                    "unknown vehicle event type \"{other}\""
                )));
            }
        };
        events.push(Event {
            signal_time: raw_event.signal_time,
            start_time: raw_event.start_time,
            seq: 0,
            kind,
        });
    }

    let after_end = events
        .iter()
        .filter(|e| e.start_time > config.stop_time())
        .count();
    if after_end > 0 {
        warn!("{after_end} events start after the end of the scenario");
    }

    Ok(Scenario {
        config,
        world,
        events: EventQueue::new(events),
    })
}

fn build_config(raw: &RawScenario) -> Result<SimConfig, SimError> {
    if raw.interval <= 0 {
        return Err(SimError::InvalidScenario("interval must be > 0".into()));
    }
    let n_intervals = match (raw.n_intervals, raw.stop_time) {
        (Some(n), None) => n,
        (None, Some(stop)) => {
            let delta = stop - raw.start_time;
            let n = delta.num_minutes() / raw.interval;
            if n <= 0 {
                return Err(SimError::InvalidScenario(
                    "stop_time must be after start_time".into(),
                ));
            }
            n as usize
        }
        _ => {
            return Err(SimError::InvalidScenario(
                "give either n_intervals or stop_time, not both".into(),
            ));
        }
    };

    let core_standing_time = match &raw.core_standing_time {
        None => None,
        Some(cst) => {
            let full_days = if cst.full_days.is_empty() {
                Vec::new()
            } else {
                // the weekday numbering is ambiguous across producers:
                // refuse to guess
                match raw.weekday_convention.as_deref() {
                    Some("monday0") => {
                        if cst.full_days.iter().any(|&d| d > 6) {
                            return Err(SimError::InvalidScenario(
                                "full_days out of range for monday0 (0..=6)".into(),
                            ));
                        }
                        cst.full_days.clone()
                    }
                    Some("iso") => {
                        if cst.full_days.iter().any(|&d| !(1..=7).contains(&d)) {
                            return Err(SimError::InvalidScenario(
                                "full_days out of range for iso (1..=7)".into(),
                            ));
                        }
                        cst.full_days.iter().map(|&d| d - 1).collect()
                    }
                    Some(other) => {
                        return Err(SimError::InvalidScenario(format!(
                            "unknown weekday_convention \"{other}\" (monday0 or iso)"
                        )));
                    }
                    None => {
                        return Err(SimError::InvalidScenario(
                            "core_standing_time.full_days requires an explicit \
                             weekday_convention (monday0 or iso)"
                                .into(),
                        ));
                    }
                }
            };
            let mut times = Vec::new();
            for window in &cst.times {
                let start = NaiveTime::from_hms_opt(window.start[0], window.start[1], 0);
                let end = NaiveTime::from_hms_opt(window.end[0], window.end[1], 0);
                match (start, end) {
                    (Some(start), Some(end)) => times.push((start, end)),
                    _ => {
                        return Err(SimError::InvalidScenario(
                            "invalid core standing time window".into(),
                        ));
                    }
                }
            }
            Some(CoreStandingTime { times, full_days })
        }
    };

    Ok(SimConfig {
        start_time: raw.start_time,
        interval_min: raw.interval,
        n_intervals,
        core_standing_time,
    })
}

fn check_gc(world: &World, gc_id: &str, context: &str) -> Result<(), SimError> {
    if world.grid_connectors.contains_key(gc_id) {
        Ok(())
    } else {
        Err(SimError::UnknownComponent {
            kind: "grid connector",
            id: format!("{gc_id} (in {context})"),
        })
    }
}

fn series_values(series: &RawSeries, dir: &Path) -> Result<Vec<f64>, SimError> {
    match (&series.csv_file, series.values.is_empty()) {
        (Some(file), true) => {
            let Some(column) = &series.column else {
                return Err(SimError::InvalidScenario(format!(
                    "series from \"{file}\" needs a column name"
                )));
            };
            load_csv_column(&dir.join(file), column)
        }
        (Some(_), false) => Err(SimError::InvalidScenario(
            "give either values or csv_file, not both".into(),
        )),
        (None, false) => Ok(series.values.clone()),
        (None, true) => Ok(Vec::new()),
    }
}

/// Turns a schedule CSV into grid operator signals, one per change of target
/// or window. By convention the schedule is announced at 9:00 the day before
/// it takes effect.
fn schedule_events(binding: &RawScheduleCsv, dir: &Path) -> Result<Vec<Event>, SimError> {
    let path = dir.join(&binding.csv_file);
    let targets = load_csv_column(&path, &binding.column)?;
    let windows = load_csv_column(&path, &binding.window_column).ok();
    let step = Duration::seconds(binding.step_duration_s as i64);

    let mut events = Vec::new();
    let mut last: Option<(f64, Option<bool>)> = None;
    for (idx, &target) in targets.iter().enumerate() {
        let window = windows
            .as_ref()
            .and_then(|w| w.get(idx))
            .map(|&v| v != 0.0);
        if last == Some((target, window)) {
            continue;
        }
        last = Some((target, window));

        let start_time = binding.start_time + step * idx as i32;
        let days_back = if start_time.hour() < 12 { 2 } else { 1 };
        // announced at 9:00 on the prior day
        let shifted = start_time - Duration::days(days_back);
        let since_nine = Duration::hours(i64::from(shifted.hour()) - 9)
            + Duration::minutes(i64::from(shifted.minute()))
            + Duration::seconds(i64::from(shifted.second()));
        let signal_time = (shifted - since_nine).max(binding.start_time);
        events.push(Event {
            signal_time,
            start_time,
            seq: 0,
            kind: EventKind::GridSignal {
                gc_id: binding.grid_connector_id.clone(),
                max_power: None,
                cost: None,
                target: Some(target),
                window,
            },
        });
    }
    Ok(events)
}
