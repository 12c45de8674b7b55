//! Charging strategy trait, shared allocation helpers, and the factory.

pub mod balanced;
pub mod balanced_market;
pub mod distributed;
pub mod flex_window;
pub mod greedy;
pub mod peak_load_window;
pub mod schedule;

use std::collections::BTreeMap;

use log::warn;

use crate::config::SimOptions;
use crate::devices::{ChargingStation, Vehicle};
use crate::error::SimError;
use crate::sim::event::{EventKind, EventQueue};
use crate::sim::types::{SimConfig, StepContext, World};
use crate::util::{Cost, EPS};

pub use balanced::Balanced;
pub use balanced_market::BalancedMarket;
pub use distributed::Distributed;
pub use flex_window::FlexWindow;
pub use greedy::Greedy;
pub use peak_load_window::PeakLoadWindow;
pub use schedule::Schedule;

/// Strategy names accepted by the factory.
pub const STRATEGIES: &[&str] = &[
    "greedy",
    "balanced",
    "balanced_market",
    "schedule",
    "peak_load_window",
    "flex_window",
    "distributed",
];

/// Power allocated to each charging station this interval (kW, signed).
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub commands: BTreeMap<String, f64>,
}

impl Allocation {
    /// Records the station's accumulated power for this interval.
    pub fn record(&mut self, cs_id: &str, total_power: f64) {
        self.commands.insert(cs_id.to_string(), total_power);
    }

    pub fn merge(&mut self, other: Allocation) {
        self.commands.extend(other.commands);
    }
}

/// Per-interval power allocation policy.
///
/// A strategy reads the world (including the visible future events), charges
/// and discharges batteries, books the resulting powers onto the grid
/// connectors, and reports the per-station totals. The engine afterwards
/// verifies the connector caps and records the step.
pub trait Strategy {
    fn name(&self) -> &'static str;

    fn step(&mut self, world: &mut World, ctx: &StepContext) -> Result<Allocation, SimError>;
}

/// Builds the requested strategy, falling back when the scenario lacks the
/// signals it needs: schedule -> balanced, balanced_market -> balanced,
/// flex_window -> greedy.
pub fn build(
    world: &World,
    queue: &mut EventQueue,
    options: &SimOptions,
    config: &SimConfig,
) -> Result<Box<dyn Strategy>, SimError> {
    let name = options.strategy.name.as_str();
    match name {
        "greedy" => Ok(Box::new(Greedy::new(options))),
        "balanced" => Ok(Box::new(Balanced::new(options))),
        "balanced_market" => {
            if scenario_has_price(world, queue) {
                Ok(Box::new(BalancedMarket::new(options, config, queue)))
            } else {
                warn!("no energy price available, falling back from balanced_market to balanced");
                Ok(Box::new(Balanced::new(options)))
            }
        }
        "schedule" => {
            if scenario_has_target(world, queue) {
                Schedule::new(options, config).map(|s| Box::new(s) as Box<dyn Strategy>)
            } else {
                warn!("no grid operator schedule available, falling back from schedule to balanced");
                Ok(Box::new(Balanced::new(options)))
            }
        }
        "peak_load_window" => PeakLoadWindow::new(options, config, world, queue)
            .map(|s| Box::new(s) as Box<dyn Strategy>),
        "flex_window" => {
            if scenario_has_window(world, queue) {
                FlexWindow::new(options).map(|s| Box::new(s) as Box<dyn Strategy>)
            } else {
                warn!("no charging windows available, falling back from flex_window to greedy");
                Ok(Box::new(Greedy::new(options)))
            }
        }
        "distributed" => Ok(Box::new(Distributed::new(options, queue))),
        other => Err(SimError::Strategy(format!(
            "unknown strategy \"{other}\", available: {}",
            STRATEGIES.join(", ")
        ))),
    }
}

fn scenario_has_price(world: &World, queue: &EventQueue) -> bool {
    world.grid_connectors.values().any(|gc| gc.cost.is_some())
        || queue
            .pending()
            .iter()
            .any(|e| matches!(&e.kind, EventKind::GridSignal { cost: Some(_), .. }))
}

fn scenario_has_target(world: &World, queue: &EventQueue) -> bool {
    world.grid_connectors.values().any(|gc| gc.target.is_some())
        || queue
            .pending()
            .iter()
            .any(|e| matches!(&e.kind, EventKind::GridSignal { target: Some(_), .. }))
}

fn scenario_has_window(world: &World, queue: &EventQueue) -> bool {
    world.grid_connectors.values().any(|gc| gc.window.is_some())
        || queue
            .pending()
            .iter()
            .any(|e| matches!(&e.kind, EventKind::GridSignal { window: Some(_), .. }))
}

// ---------------------------------------------------------------------------
// Shared allocation helpers
// ---------------------------------------------------------------------------

/// Power actually usable by the vehicle at this station.
///
/// Caps at the station's remaining capacity and drops below the
/// refuse-to-charge thresholds (station and vehicle) to zero.
pub fn clamp_power(power: f64, vehicle: &Vehicle, cs: &ChargingStation) -> f64 {
    let total_power = (cs.current_power + power).min(cs.max_power);
    if total_power < cs.min_power || total_power < vehicle.vehicle_type.min_charging_power {
        return 0.0;
    }
    // current_power may exceed max_power by < EPS, keep the result non-negative
    power.min(cs.max_power - cs.current_power).max(0.0)
}

/// Zeroes every station's power at the start of a strategy step.
pub fn reset_station_power(world: &mut World) {
    for cs in world.charging_stations.values_mut() {
        cs.current_power = 0.0;
    }
}

/// Average power each grid connector's stationary batteries could deliver
/// this interval.
pub fn available_battery_power(world: &World, dt_hours: f64) -> BTreeMap<String, f64> {
    let mut avail: BTreeMap<String, f64> = world
        .grid_connectors
        .keys()
        .map(|id| (id.clone(), 0.0))
        .collect();
    for bat in world.batteries.values() {
        if let Some(power) = avail.get_mut(&bat.parent) {
            *power += bat.battery.available_power(dt_hours, 0.0);
        }
    }
    avail
}

/// Vehicle orderings used by the strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleOrder {
    /// Below-desired first, then earliest estimated departure.
    DepartureFirst,
    /// Largest missing energy first.
    Needy,
    /// Lowest SoC first.
    LowestSoc,
}

/// Sorts vehicle ids deterministically by the given ordering; ties keep the
/// lexicographic id order.
pub fn order_vehicles(world: &World, mut ids: Vec<String>, order: VehicleOrder) -> Vec<String> {
    ids.sort();
    match order {
        VehicleOrder::DepartureFirst => {
            ids.sort_by(|a, b| {
                let va = &world.vehicles[a];
                let vb = &world.vehicles[b];
                let sated_a = va.battery.soc >= va.desired_soc;
                let sated_b = vb.battery.soc >= vb.desired_soc;
                sated_a
                    .cmp(&sated_b)
                    .then(va.estimated_time_of_departure.cmp(&vb.estimated_time_of_departure))
            });
        }
        VehicleOrder::Needy => {
            ids.sort_by(|a, b| {
                let ea = world.vehicles[a].delta_soc() * world.vehicles[a].battery.capacity;
                let eb = world.vehicles[b].delta_soc() * world.vehicles[b].battery.capacity;
                eb.total_cmp(&ea)
            });
        }
        VehicleOrder::LowestSoc => {
            ids.sort_by(|a, b| world.vehicles[a].battery.soc.total_cmp(&world.vehicles[b].battery.soc));
        }
    }
    ids
}

/// Routes remaining local-generation surplus into connected vehicles, and
/// lets V2G vehicles with spare energy support an expensive grid connector.
pub fn distribute_surplus(
    world: &mut World,
    ctx: &StepContext,
    price_threshold: f64,
    commands: &mut BTreeMap<String, f64>,
) {
    let vehicle_ids: Vec<String> = world.vehicles.keys().cloned().collect();
    for v_id in vehicle_ids {
        let Some(cs_id) = world.vehicles[&v_id].connected_charging_station.clone() else {
            continue;
        };
        let Some(cs) = world.charging_stations.get(&cs_id) else {
            continue;
        };
        let gc_id = cs.parent.clone();
        let Some(gc) = world.grid_connectors.get(&gc_id) else {
            continue;
        };
        let gc_surplus = -gc.current_load();
        let gc_cheap = gc.unit_price() <= price_threshold;

        if gc_surplus > EPS {
            let vehicle = &world.vehicles[&v_id];
            let power = clamp_power(gc_surplus, vehicle, cs);
            let flow = world.vehicles.get_mut(&v_id).map(|v| {
                v.battery.load(ctx.dt_hours, power, 1.0)
            });
            if let Some(flow) = flow {
                let total = world
                    .grid_connectors
                    .get_mut(&gc_id)
                    .map(|gc| gc.add_load(&cs_id, flow.avg_power))
                    .unwrap_or(0.0);
                if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                    cs.current_power += flow.avg_power;
                }
                commands.insert(cs_id.clone(), total);
            }
        } else {
            let vehicle = &world.vehicles[&v_id];
            let vt = &vehicle.vehicle_type;
            let wants_discharge = vehicle.delta_soc() < -EPS
                && vt.v2g
                && cs.current_power < EPS
                && !gc_cheap
                && gc.current_load() > EPS;
            if wants_discharge {
                let discharge_power = gc
                    .current_load()
                    .min(vt.charging_curve.max_power * vt.v2g_power_factor);
                let target_soc = vehicle.desired_soc.max(vt.discharge_limit);
                let flow = world.vehicles.get_mut(&v_id).map(|v| {
                    v.battery.unload(ctx.dt_hours, Some(discharge_power), target_soc)
                });
                if let Some(flow) = flow {
                    let total = world
                        .grid_connectors
                        .get_mut(&gc_id)
                        .map(|gc| gc.add_load(&cs_id, -flow.avg_power))
                        .unwrap_or(0.0);
                    if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                        cs.current_power -= flow.avg_power;
                    }
                    commands.insert(cs_id.clone(), total);
                }
            }
        }
    }
}

/// Default stationary battery policy: charge with full power when energy is
/// cheap, store surplus generation otherwise, and discharge to support a
/// drawing grid connector.
pub fn update_batteries(world: &mut World, ctx: &StepContext, price_threshold: f64) {
    let bat_ids: Vec<String> = world.batteries.keys().cloned().collect();
    for b_id in bat_ids {
        let gc_id = world.batteries[&b_id].parent.clone();
        let Some(gc) = world.grid_connectors.get(&gc_id) else {
            continue;
        };
        let gc_cheap = gc.unit_price() <= price_threshold;
        let gc_load = gc.current_load();
        let headroom = gc.cur_max_power - gc_load;
        let min_charging_power = world.batteries[&b_id].min_charging_power;

        let bat = world.batteries.get_mut(&b_id).map(|b| &mut b.battery);
        let Some(battery) = bat else { continue };

        let delta = if gc_cheap {
            let power = if headroom < min_charging_power { 0.0 } else { headroom };
            battery.load(ctx.dt_hours, power, 1.0).avg_power
        } else if gc_load < 0.0 {
            let power = if -gc_load < min_charging_power { 0.0 } else { -gc_load };
            battery.load(ctx.dt_hours, power, 1.0).avg_power
        } else {
            -battery.unload(ctx.dt_hours, Some(gc_load), 0.0).avg_power
        };
        if let Some(gc) = world.grid_connectors.get_mut(&gc_id) {
            gc.add_load(&b_id, delta);
        }
    }
}

/// Predicted state of a grid connector for one future timestep.
#[derive(Debug, Clone)]
pub struct TsInfo {
    /// Power still available below the predicted cap (kW).
    pub power: f64,
    /// Predicted power cap (kW).
    pub max_power: f64,
    /// Predicted unit price (infinite without tariff).
    pub price: f64,
    pub window: Option<bool>,
    /// Predicted fixed load including generation (kW).
    pub fixed_load: f64,
}

/// Replays the visible future events of one grid connector into per-timestep
/// predictions over the next `n_ahead` intervals. Timestep 0 uses the actual
/// current load; later steps combine the weekday-average fixed load with the
/// announced generation values.
pub fn predict_gc_timesteps(
    world: &World,
    gc_id: &str,
    ctx: &StepContext,
    n_ahead: usize,
) -> Vec<TsInfo> {
    let Some(gc) = world.grid_connectors.get(gc_id) else {
        return Vec::new();
    };
    let mut cur_cost = gc.cost.clone();
    let mut cur_max_power = gc.cur_max_power;
    let mut cur_window = gc.window;
    // generation currently flowing in (negative loads, stored positive)
    let mut cur_generation: BTreeMap<String, f64> = gc
        .current_loads
        .iter()
        .filter(|(_, &v)| v < 0.0)
        .map(|(k, &v)| (k.clone(), -v))
        .collect();

    let mut timesteps = Vec::with_capacity(n_ahead);
    let mut event_idx = 0;
    let mut cur_time = ctx.current_time;

    for ts_idx in 0..n_ahead {
        if ts_idx > 0 {
            cur_time += ctx.interval();
        }
        while event_idx < world.future_events.len() {
            let event = &world.future_events[event_idx];
            if event.start_time > cur_time {
                break;
            }
            event_idx += 1;
            match &event.kind {
                EventKind::GridSignal {
                    gc_id: id,
                    max_power,
                    cost,
                    window,
                    ..
                } if id == gc_id => {
                    if let Some(p) = max_power {
                        cur_max_power = gc.max_power.min(*p);
                    }
                    if let Some(c) = cost {
                        cur_cost = Some(c.clone());
                    }
                    if window.is_some() {
                        cur_window = *window;
                    }
                }
                EventKind::LocalGeneration {
                    gc_id: id,
                    name,
                    value,
                } if id == gc_id => {
                    cur_generation.insert(name.clone(), *value);
                }
                _ => {}
            }
        }

        let fixed_load = if ts_idx == 0 {
            gc.current_load()
        } else {
            gc.avg_fixed_load_at(cur_time, ctx.interval_min)
                - cur_generation.values().sum::<f64>()
        };

        timesteps.push(TsInfo {
            power: cur_max_power - fixed_load,
            max_power: cur_max_power,
            price: cur_cost.as_ref().map_or(f64::INFINITY, Cost::unit_price),
            window: cur_window,
            fixed_load,
        });
    }
    timesteps
}

/// Timesteps until the vehicle's estimated departure, rounded up, at least 0.
pub fn timesteps_until_departure(vehicle: &Vehicle, ctx: &StepContext) -> usize {
    match vehicle.estimated_time_of_departure {
        Some(departure) if departure > ctx.current_time => {
            let minutes = (departure - ctx.current_time).num_minutes();
            (minutes as f64 / ctx.interval_min as f64).ceil() as usize
        }
        _ => 0,
    }
}
