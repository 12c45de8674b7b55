//! Mixed depot / opportunity charging across several grid connectors.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;

use crate::config::SimOptions;
use crate::error::SimError;
use crate::sim::event::{EventKind, EventQueue};
use crate::sim::types::{StepContext, World};
use crate::util::{EPS, ITERATIONS};

use super::{
    clamp_power, distribute_surplus, order_vehicles, reset_station_power, Allocation, Strategy,
    VehicleOrder,
};

/// How far ahead vehicle rotations are known (minutes).
const ARRIVAL_HORIZON_MIN: i64 = 60;
/// Minimum charging time at a depot; arrivals within this horizon compete for
/// the free slots (minutes).
const CHARGE_HORIZON_MIN: i64 = 3;

/// Station kind, derived from the charging station id suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StationKind {
    /// `_deps`: depot, vehicles charge balanced.
    Depot,
    /// `_opps`: opportunity stop, vehicles charge greedy.
    Opportunity,
}

fn station_kind(cs_id: &str) -> Result<StationKind, SimError> {
    match cs_id.rsplit('_').next() {
        Some("deps") => Ok(StationKind::Depot),
        Some("opps") => Ok(StationKind::Opportunity),
        _ => Err(SimError::Strategy(format!(
            "station \"{cs_id}\" has no \"deps\"/\"opps\" suffix"
        ))),
    }
}

/// Greedy charging at opportunity stops, balanced charging at depots.
///
/// When a connector has fewer physical charging points (`number_cs`) than
/// present vehicles, the free slots go to the lowest-SoC vehicles, taking
/// arrivals within the charge horizon into account. Vehicle rotations are
/// known one hour in advance.
#[derive(Debug)]
pub struct Distributed {
    price_threshold: f64,
    /// Slot assignment per grid connector, kept across steps.
    connected: BTreeMap<String, BTreeSet<String>>,
}

impl Distributed {
    pub fn new(options: &SimOptions, queue: &mut EventQueue) -> Self {
        let horizon = Duration::minutes(ARRIVAL_HORIZON_MIN);
        queue.adjust_signal_times(|event| match &event.kind {
            EventKind::VehicleArrival { .. }
            | EventKind::VehicleDeparture { .. }
            | EventKind::VehicleSchedule { .. } => {
                Some(event.signal_time.min(event.start_time - horizon))
            }
            _ => None,
        });
        Self {
            price_threshold: options.strategy.price_threshold,
            connected: BTreeMap::new(),
        }
    }

    /// Refreshes the slot assignment of every connector with limited
    /// charging points.
    fn assign_slots(&mut self, world: &World, ctx: &StepContext) {
        // vehicles needing charge per connector: present ones plus arrivals
        // within the charge horizon, with their SoC on arrival
        let mut arriving: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
        for (v_id, vehicle) in &world.vehicles {
            let Some(cs) = vehicle
                .connected_charging_station
                .as_deref()
                .and_then(|id| world.charging_stations.get(id))
            else {
                continue;
            };
            if vehicle.delta_soc() > EPS {
                arriving
                    .entry(cs.parent.clone())
                    .or_default()
                    .push((v_id.clone(), vehicle.battery.soc));
            }
        }
        let charge_horizon = ctx.current_time + Duration::minutes(CHARGE_HORIZON_MIN);
        for event in &world.future_events {
            let EventKind::VehicleArrival {
                vehicle_id,
                soc_delta,
                connected_charging_station: Some(cs_id),
                desired_soc,
                ..
            } = &event.kind
            else {
                continue;
            };
            if event.start_time > charge_horizon {
                continue;
            }
            let Some(cs) = world.charging_stations.get(cs_id) else {
                continue;
            };
            let Some(vehicle) = world.vehicles.get(vehicle_id) else {
                continue;
            };
            let soc = vehicle.battery.soc + soc_delta;
            let desired = desired_soc.unwrap_or(vehicle.desired_soc);
            if soc < desired {
                arriving
                    .entry(cs.parent.clone())
                    .or_default()
                    .push((vehicle_id.clone(), soc));
            }
        }

        for (gc_id, gc) in &world.grid_connectors {
            let Some(number_cs) = gc.number_cs else {
                continue;
            };
            let slots = self.connected.entry(gc_id.clone()).or_default();
            // drop vehicles that have left
            slots.retain(|v_id| {
                world
                    .vehicles
                    .get(v_id)
                    .is_some_and(|v| v.connected_charging_station.is_some())
            });
            if slots.len() >= number_cs {
                continue;
            }
            // fill free slots by ascending SoC
            let mut candidates: Vec<(String, f64)> = arriving
                .get(gc_id)
                .map(|v| {
                    v.iter()
                        .filter(|(v_id, _)| !slots.contains(v_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            for (v_id, _) in candidates {
                if slots.len() >= number_cs {
                    break;
                }
                slots.insert(v_id);
            }
        }
    }

    /// Greedy allocation for one vehicle (opportunity stop).
    fn charge_greedy(
        &self,
        world: &mut World,
        ctx: &StepContext,
        v_id: &str,
        extra_headroom: f64,
        allocation: &mut Allocation,
    ) {
        let Some(cs_id) = world.vehicles[v_id].connected_charging_station.clone() else {
            return;
        };
        let Some(cs) = world.charging_stations.get(&cs_id) else {
            return;
        };
        let gc_id = cs.parent.clone();
        let (power, target_soc) = {
            let gc = &world.grid_connectors[&gc_id];
            let vehicle = &world.vehicles[v_id];
            let headroom = gc.cur_max_power - gc.current_load() + extra_headroom;
            if gc.unit_price() <= self.price_threshold {
                (clamp_power(headroom, vehicle, cs), 1.0)
            } else if vehicle.delta_soc() > EPS {
                (clamp_power(headroom, vehicle, cs), vehicle.desired_soc)
            } else {
                (0.0, vehicle.desired_soc)
            }
        };
        let flow = match world.vehicles.get_mut(v_id) {
            Some(v) => v.battery.load(ctx.dt_hours, power, target_soc),
            None => return,
        };
        if let Some(gc) = world.grid_connectors.get_mut(&gc_id) {
            let total = gc.add_load(&cs_id, flow.avg_power);
            allocation.record(&cs_id, total);
        }
        if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
            cs.current_power += flow.avg_power;
        }
    }

    /// Balanced allocation for one vehicle (depot).
    fn charge_balanced(
        &self,
        world: &mut World,
        ctx: &StepContext,
        v_id: &str,
        allocation: &mut Allocation,
    ) {
        let Some(cs_id) = world.vehicles[v_id].connected_charging_station.clone() else {
            return;
        };
        let Some(cs) = world.charging_stations.get(&cs_id) else {
            return;
        };
        let gc_id = cs.parent.clone();
        let power = {
            let gc = &world.grid_connectors[&gc_id];
            let vehicle = &world.vehicles[v_id];
            let headroom = gc.cur_max_power - gc.current_load();
            if gc.unit_price() <= self.price_threshold {
                clamp_power(headroom, vehicle, cs)
            } else if vehicle.delta_soc() > EPS {
                let max_power =
                    clamp_power(headroom.min(vehicle.vehicle_type.charging_curve.max_power), vehicle, cs);
                let min_power = vehicle.vehicle_type.min_charging_power.max(cs.min_power);
                let timesteps = super::timesteps_until_departure(vehicle, ctx);
                if timesteps > 0 {
                    let standing_hours = timesteps as f64 * ctx.dt_hours;
                    let delta_soc = vehicle.delta_soc();
                    let mut lo = min_power;
                    let mut hi = max_power;
                    let mut power = 0.0;
                    let mut idx = 0;
                    let mut safe = false;
                    while (idx < ITERATIONS || !safe) && hi - lo > EPS {
                        idx += 1;
                        power = (hi + lo) / 2.0;
                        let mut sim = vehicle.battery.clone();
                        let charged = sim.load_iterative(standing_hours, power).soc_delta;
                        if delta_soc - charged > EPS {
                            safe = false;
                            lo = power;
                        } else {
                            safe = true;
                            hi = power;
                        }
                    }
                    power
                } else {
                    max_power
                }
            } else {
                0.0
            }
        };
        let flow = match world.vehicles.get_mut(v_id) {
            Some(v) => v.battery.load(ctx.dt_hours, power, 1.0),
            None => return,
        };
        if let Some(gc) = world.grid_connectors.get_mut(&gc_id) {
            let total = gc.add_load(&cs_id, flow.avg_power);
            allocation.record(&cs_id, total);
        }
        if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
            cs.current_power += flow.avg_power;
        }
    }
}

impl Strategy for Distributed {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn step(&mut self, world: &mut World, ctx: &StepContext) -> Result<Allocation, SimError> {
        let mut allocation = Allocation::default();
        reset_station_power(world);
        self.assign_slots(world, ctx);

        let gc_ids: Vec<String> = world.grid_connectors.keys().cloned().collect();
        for gc_id in gc_ids {
            // one station kind per connector
            let mut kind = None;
            for (cs_id, cs) in &world.charging_stations {
                if cs.parent != gc_id {
                    continue;
                }
                let this_kind = station_kind(cs_id)?;
                match kind {
                    None => kind = Some(this_kind),
                    Some(k) if k != this_kind => {
                        return Err(SimError::Strategy(format!(
                            "mixed station kinds at grid connector \"{gc_id}\""
                        )))
                    }
                    _ => {}
                }
            }
            let Some(kind) = kind else { continue };

            // vehicles allowed to charge here
            let has_slots = world.grid_connectors[&gc_id].number_cs.is_some();
            let mut vehicle_ids = world.vehicles_at_gc(&gc_id);
            if has_slots {
                let slots = self.connected.entry(gc_id.clone()).or_default();
                vehicle_ids.retain(|id| slots.contains(id));
            }
            // lowest SoC first at the limited depot, id order otherwise
            if has_slots {
                vehicle_ids = order_vehicles(world, vehicle_ids, VehicleOrder::LowestSoc);
            }

            match kind {
                StationKind::Opportunity => {
                    // stationary batteries widen the headroom while vehicles
                    // are present, and recharge otherwise
                    let bat_ids: Vec<String> = world
                        .batteries
                        .iter()
                        .filter(|(_, b)| b.parent == gc_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    let extra_headroom: f64 = if vehicle_ids.is_empty() {
                        0.0
                    } else {
                        bat_ids
                            .iter()
                            .map(|id| {
                                let b = &world.batteries[id];
                                let p = b.battery.available_power(ctx.dt_hours, 0.0);
                                if p < b.min_charging_power {
                                    0.0
                                } else {
                                    p
                                }
                            })
                            .sum()
                    };
                    for v_id in &vehicle_ids {
                        self.charge_greedy(world, ctx, v_id, extra_headroom, &mut allocation);
                    }
                    for b_id in bat_ids {
                        let (headroom, over_cap) = {
                            let gc = &world.grid_connectors[&gc_id];
                            (
                                gc.cur_max_power - gc.current_load(),
                                gc.current_load() - gc.cur_max_power,
                            )
                        };
                        let delta = if over_cap > EPS {
                            // vehicles drew beyond the cap: cover with storage
                            -world
                                .batteries
                                .get_mut(&b_id)
                                .map(|b| {
                                    b.battery.unload(ctx.dt_hours, Some(over_cap), 0.0).avg_power
                                })
                                .unwrap_or(0.0)
                        } else if vehicle_ids.is_empty() && headroom > EPS {
                            // vacant stop: refill until the next arrival
                            world
                                .batteries
                                .get_mut(&b_id)
                                .map(|b| {
                                    let p = if headroom < b.min_charging_power {
                                        0.0
                                    } else {
                                        headroom
                                    };
                                    b.battery.load(ctx.dt_hours, p, 1.0).avg_power
                                })
                                .unwrap_or(0.0)
                        } else {
                            0.0
                        };
                        if delta != 0.0 {
                            if let Some(gc) = world.grid_connectors.get_mut(&gc_id) {
                                gc.add_load(&b_id, delta);
                            }
                        }
                    }
                }
                StationKind::Depot => {
                    for v_id in &vehicle_ids {
                        self.charge_balanced(world, ctx, v_id, &mut allocation);
                    }
                    // depot batteries follow the default policy
                    let bat_ids: Vec<String> = world
                        .batteries
                        .iter()
                        .filter(|(_, b)| b.parent == gc_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for b_id in bat_ids {
                        let (gc_cheap, gc_load, headroom) = {
                            let gc = &world.grid_connectors[&gc_id];
                            (
                                gc.unit_price() <= self.price_threshold,
                                gc.current_load(),
                                gc.cur_max_power - gc.current_load(),
                            )
                        };
                        let min_charging = world.batteries[&b_id].min_charging_power;
                        let Some(bat) = world.batteries.get_mut(&b_id) else {
                            continue;
                        };
                        let delta = if gc_cheap {
                            let p = if headroom < min_charging { 0.0 } else { headroom };
                            bat.battery.load(ctx.dt_hours, p, 1.0).avg_power
                        } else if gc_load < 0.0 {
                            let p = if -gc_load < min_charging { 0.0 } else { -gc_load };
                            bat.battery.load(ctx.dt_hours, p, 1.0).avg_power
                        } else {
                            -bat.battery.unload(ctx.dt_hours, Some(gc_load), 0.0).avg_power
                        };
                        if let Some(gc) = world.grid_connectors.get_mut(&gc_id) {
                            gc.add_load(&b_id, delta);
                        }
                    }
                }
            }
        }

        distribute_surplus(world, ctx, self.price_threshold, &mut allocation.commands);
        Ok(allocation)
    }
}
