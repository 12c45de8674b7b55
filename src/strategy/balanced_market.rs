//! Price-oriented charging at times of low energy price.

use chrono::Duration;

use crate::config::SimOptions;
use crate::error::SimError;
use crate::sim::event::{EventKind, EventQueue};
use crate::sim::types::{SimConfig, StepContext, World};
use crate::util::{EPS, ITERATIONS};

use super::{clamp_power, predict_gc_timesteps, reset_station_power, Allocation, Strategy, TsInfo};

/// Shifts each vehicle's charging into the cheapest visible timesteps.
///
/// The look-ahead predicts available power and price for every timestep of
/// the horizon; the cheapest prefix that covers the energy demand is chosen
/// and refined to a balanced power level by binary search. V2G vehicles
/// additionally discharge in the most expensive timesteps when cheaper ones
/// can refill the battery before departure.
#[derive(Debug)]
pub struct BalancedMarket {
    price_threshold: f64,
    horizon_hours: f64,
}

impl BalancedMarket {
    pub fn new(options: &SimOptions, config: &SimConfig, queue: &mut EventQueue) -> Self {
        let horizon_hours = options.strategy.horizon_hours;
        // price signals are contractually known at least one horizon ahead
        let horizon = Duration::minutes((horizon_hours * 60.0) as i64);
        let start = config.start_time;
        let changed = queue.adjust_signal_times(|event| match &event.kind {
            EventKind::GridSignal { cost: Some(_), .. } => {
                Some(event.signal_time.min(event.start_time - horizon).max(start))
            }
            _ => None,
        });
        if changed > 0 {
            log::info!("{changed} price events signaled earlier for the market horizon");
        }
        Self {
            price_threshold: options.strategy.price_threshold,
            horizon_hours,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step_gc(
        &self,
        world: &mut World,
        ctx: &StepContext,
        gc_id: &str,
        allocation: &mut Allocation,
    ) {
        let timesteps_ahead = (self.horizon_hours * ctx.ts_per_hour).round() as usize;
        let mut timesteps: Vec<TsInfo> = predict_gc_timesteps(world, gc_id, ctx, timesteps_ahead);
        let mut discharging_stations: Vec<String> = Vec::new();

        // vehicles at this connector by departure, ties by id
        let mut vehicles: Vec<(String, chrono::DateTime<chrono::FixedOffset>)> = world
            .vehicles_at_gc(gc_id)
            .into_iter()
            .map(|id| {
                let departure = world.vehicles[&id]
                    .estimated_time_of_departure
                    .unwrap_or(ctx.stop_time);
                (id, departure)
            })
            .collect();
        vehicles.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        for (v_id, departure) in &vehicles {
            let cs_id = match world.vehicles[v_id].connected_charging_station.clone() {
                Some(id) => id,
                None => continue,
            };
            let original_soc = world.vehicles[v_id].battery.soc;
            let desired_soc = world.vehicles[v_id].desired_soc;
            let vt = world.vehicles[v_id].vehicle_type.clone();

            // timesteps while the vehicle is present
            let ts_leave = ((*departure - ctx.current_time).num_minutes() / ctx.interval_min)
                .max(0) as usize;
            let n_present = ts_leave.min(timesteps.len());
            let mut sorted_ts: Vec<(f64, usize)> = timesteps[..n_present]
                .iter()
                .enumerate()
                .map(|(idx, info)| (info.price, idx))
                .collect();
            sorted_ts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut sim_battery = world.vehicles[v_id].battery.clone();
            let mut power = vec![0.0_f64; n_present];
            let mut sorted_idx = 0;
            let mut charged_now = false;

            // ---------- charge in cheapest timesteps ---------- //
            while sorted_idx < sorted_ts.len() {
                let (cost, start_idx) = sorted_ts[sorted_idx];
                // below the threshold the battery may fill completely
                let target = if cost < self.price_threshold {
                    1.0 - EPS
                } else {
                    desired_soc - EPS
                };
                if sim_battery.soc >= target {
                    // done; leave the remaining timesteps to V2G
                    sorted_idx = 0;
                    break;
                }

                // group timesteps sharing this price
                let mut same_price_ts = vec![start_idx];
                let mut next_idx = sorted_idx + 1;
                while next_idx < sorted_ts.len() {
                    let (next_cost, next_ts) = sorted_ts[next_idx];
                    if (next_cost - cost).abs() < EPS || next_cost <= self.price_threshold {
                        same_price_ts.push(next_ts);
                        next_idx += 1;
                    } else {
                        break;
                    }
                }
                sorted_idx = next_idx;

                // naive: full power during the whole group
                let old_soc = sim_battery.soc;
                for &ts_idx in &same_price_ts {
                    let p = {
                        let vehicle = &world.vehicles[v_id];
                        let cs = &world.charging_stations[&cs_id];
                        clamp_power(timesteps[ts_idx].power, vehicle, cs)
                    };
                    power[ts_idx] = p;
                    sim_battery.load(ctx.dt_hours, p, 1.0);
                }

                if sim_battery.soc >= target {
                    // overshot: find the balanced power level
                    let cs_max = world.charging_stations[&cs_id].max_power;
                    let mut min_power = 0.0;
                    let mut max_power = cs_max;
                    let mut safe = false;
                    let mut idx = 0;
                    while (idx < ITERATIONS || !safe) && max_power - min_power > EPS {
                        idx += 1;
                        sim_battery.soc = old_soc;
                        let cur_power = (max_power + min_power) / 2.0;
                        for &ts_idx in &same_price_ts {
                            let p = {
                                let vehicle = &world.vehicles[v_id];
                                let cs = &world.charging_stations[&cs_id];
                                clamp_power(timesteps[ts_idx].power.min(cur_power), vehicle, cs)
                            };
                            power[ts_idx] = p;
                            sim_battery.load(ctx.dt_hours, p, 1.0);
                        }
                        safe = sim_battery.soc >= target;
                        if safe {
                            max_power = cur_power;
                        } else {
                            min_power = cur_power;
                        }
                    }
                }

                if start_idx == 0 && power[0] != 0.0 {
                    // cheapest group includes the current timestep: charge now
                    let flow = match world.vehicles.get_mut(v_id) {
                        Some(v) => v.battery.load(ctx.dt_hours, power[0], 1.0),
                        None => break,
                    };
                    if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                        let total = gc.add_load(&cs_id, flow.avg_power);
                        allocation.record(&cs_id, total);
                    }
                    if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                        cs.current_power += flow.avg_power;
                    }
                    charged_now = true;
                    break;
                }
            }

            // ---------- vehicle to grid ---------- //
            let mut v2g_sorted_idx = sorted_ts.len();
            while vt.v2g && !charged_now && v2g_sorted_idx > sorted_idx {
                v2g_sorted_idx -= 1;
                let (v2g_cost, v2g_ts_idx) = sorted_ts[v2g_sorted_idx];
                if v2g_cost < self.price_threshold {
                    // too cheap to sell
                    break;
                }
                let mut sim_power: Option<f64> = None;
                let old_power = power.clone();
                let old_sorted_idx = sorted_idx;

                // discharge bound: the connector can absorb the allocated power
                // plus its cap, the station its cap plus current power
                let ts = &timesteps[v2g_ts_idx];
                let gc_discharge_limit = ts.power - 2.0 * ts.max_power;
                let (cs_max, cs_current) = {
                    let cs = &world.charging_stations[&cs_id];
                    (cs.max_power, cs.current_power)
                };
                let cs_discharge_limit = -(cs_max + cs_current);
                let p = (-vt.discharge_curve.max_power)
                    .max(gc_discharge_limit)
                    .max(cs_discharge_limit)
                    .min(0.0);
                power[v2g_ts_idx] = p;
                if v2g_ts_idx == 0 {
                    sim_power = Some(p);
                }

                let simulate = |sim: &mut crate::devices::Battery, power: &[f64]| {
                    for &cur in power {
                        if cur > 0.0 {
                            sim.load(ctx.dt_hours, cur, 1.0);
                        } else if cur < 0.0 {
                            sim.unload(ctx.dt_hours, Some(-cur), vt.discharge_limit);
                        }
                    }
                };
                sim_battery.soc = world.vehicles[v_id].battery.soc;
                simulate(&mut sim_battery, &power);

                // try to offset the discharge with cheaper charging
                let charging_ts: Vec<(f64, usize)> =
                    sorted_ts[old_sorted_idx..=v2g_sorted_idx.min(sorted_ts.len() - 1)].to_vec();
                let mut offset = false;
                for (cost, ts_idx) in charging_ts {
                    if desired_soc - sim_battery.soc <= 0.0 {
                        offset = true;
                        break;
                    }
                    if v2g_cost <= cost {
                        continue;
                    }
                    let extra = {
                        let vehicle = &world.vehicles[v_id];
                        let cs = &world.charging_stations[&cs_id];
                        clamp_power(timesteps[ts_idx].power - power[ts_idx], vehicle, cs)
                    };
                    power[ts_idx] += extra;
                    sorted_idx += 1;
                    if ts_idx == 0 {
                        sim_power = Some(extra);
                    }
                    sim_battery.soc = world.vehicles[v_id].battery.soc;
                    simulate(&mut sim_battery, &power);
                }
                if !offset {
                    // could not recover the energy before departure: roll back
                    power = old_power;
                    sorted_idx = old_sorted_idx;
                    continue;
                }

                if let Some(sp) = sim_power {
                    let flow_power = if sp > 0.0 {
                        world
                            .vehicles
                            .get_mut(v_id)
                            .map(|v| v.battery.load(ctx.dt_hours, sp, 1.0).avg_power)
                            .unwrap_or(0.0)
                    } else if sp < 0.0 {
                        discharging_stations.push(cs_id.clone());
                        -world
                            .vehicles
                            .get_mut(v_id)
                            .map(|v| {
                                v.battery
                                    .unload(ctx.dt_hours, Some(-sp), vt.discharge_limit)
                                    .avg_power
                            })
                            .unwrap_or(0.0)
                    } else {
                        0.0
                    };
                    if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                        let total = gc.add_load(&cs_id, flow_power);
                        allocation.record(&cs_id, total);
                    }
                    if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                        cs.current_power += flow_power;
                    }
                    break;
                }
            }

            // subtract this vehicle's plan from the predicted available power
            sim_battery.soc = original_soc;
            for (ts_idx, &cur) in power.iter().enumerate() {
                if cur > 0.0 {
                    let avg = sim_battery.load(ctx.dt_hours, cur, 1.0).avg_power;
                    timesteps[ts_idx].power -= avg;
                } else if cur < 0.0 {
                    let avg = sim_battery
                        .unload(ctx.dt_hours, Some(-cur), vt.discharge_limit)
                        .avg_power;
                    timesteps[ts_idx].power += avg;
                }
            }
        }

        // ---------- distribute surplus ---------- //
        let discharging: Vec<&str> = discharging_stations.iter().map(String::as_str).collect();
        for (v_id, _) in &vehicles {
            let Some(cs_id) = world.vehicles[v_id].connected_charging_station.clone() else {
                continue;
            };
            if discharging_stations.contains(&cs_id) {
                continue;
            }
            let avail_power = world.grid_connectors[gc_id].current_load_excluding(&discharging);
            if avail_power < -EPS {
                let p = {
                    let vehicle = &world.vehicles[v_id];
                    let cs = &world.charging_stations[&cs_id];
                    clamp_power(-avail_power, vehicle, cs)
                };
                let flow = match world.vehicles.get_mut(v_id) {
                    Some(v) => v.battery.load(ctx.dt_hours, p, 1.0),
                    None => continue,
                };
                if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                    let total = gc.add_load(&cs_id, flow.avg_power);
                    allocation.record(&cs_id, total);
                }
                if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                    cs.current_power += flow.avg_power;
                }
            }
        }

        // leading run of timesteps below the price threshold
        let num_cheap_ts = timesteps
            .iter()
            .take_while(|ts| ts.price <= self.price_threshold)
            .count();

        // ---------- stationary batteries ---------- //
        let bat_ids: Vec<String> = world
            .batteries
            .iter()
            .filter(|(_, b)| b.parent == gc_id)
            .map(|(id, _)| id.clone())
            .collect();
        for b_id in bat_ids {
            let discharging: Vec<&str> = discharging_stations.iter().map(String::as_str).collect();
            let avail_power = world.grid_connectors[gc_id].current_load_excluding(&discharging);
            let min_charging_power = world.batteries[&b_id].min_charging_power;
            let gc_cur_max = world.grid_connectors[gc_id].cur_max_power;

            let Some(bat) = world.batteries.get_mut(&b_id) else {
                continue;
            };
            let battery = &mut bat.battery;
            let old_soc = battery.soc;

            // default: store surplus; cheap timesteps may fill the battery
            let mut bat_power = (-avail_power).max(0.0);
            for i in 0..num_cheap_ts {
                let mut p = timesteps[i].power;
                if p < min_charging_power {
                    p = 0.0;
                }
                battery.load(ctx.dt_hours, p, 1.0);
                if i == 0 {
                    bat_power = p;
                }
            }
            if battery.soc > 1.0 - EPS && num_cheap_ts > 0 {
                // filled too fast: balance over the cheap timesteps
                let mut min_power = 0.0;
                let mut max_power = gc_cur_max;
                bat_power = 0.0;
                while max_power - min_power > EPS {
                    let probe = (min_power + max_power) / 2.0;
                    battery.soc = old_soc;
                    for i in 0..num_cheap_ts {
                        let mut p = timesteps[i].power.min(probe);
                        if p < min_charging_power {
                            p = 0.0;
                        }
                        battery.load(ctx.dt_hours, p, 1.0);
                        if i == 0 {
                            bat_power = p;
                        }
                    }
                    if battery.soc > 1.0 - EPS {
                        max_power = probe;
                    } else {
                        min_power = probe;
                    }
                }
            }

            battery.soc = old_soc;
            let avg = battery.load(ctx.dt_hours, bat_power, 1.0).avg_power;
            let has_charge = battery.soc > 0.0;
            if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                gc.add_load(&b_id, avg);
            }

            if avail_power > 0.0 && num_cheap_ts == 0 && has_charge {
                // expensive interval: support the connector instead
                let (gc_max, gc_load) = {
                    let gc = &world.grid_connectors[gc_id];
                    (gc.max_power, gc.current_load())
                };
                let support = avail_power.min(gc_max + gc_load);
                let avg = world
                    .batteries
                    .get_mut(&b_id)
                    .map(|b| b.battery.unload(ctx.dt_hours, Some(support), 0.0).avg_power)
                    .unwrap_or(0.0);
                if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                    gc.add_load(&b_id, -avg);
                }
                discharging_stations.push(b_id.clone());
            }
        }
    }
}

impl Strategy for BalancedMarket {
    fn name(&self) -> &'static str {
        "balanced_market"
    }

    fn step(&mut self, world: &mut World, ctx: &StepContext) -> Result<Allocation, SimError> {
        let mut allocation = Allocation::default();
        reset_station_power(world);
        let gc_ids: Vec<String> = world.grid_connectors.keys().cloned().collect();
        for gc_id in gc_ids {
            self.step_gc(world, ctx, &gc_id, &mut allocation);
        }
        Ok(allocation)
    }
}
