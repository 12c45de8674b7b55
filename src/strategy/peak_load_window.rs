//! Avoiding grid draw inside high-load time windows.

use std::collections::BTreeMap;
use std::fs;

use log::warn;

use crate::config::SimOptions;
use crate::error::SimError;
use crate::sim::event::{EventKind, EventQueue};
use crate::sim::types::{SimConfig, StepContext, World};
use crate::util::{within_time_window, TimeWindows, EPS, ITERATIONS};

use super::{clamp_power, reset_station_power, Allocation, Strategy};

const MAX_SEARCH_ROUNDS: usize = ITERATIONS * 5;

/// Predicted connector state for one future interval.
#[derive(Debug, Clone)]
struct PlwTs {
    /// Predicted total load (fixed plus generation plus planned charging).
    load: f64,
    max_power: f64,
    window: bool,
}

/// Keeps grid draw inside peak load windows below the historical peak of the
/// fixed load. Vehicles charge balanced outside windows; only what the
/// departures still require is drawn inside, peak-shaved by binary search.
/// Stationary batteries discharge inside windows and refill outside.
///
/// The window table (grid operator -> season -> voltage level -> daily
/// windows) comes from a separate JSON config; fixed load and generation
/// events are treated with perfect foresight.
#[derive(Debug)]
pub struct PeakLoadWindow {
    time_windows: TimeWindows,
    /// Highest predicted in-window fixed load per grid connector.
    peak_power: BTreeMap<String, f64>,
}

impl PeakLoadWindow {
    pub fn new(
        options: &SimOptions,
        config: &SimConfig,
        world: &World,
        queue: &mut EventQueue,
    ) -> Result<Self, SimError> {
        let Some(path) = options.strategy.time_windows.as_ref() else {
            return Err(SimError::Strategy(
                "peak_load_window needs a time window table (strategy.time_windows)".into(),
            ));
        };
        let raw = fs::read_to_string(path)?;
        let time_windows: TimeWindows = serde_json::from_str(&raw)
            .map_err(|e| SimError::Strategy(format!("invalid time window table: {e}")))?;

        // grid and local load events are known from the start
        let start = config.start_time;
        queue.adjust_signal_times(|event| match &event.kind {
            EventKind::FixedLoad { .. }
            | EventKind::LocalGeneration { .. }
            | EventKind::GridSignal { .. } => Some(event.signal_time.min(start)),
            _ => None,
        });

        // replay all known events to find the in-window peak fixed load
        let mut peak_power: BTreeMap<String, f64> = BTreeMap::new();
        let mut current_loads: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (gc_id, gc) in &world.grid_connectors {
            if gc.voltage_level.is_none() {
                warn!("grid connector {gc_id} has no voltage level, assuming MV");
            }
            peak_power.insert(gc_id.clone(), 0.0);
            current_loads.insert(gc_id.clone(), gc.current_loads.clone());
        }

        let mut event_idx = 0;
        let pending = queue.pending().to_vec();
        for step in 0..config.n_intervals {
            let cur_time = config.time_at(step);
            while event_idx < pending.len() {
                let event = &pending[event_idx];
                if event.start_time > cur_time {
                    break;
                }
                event_idx += 1;
                match &event.kind {
                    EventKind::FixedLoad { gc_id, name, value } => {
                        if let Some(loads) = current_loads.get_mut(gc_id) {
                            loads.insert(name.clone(), *value);
                        }
                    }
                    EventKind::LocalGeneration { gc_id, name, value } => {
                        if let Some(loads) = current_loads.get_mut(gc_id) {
                            loads.insert(name.clone(), -*value);
                        }
                    }
                    _ => {}
                }
            }
            for (gc_id, gc) in &world.grid_connectors {
                let level = gc.voltage_level.as_deref().unwrap_or("MV");
                let in_window = within_time_window(
                    cur_time,
                    time_windows.get(&gc.grid_operator),
                    Some(level),
                )
                .unwrap_or(false);
                if in_window {
                    let load: f64 = current_loads[gc_id].values().sum();
                    let peak = peak_power.entry(gc_id.clone()).or_insert(0.0);
                    if load > *peak {
                        *peak = load;
                    }
                }
            }
        }

        Ok(Self {
            time_windows,
            peak_power,
        })
    }

    fn in_window(&self, world: &World, gc_id: &str, time: chrono::DateTime<chrono::FixedOffset>) -> bool {
        let gc = &world.grid_connectors[gc_id];
        let level = gc.voltage_level.as_deref().unwrap_or("MV");
        within_time_window(time, self.time_windows.get(&gc.grid_operator), Some(level))
            .unwrap_or(false)
    }

    /// Event-based load prediction over the given number of intervals.
    fn predict(&self, world: &World, ctx: &StepContext, gc_id: &str, n_ahead: usize) -> Vec<PlwTs> {
        let gc = &world.grid_connectors[gc_id];
        let mut cur_loads = gc.current_loads.clone();
        let mut cur_max_power = gc.cur_max_power;
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
                    EventKind::FixedLoad { gc_id: id, name, value } if id == gc_id => {
                        cur_loads.insert(name.clone(), *value);
                    }
                    EventKind::LocalGeneration { gc_id: id, name, value } if id == gc_id => {
                        cur_loads.insert(name.clone(), -*value);
                    }
                    EventKind::GridSignal {
                        gc_id: id,
                        max_power: Some(p),
                        ..
                    } if id == gc_id => {
                        cur_max_power = gc.max_power.min(*p);
                    }
                    _ => {}
                }
            }
            timesteps.push(PlwTs {
                load: cur_loads.values().sum(),
                max_power: cur_max_power,
                window: self.in_window(world, gc_id, cur_time),
            });
        }
        timesteps
    }

    #[allow(clippy::too_many_lines)]
    fn step_gc(
        &mut self,
        world: &mut World,
        ctx: &StepContext,
        gc_id: &str,
        allocation: &mut Allocation,
    ) {
        let now_in_window = self.in_window(world, gc_id, ctx.current_time);
        if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
            gc.window = Some(now_in_window);
        }

        // connected vehicles still in need, and the longest standing time
        let mut vehicle_ids: Vec<String> = Vec::new();
        let mut max_standing = ctx.current_time;
        for (v_id, vehicle) in &world.vehicles {
            let Some(cs_id) = vehicle.connected_charging_station.as_deref() else {
                continue;
            };
            let Some(cs) = world.charging_stations.get(cs_id) else {
                continue;
            };
            if cs.parent != gc_id {
                continue;
            }
            vehicle_ids.push(v_id.clone());
            match vehicle.estimated_time_of_departure {
                Some(departure)
                    if departure > ctx.current_time
                        && vehicle.desired_soc - vehicle.battery.soc > EPS =>
                {
                    max_standing = max_standing.max(departure);
                }
                _ => {}
            }
        }

        let mut timesteps_ahead =
            ((max_standing - ctx.current_time).num_minutes() as f64 / ctx.interval_min as f64)
                .ceil() as usize;

        let has_batteries = world.batteries.values().any(|b| b.parent == gc_id);
        let mut ts_until_window_change = 1usize;
        if has_batteries {
            // look for the next window flip (or the end of the scenario)
            let mut cur_time = ctx.current_time + ctx.interval();
            while self.in_window(world, gc_id, cur_time) == now_in_window
                && cur_time <= ctx.stop_time
            {
                cur_time += ctx.interval();
                ts_until_window_change += 1;
            }
            if now_in_window {
                timesteps_ahead = timesteps_ahead.max(ts_until_window_change);
            }
        }
        if timesteps_ahead == 0 {
            timesteps_ahead = 1;
        }

        let mut timesteps = self.predict(world, ctx, gc_id, timesteps_ahead);
        let mut peak_power = self.peak_power.get(gc_id).copied().unwrap_or(0.0);

        // longest-standing last: shorter standing times have less flexibility
        vehicle_ids.sort_by(|a, b| {
            world.vehicles[a]
                .estimated_time_of_departure
                .cmp(&world.vehicles[b].estimated_time_of_departure)
                .then(a.cmp(b))
        });

        let mut planned_now: BTreeMap<String, f64> = BTreeMap::new();
        for v_id in &vehicle_ids {
            let Some(cs_id) = world.vehicles[v_id].connected_charging_station.clone() else {
                continue;
            };
            let old_soc = world.vehicles[v_id].battery.soc;
            let departure = match world.vehicles[v_id].estimated_time_of_departure {
                Some(d) if d > ctx.current_time => d,
                // should have left: assume the next interval
                _ => ctx.current_time + ctx.interval(),
            };
            let depart_idx = (((departure - ctx.current_time).num_minutes() as f64
                / ctx.interval_min as f64)
                .ceil() as usize)
                .min(timesteps.len());
            let efficiency = world.vehicles[v_id].battery.efficiency;

            let mut power_levels = vec![0.0_f64; depart_idx];
            let mut schedule_now = 0.0;

            // pass 1: balanced over the out-of-window timesteps
            let mut num_outside = timesteps[..depart_idx]
                .iter()
                .filter(|ts| !ts.window)
                .count();
            for ts_idx in 0..depart_idx {
                if timesteps[ts_idx].window {
                    continue;
                }
                let energy_needed = world.vehicles[v_id].energy_needed(false);
                let power = energy_needed * ctx.ts_per_hour / num_outside as f64 / efficiency;
                let p = {
                    let vehicle = &world.vehicles[v_id];
                    let cs = &world.charging_stations[&cs_id];
                    let ts = &timesteps[ts_idx];
                    clamp_power(power, vehicle, cs)
                        .min(ts.max_power - ts.load)
                        .max(0.0)
                };
                let flow = world
                    .vehicles
                    .get_mut(v_id)
                    .map(|v| v.battery.load(ctx.dt_hours, p, 1.0))
                    .unwrap_or_default();
                power_levels[ts_idx] = flow.avg_power;
                num_outside -= 1;
                if ts_idx == 0 {
                    schedule_now = p;
                }
            }

            // pass 2: greedy inside windows up to the historical peak
            let mut needs_charging = {
                let v = &world.vehicles[v_id];
                v.desired_soc - v.battery.soc > EPS
            };
            if needs_charging {
                if let Some(v) = world.vehicles.get_mut(v_id) {
                    v.battery.soc = old_soc;
                }
                for ts_idx in 0..depart_idx {
                    if !timesteps[ts_idx].window {
                        let p = power_levels[ts_idx];
                        let flow = world
                            .vehicles
                            .get_mut(v_id)
                            .map(|v| v.battery.load(ctx.dt_hours, p, 1.0))
                            .unwrap_or_default();
                        power_levels[ts_idx] = flow.avg_power;
                    } else {
                        let energy_needed = world.vehicles[v_id].energy_needed(false);
                        let p = {
                            let vehicle = &world.vehicles[v_id];
                            let cs = &world.charging_stations[&cs_id];
                            let ts = &timesteps[ts_idx];
                            let want = (energy_needed * ctx.ts_per_hour / efficiency)
                                .min(peak_power - ts.load);
                            clamp_power(want.max(0.0), vehicle, cs)
                                .min(ts.max_power - ts.load)
                                .max(0.0)
                        };
                        let flow = world
                            .vehicles
                            .get_mut(v_id)
                            .map(|v| v.battery.load(ctx.dt_hours, p, 1.0))
                            .unwrap_or_default();
                        power_levels[ts_idx] = flow.avg_power;
                        if ts_idx == 0 {
                            schedule_now = p;
                        }
                    }
                }
                needs_charging = {
                    let v = &world.vehicles[v_id];
                    v.desired_soc - v.battery.soc > EPS
                };
            }

            // pass 3: raise the in-window ceiling as little as possible
            if needs_charging {
                let power_levels_copy = power_levels.clone();
                let mut min_power = timesteps[..depart_idx]
                    .iter()
                    .map(|ts| ts.load)
                    .fold(f64::INFINITY, f64::min);
                let mut max_power = timesteps[..depart_idx]
                    .iter()
                    .map(|ts| ts.max_power)
                    .fold(0.0_f64, f64::max);
                let mut rounds = 0;
                while max_power - min_power > EPS {
                    rounds += 1;
                    if rounds > MAX_SEARCH_ROUNDS {
                        warn!("peak shaving search for {v_id} did not converge");
                        break;
                    }
                    if let Some(v) = world.vehicles.get_mut(v_id) {
                        v.battery.soc = old_soc;
                    }
                    let target_power = (max_power + min_power) / 2.0;
                    for ts_idx in 0..depart_idx {
                        if !timesteps[ts_idx].window {
                            let p = power_levels_copy[ts_idx];
                            let flow = world
                                .vehicles
                                .get_mut(v_id)
                                .map(|v| v.battery.load(ctx.dt_hours, p, 1.0))
                                .unwrap_or_default();
                            power_levels[ts_idx] = flow.avg_power;
                        } else {
                            let p = {
                                let vehicle = &world.vehicles[v_id];
                                let cs = &world.charging_stations[&cs_id];
                                let ts = &timesteps[ts_idx];
                                let want = (target_power - ts.load).max(0.0);
                                clamp_power(want, vehicle, cs)
                                    .min(ts.max_power - ts.load)
                                    .max(0.0)
                            };
                            let flow = world
                                .vehicles
                                .get_mut(v_id)
                                .map(|v| v.battery.load(ctx.dt_hours, p, 1.0))
                                .unwrap_or_default();
                            power_levels[ts_idx] = flow.avg_power;
                            if ts_idx == 0 {
                                schedule_now = p;
                            }
                        }
                    }
                    let charged = {
                        let v = &world.vehicles[v_id];
                        v.desired_soc - v.battery.soc < EPS
                    };
                    if charged {
                        max_power = target_power;
                    } else {
                        min_power = target_power;
                    }
                }
            }

            // book the plan into the prediction, adjust the peak prognosis
            for ts_idx in 0..depart_idx {
                timesteps[ts_idx].load += power_levels[ts_idx];
                if timesteps[ts_idx].window && timesteps[ts_idx].load - peak_power > EPS {
                    peak_power = timesteps[ts_idx].load;
                }
            }
            planned_now.insert(v_id.clone(), schedule_now);

            // revert; real charging happens below with surplus applied
            if let Some(v) = world.vehicles.get_mut(v_id) {
                v.battery.soc = old_soc;
                v.schedule = Some(schedule_now);
            }
        }

        // apply planned power plus any surplus
        let surplus = timesteps.first().map_or(0.0, |ts| ts.load.min(0.0));
        for v_id in &vehicle_ids {
            let mut power = planned_now.get(v_id).copied().unwrap_or(0.0) - surplus;
            let Some(cs_id) = world.vehicles[v_id].connected_charging_station.clone() else {
                continue;
            };
            if power <= 0.0 {
                continue;
            }
            power = {
                let vehicle = &world.vehicles[v_id];
                let cs = &world.charging_stations[&cs_id];
                clamp_power(power, vehicle, cs)
            };
            let flow = match world.vehicles.get_mut(v_id) {
                Some(v) => v.battery.load(ctx.dt_hours, power, 1.0),
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

        // stationary batteries: shave inside windows, refill outside
        let bat_ids: Vec<String> = world
            .batteries
            .iter()
            .filter(|(_, b)| b.parent == gc_id)
            .map(|(id, _)| id.clone())
            .collect();
        for b_id in bat_ids {
            let gc_load = world.grid_connectors[gc_id].current_load();
            let gc_max = world.grid_connectors[gc_id].max_power;
            let min_charging = world.batteries[&b_id].min_charging_power;
            let Some(bat) = world.batteries.get_mut(&b_id) else {
                continue;
            };
            let delta = if now_in_window {
                let over_peak = gc_load - peak_power;
                if over_peak >= min_charging {
                    // above the peak: discharge the difference
                    -bat.battery
                        .unload(ctx.dt_hours, Some(over_peak), 0.0)
                        .avg_power
                } else if over_peak <= -min_charging {
                    // below the peak: room to charge without raising it
                    bat.battery.load(ctx.dt_hours, -over_peak, 1.0).avg_power
                } else {
                    0.0
                }
            } else {
                // balanced refill until the window starts
                let energy_needed = (1.0 - bat.battery.soc) * bat.battery.capacity;
                let p = energy_needed * ctx.ts_per_hour
                    / bat.battery.efficiency
                    / ts_until_window_change as f64;
                let p = p.min(gc_max - gc_load);
                if p >= min_charging {
                    bat.battery.load(ctx.dt_hours, p, 1.0).avg_power
                } else {
                    0.0
                }
            };
            if let Some(gc) = world.grid_connectors.get_mut(gc_id) {
                gc.add_load(&b_id, delta);
            }
        }

        // remember a raised peak
        if now_in_window {
            let load = world.grid_connectors[gc_id].current_load();
            let entry = self.peak_power.entry(gc_id.to_string()).or_insert(0.0);
            *entry = entry.max(peak_power).max(load);
        } else if let Some(entry) = self.peak_power.get_mut(gc_id) {
            *entry = entry.max(peak_power);
        }
    }
}

impl Strategy for PeakLoadWindow {
    fn name(&self) -> &'static str {
        "peak_load_window"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{ChargingCurve, ChargingStation, GridConnector, Vehicle, VehicleType};
    use chrono::DateTime;

    fn windows_json() -> TimeWindows {
        serde_json::from_str(
            r#"{
                "default_grid_operator": {
                    "winter": {
                        "start": "2020-01-01",
                        "end": "2020-12-31",
                        "windows": {
                            "MV": [["16:00:00", "20:00:00"]]
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    fn ctx_at(hour: i64) -> StepContext {
        let start = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+01:00").unwrap();
        StepContext {
            step: hour as usize,
            current_time: start + chrono::Duration::hours(hour),
            interval_min: 60,
            dt_hours: 1.0,
            ts_per_hour: 1.0,
            stop_time: start + chrono::Duration::hours(24),
        }
    }

    fn plw_world(soc: f64) -> World {
        let mut world = World::default();
        let mut gc = GridConnector::new(50.0);
        gc.voltage_level = Some("MV".into());
        world.grid_connectors.insert("GC1".into(), gc);
        world
            .charging_stations
            .insert("CS1".into(), ChargingStation::new("GC1", 11.0, 0.0));
        let vt = VehicleType::new(
            "car",
            50.0,
            ChargingCurve::flat(11.0),
            0.0,
            0.95,
            false,
            0.5,
            0.5,
            None,
        );
        let mut v = Vehicle::new(vt, soc, 0.8);
        v.connected_charging_station = Some("CS1".into());
        let start = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+01:00").unwrap();
        v.estimated_time_of_departure = Some(start + chrono::Duration::hours(22));
        world.vehicles.insert("v1".into(), v);
        world
    }

    fn plw(world: &World) -> PeakLoadWindow {
        let mut peak_power = BTreeMap::new();
        for gc_id in world.grid_connectors.keys() {
            peak_power.insert(gc_id.clone(), 0.0);
        }
        PeakLoadWindow {
            time_windows: windows_json(),
            peak_power,
        }
    }

    #[test]
    fn charges_balanced_outside_window() {
        let mut world = plw_world(0.2);
        let mut s = plw(&world);
        let allocation = s.step(&mut world, &ctx_at(0)).unwrap();
        let now = allocation.commands.get("CS1").copied().unwrap_or(0.0);
        // 0.6 soc = 30 kWh stored over the 18 out-of-window hours until departure
        assert!(now > 0.0);
        assert!(now < 11.0, "outside windows charging is balanced, got {now}");
    }

    #[test]
    fn avoids_drawing_inside_window() {
        let mut world = plw_world(0.5);
        let mut s = plw(&world);
        // 17:00 is inside the window, plenty of time after it until departure
        let allocation = s.step(&mut world, &ctx_at(17)).unwrap();
        let now = allocation.commands.get("CS1").copied().unwrap_or(0.0);
        assert!(
            now.abs() < 1e-6,
            "no draw inside the window when the demand fits outside, got {now}"
        );
    }

    #[test]
    fn charges_inside_window_when_unavoidable() {
        let mut world = plw_world(0.1);
        // departure right at the end of the window
        let start = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+01:00").unwrap();
        world.vehicles.get_mut("v1").unwrap().estimated_time_of_departure =
            Some(start + chrono::Duration::hours(20));
        let mut s = plw(&world);
        let allocation = s.step(&mut world, &ctx_at(17)).unwrap();
        let now = allocation.commands.get("CS1").copied().unwrap_or(0.0);
        assert!(now > 0.0, "demand that cannot wait must charge in-window");
    }
}
