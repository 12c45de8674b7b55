//! Minimum constant power to reach the desired SoC by departure.

use crate::config::SimOptions;
use crate::error::SimError;
use crate::sim::types::{StepContext, World};
use crate::util::{EPS, ITERATIONS};

use super::{
    available_battery_power, clamp_power, distribute_surplus, reset_station_power,
    timesteps_until_departure, update_batteries, Allocation, Strategy,
};

/// Charges each vehicle with the smallest constant power that still reaches
/// its desired SoC by the estimated departure, found by binary search over
/// the iterative battery integrator. Vehicles without a known departure (or
/// past it) charge greedy; low prices switch to opportunistic full charging.
#[derive(Debug)]
pub struct Balanced {
    price_threshold: f64,
}

impl Balanced {
    pub fn new(options: &SimOptions) -> Self {
        Self {
            price_threshold: options.strategy.price_threshold,
        }
    }

    /// Minimum constant power charging `delta_soc` within `standing_hours`.
    ///
    /// The search keeps halving until the bracket is below EPS and finishes
    /// on the safe side (slightly too much rather than slightly too little),
    /// running at least [`ITERATIONS`] rounds.
    fn minimum_power(
        vehicle: &crate::devices::Vehicle,
        standing_hours: f64,
        mut min_power: f64,
        mut max_power: f64,
    ) -> f64 {
        let delta_soc = vehicle.delta_soc();
        let mut power = 0.0;
        let mut idx = 0;
        let mut safe = false;
        while (idx < ITERATIONS || !safe) && max_power - min_power > EPS {
            idx += 1;
            power = (max_power + min_power) / 2.0;
            let mut sim_battery = vehicle.battery.clone();
            let charged_soc = sim_battery.load_iterative(standing_hours, power).soc_delta;
            if delta_soc - charged_soc > EPS {
                // not enough
                safe = false;
                min_power = power;
            } else {
                safe = true;
                max_power = power;
            }
        }
        power
    }
}

impl Strategy for Balanced {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn step(&mut self, world: &mut World, ctx: &StepContext) -> Result<Allocation, SimError> {
        let mut avail_bat_power = available_battery_power(world, ctx.dt_hours);
        let mut allocation = Allocation::default();
        reset_station_power(world);

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

            let gc_power_left = gc.cur_max_power - gc.current_load();
            let bat_assist = avail_bat_power.get(&gc_id).copied().unwrap_or(0.0);
            let cheap = gc.unit_price() <= self.price_threshold;
            let vehicle = &world.vehicles[&v_id];
            let delta_soc = vehicle.delta_soc();

            let mut power = 0.0;
            let mut bat_power_used = false;
            if cheap {
                power = clamp_power(gc_power_left, vehicle, cs);
            } else if delta_soc > EPS {
                bat_power_used = true;
                let min_power = vehicle.vehicle_type.min_charging_power.max(cs.min_power);
                let max_power = (gc_power_left + bat_assist)
                    .min(vehicle.vehicle_type.charging_curve.max_power);
                let max_power = clamp_power(max_power, vehicle, cs);
                let timesteps = timesteps_until_departure(vehicle, ctx);
                if timesteps > 0 {
                    let standing_hours = timesteps as f64 * ctx.dt_hours;
                    power = Self::minimum_power(vehicle, standing_hours, min_power, max_power);
                } else {
                    // past estimated departure but still below desired: greedy
                    power = max_power;
                }
            }

            let flow = match world.vehicles.get_mut(&v_id) {
                Some(v) => v.battery.load(ctx.dt_hours, power, 1.0),
                None => continue,
            };
            let total = match world.grid_connectors.get_mut(&gc_id) {
                Some(gc) => gc.add_load(&cs_id, flow.avg_power),
                None => continue,
            };
            if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                cs.current_power += flow.avg_power;
            }
            if bat_power_used {
                if let Some(avail) = avail_bat_power.get_mut(&gc_id) {
                    *avail = (*avail - flow.avg_power).max(0.0);
                }
            }
            allocation.record(&cs_id, total);
        }

        distribute_surplus(world, ctx, self.price_threshold, &mut allocation.commands);
        update_batteries(world, ctx, self.price_threshold);

        Ok(allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{ChargingCurve, ChargingStation, GridConnector, Vehicle, VehicleType};
    use crate::util::Cost;
    use chrono::DateTime;

    fn ctx() -> StepContext {
        StepContext {
            step: 0,
            current_time: DateTime::parse_from_rfc3339("2020-01-01T00:00:00+01:00").unwrap(),
            interval_min: 15,
            dt_hours: 0.25,
            ts_per_hour: 4.0,
            stop_time: DateTime::parse_from_rfc3339("2020-01-02T00:00:00+01:00").unwrap(),
        }
    }

    fn world_with_vehicle(soc: f64, desired: f64, departure: &str) -> World {
        let mut world = World::default();
        let mut gc = GridConnector::new(100.0);
        gc.cost = Some(Cost::Fixed { value: 0.3 });
        world.grid_connectors.insert("GC1".into(), gc);
        world
            .charging_stations
            .insert("CS1".into(), ChargingStation::new("GC1", 11.0, 0.0));
        let vt = VehicleType::new(
            "sprinter",
            50.0,
            ChargingCurve::flat(11.0),
            0.0,
            0.95,
            false,
            0.5,
            0.5,
            None,
        );
        let mut v = Vehicle::new(vt, soc, desired);
        v.connected_charging_station = Some("CS1".into());
        v.estimated_time_of_departure = Some(DateTime::parse_from_rfc3339(departure).unwrap());
        world.vehicles.insert("v1".into(), v);
        world
    }

    #[test]
    fn picks_minimum_power_for_standing_time() {
        // 0.2 -> 0.8 over 6 h: 30 kWh stored needs 30 / (6 * 0.95) = 5.263 kW
        let mut world = world_with_vehicle(0.2, 0.8, "2020-01-01T06:00:00+01:00");
        let mut strategy = Balanced {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        let power = allocation.commands["CS1"];
        let expected = 0.6 * 50.0 / (6.0 * 0.95);
        assert!(
            (power - expected).abs() < 0.01,
            "expected ~{expected:.3} kW, got {power:.3}"
        );
    }

    #[test]
    fn reaches_desired_soc_by_departure() {
        let mut world = world_with_vehicle(0.2, 0.8, "2020-01-01T06:00:00+01:00");
        let mut strategy = Balanced {
            price_threshold: 0.0,
        };
        // run the 24 steps of the standing time
        let base = ctx();
        for step in 0..24 {
            let mut c = base.clone();
            c.step = step;
            c.current_time = base.current_time + chrono::Duration::minutes(15 * step as i64);
            strategy.step(&mut world, &c).unwrap();
        }
        let soc = world.vehicles["v1"].battery.soc;
        assert!(
            (soc - 0.8).abs() < 1e-3,
            "vehicle should reach desired SoC, got {soc}"
        );
    }

    #[test]
    fn never_exceeds_greedy_requirement() {
        // plenty of standing time: balanced power must stay below station max
        let mut world = world_with_vehicle(0.5, 0.8, "2020-01-01T12:00:00+01:00");
        let mut strategy = Balanced {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!(allocation.commands["CS1"] < 11.0 / 2.0);
    }

    #[test]
    fn charges_greedy_without_departure() {
        let mut world = world_with_vehicle(0.5, 0.8, "2020-01-01T06:00:00+01:00");
        world.vehicles.get_mut("v1").unwrap().estimated_time_of_departure = None;
        let mut strategy = Balanced {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!((allocation.commands["CS1"] - 11.0).abs() < 1e-6);
    }

    #[test]
    fn sated_vehicle_gets_no_power() {
        let mut world = world_with_vehicle(0.8, 0.8, "2020-01-01T06:00:00+01:00");
        let mut strategy = Balanced {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!(allocation.commands["CS1"].abs() < 1e-9);
    }
}
