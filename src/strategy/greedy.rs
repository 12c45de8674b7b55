//! Uncontrolled charging with maximum power immediately after connecting.

use crate::config::SimOptions;
use crate::error::SimError;
use crate::sim::types::{StepContext, World};
use crate::util::EPS;

use super::{
    available_battery_power, clamp_power, distribute_surplus, order_vehicles,
    reset_station_power, update_batteries, Allocation, Strategy, VehicleOrder,
};

/// Charges every connected vehicle as much as station, grid connector and
/// charging curve permit until it reaches its desired SoC. Charging beyond
/// the desired SoC only happens at low prices or from surplus generation.
/// Stationary batteries follow the default policy.
#[derive(Debug)]
pub struct Greedy {
    price_threshold: f64,
}

impl Greedy {
    pub fn new(options: &SimOptions) -> Self {
        Self {
            price_threshold: options.strategy.price_threshold,
        }
    }
}

impl Strategy for Greedy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn step(&mut self, world: &mut World, ctx: &StepContext) -> Result<Allocation, SimError> {
        let avail_bat_power = available_battery_power(world, ctx.dt_hours);
        let mut allocation = Allocation::default();
        reset_station_power(world);

        let vehicle_ids = order_vehicles(
            world,
            world.vehicles.keys().cloned().collect(),
            VehicleOrder::DepartureFirst,
        );
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
            let cheap = gc.unit_price() <= self.price_threshold;
            let vehicle = &world.vehicles[&v_id];
            let delta_soc = vehicle.delta_soc();

            let (power, target_soc) = if cheap {
                // low energy price: fill up from the connector alone
                (clamp_power(gc_power_left, vehicle, cs), 1.0)
            } else if delta_soc > EPS {
                // max power, stationary batteries may assist
                let assisted = gc_power_left + avail_bat_power.get(&gc_id).copied().unwrap_or(0.0);
                (clamp_power(assisted, vehicle, cs), vehicle.desired_soc)
            } else {
                (0.0, vehicle.desired_soc)
            };

            let flow = match world.vehicles.get_mut(&v_id) {
                Some(v) => v.battery.load(ctx.dt_hours, power, target_soc),
                None => continue,
            };
            let total = match world.grid_connectors.get_mut(&gc_id) {
                Some(gc) => gc.add_load(&cs_id, flow.avg_power),
                None => continue,
            };
            if let Some(cs) = world.charging_stations.get_mut(&cs_id) {
                cs.current_power += flow.avg_power;
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

    fn world_with_vehicle(soc: f64, desired: f64, cs_power: f64, gc_power: f64) -> World {
        let mut world = World::default();
        let mut gc = GridConnector::new(gc_power);
        gc.cost = Some(Cost::Fixed { value: 0.3 });
        world.grid_connectors.insert("GC1".into(), gc);
        world
            .charging_stations
            .insert("CS1".into(), ChargingStation::new("GC1", cs_power, 0.0));
        let vt = VehicleType::new(
            "car",
            50.0,
            ChargingCurve::flat(22.0),
            0.0,
            0.95,
            false,
            0.5,
            0.5,
            None,
        );
        let mut v = Vehicle::new(vt, soc, desired);
        v.connected_charging_station = Some("CS1".into());
        world.vehicles.insert("v1".into(), v);
        world
    }

    #[test]
    fn charges_with_full_station_power() {
        let mut world = world_with_vehicle(0.5, 0.8, 22.0, 100.0);
        let mut strategy = Greedy {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        let power = allocation.commands["CS1"];
        assert!((power - 22.0).abs() < 1e-6, "expected 22 kW, got {power}");
        // soc gained: 22 kW * 0.25 h * 0.95 / 50 kWh
        let expected_soc = 0.5 + 22.0 * 0.25 * 0.95 / 50.0;
        assert!((world.vehicles["v1"].battery.soc - expected_soc).abs() < 1e-6);
    }

    #[test]
    fn stops_at_desired_soc() {
        let mut world = world_with_vehicle(0.795, 0.8, 22.0, 100.0);
        let mut strategy = Greedy {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!((world.vehicles["v1"].battery.soc - 0.8).abs() < 1e-6);
        // well below full power
        assert!(allocation.commands["CS1"] < 22.0);
    }

    #[test]
    fn respects_gc_cap() {
        let mut world = world_with_vehicle(0.1, 0.9, 22.0, 5.0);
        let mut strategy = Greedy {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!(allocation.commands["CS1"] <= 5.0 + 1e-9);
        assert!(world.grid_connectors["GC1"].current_load() <= 5.0 + 1e-9);
    }

    #[test]
    fn no_charge_above_desired_at_normal_price() {
        let mut world = world_with_vehicle(0.9, 0.8, 22.0, 100.0);
        let mut strategy = Greedy {
            price_threshold: 0.0,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!(allocation.commands["CS1"].abs() < 1e-9);
        assert!((world.vehicles["v1"].battery.soc - 0.9).abs() < 1e-12);
    }

    #[test]
    fn fills_to_full_when_cheap() {
        let mut world = world_with_vehicle(0.9, 0.8, 22.0, 100.0);
        // price 0.3 <= threshold 0.5: opportunistic charging
        let mut strategy = Greedy {
            price_threshold: 0.5,
        };
        let allocation = strategy.step(&mut world, &ctx()).unwrap();
        assert!(allocation.commands["CS1"] > 0.0);
        assert!(world.vehicles["v1"].battery.soc > 0.9);
    }
}
