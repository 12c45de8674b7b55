//! Shared scenario builders for the integration tests.

use std::path::Path;

use fleetsim::config::SimOptions;
use fleetsim::scenario::Scenario;
use fleetsim::sim::{Engine, SimResult};
use fleetsim::strategy;

/// One 50 kWh vehicle on a 22 kW station below a 100 kW connector with a
/// fixed 0.30/kWh tariff; 15-minute intervals.
pub fn base_scenario(n_intervals: usize) -> serde_json::Value {
    serde_json::json!({
        "scenario": {
            "start_time": "2020-01-01T00:00:00+01:00",
            "interval": 15,
            "n_intervals": n_intervals
        },
        "components": {
            "vehicle_types": {
                "golf": {
                    "capacity": 50.0,
                    "charging_curve": [[0.0, 22.0], [1.0, 22.0]]
                }
            },
            "vehicles": {
                "golf_0": {
                    "vehicle_type": "golf",
                    "soc": 0.5,
                    "desired_soc": 0.8,
                    "connected_charging_station": "CS1"
                }
            },
            "charging_stations": {
                "CS1": {"parent": "GC1", "max_power": 22.0}
            },
            "grid_connectors": {
                "GC1": {"max_power": 100.0, "cost": {"type": "fixed", "value": 0.3}}
            }
        },
        "events": {}
    })
}

/// Loads the scenario value and runs it with the named strategy at default
/// options. Returns the result and the interval length in hours.
pub fn run_with_strategy(value: &serde_json::Value, strategy_name: &str) -> (SimResult, f64) {
    run_with_options(
        value,
        SimOptions::default_with_strategy(strategy_name, None),
    )
}

pub fn run_with_options(value: &serde_json::Value, options: SimOptions) -> (SimResult, f64) {
    let scenario = Scenario::from_json_str(&value.to_string(), Path::new("."))
        .expect("scenario should load");
    let Scenario {
        config,
        world,
        events: mut queue,
    } = scenario;
    let strat = strategy::build(&world, &mut queue, &options, &config)
        .expect("strategy should build");
    let dt_hours = config.dt_hours();
    let engine = Engine::new(config, world, queue, strat, &options);
    (engine.run(), dt_hours)
}
