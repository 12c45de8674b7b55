//! Integration tests for the greedy strategy and the engine invariants.

mod common;

use fleetsim::io::export::write_csv;

const EPS: f64 = 1e-5;

#[test]
fn single_vehicle_one_interval_soc() {
    // 22 kW for 15 min at eta 0.95 into 50 kWh: SoC 0.5 -> 0.6045
    let (result, _) = common::run_with_strategy(&common::base_scenario(1), "greedy");
    assert!(result.error.is_none());
    let soc = result.records[0].vehicle_soc["golf_0"];
    let expected = 0.5 + 22.0 * 0.25 * 0.95 / 50.0;
    assert!(
        (soc - expected).abs() < 1e-6,
        "soc {soc} != expected {expected}"
    );
}

#[test]
fn greedy_reaches_desired_and_stops() {
    let (result, _) = common::run_with_strategy(&common::base_scenario(16), "greedy");
    assert!(result.error.is_none());
    let final_soc = result.records.last().unwrap().vehicle_soc["golf_0"];
    assert!(
        (final_soc - 0.8).abs() < 1e-6,
        "greedy should stop at the desired SoC, got {final_soc}"
    );
    // once sated, no further station power
    let last_power = result.records.last().unwrap().cs_power["CS1"];
    assert!(last_power.abs() < EPS);
}

#[test]
fn two_vehicles_on_tight_connector() {
    // two cars requesting 22 kW behind a 5 kW connector: the first one is
    // served up to the cap, the second gets nothing
    let mut json = common::base_scenario(1);
    json["components"]["grid_connectors"]["GC1"]["max_power"] = 5.0.into();
    json["components"]["charging_stations"]["CS2"] =
        serde_json::json!({"parent": "GC1", "max_power": 22.0});
    json["components"]["vehicles"]["golf_1"] = serde_json::json!({
        "vehicle_type": "golf",
        "soc": 0.5,
        "desired_soc": 0.8,
        "connected_charging_station": "CS2"
    });
    let (result, _) = common::run_with_strategy(&json, "greedy");
    assert!(result.error.is_none());
    let record = &result.records[0];
    let p1 = record.cs_power["CS1"];
    let p2 = record.cs_power["CS2"];
    assert!((p1 - 5.0).abs() < EPS, "first vehicle takes the cap, got {p1}");
    assert!(p2.abs() < EPS, "second vehicle gets nothing, got {p2}");
    assert!(record.gc["GC1"].grid_power <= 5.0 + EPS);
}

#[test]
fn gc_limit_invariant_holds_every_step() {
    let mut json = common::base_scenario(8);
    json["components"]["grid_connectors"]["GC1"]["max_power"] = 10.0.into();
    let (result, _) = common::run_with_strategy(&json, "greedy");
    assert!(result.error.is_none());
    for record in &result.records {
        let gc = &record.gc["GC1"];
        assert!(
            gc.grid_power <= 10.0 + EPS || !gc.within_limit,
            "step {}: load {} over cap without being reported",
            record.step,
            gc.grid_power
        );
    }
}

#[test]
fn soc_stays_within_bounds() {
    let (result, _) = common::run_with_strategy(&common::base_scenario(24), "greedy");
    for record in &result.records {
        for (v_id, soc) in &record.vehicle_soc {
            assert!(
                (0.0..=1.0 + EPS).contains(soc),
                "step {}: {v_id} soc {soc} out of range",
                record.step
            );
        }
    }
}

#[test]
fn arrival_with_soc_delta_continues_simulation() {
    let mut json = common::base_scenario(8);
    json["components"]["vehicles"]["golf_0"]["soc"] = 0.8.into();
    json["components"]["vehicles"]["golf_0"]
        .as_object_mut()
        .unwrap()
        .remove("connected_charging_station");
    json["events"]["vehicle_events"] = serde_json::json!([{
        "signal_time": "2020-01-01T00:00:00+01:00",
        "start_time": "2020-01-01T00:30:00+01:00",
        "vehicle_id": "golf_0",
        "event_type": "arrival",
        "update": {
            "soc_delta": -0.3,
            "connected_charging_station": "CS1",
            "estimated_time_of_departure": "2020-01-01T08:00:00+01:00",
            "desired_soc": 0.8
        }
    }]);
    let (result, _) = common::run_with_strategy(&json, "greedy");
    assert!(result.error.is_none());
    // soc 0.8 - 0.3 = 0.5 at arrival (step 2), then charging resumes
    let arrival_step = &result.records[2];
    let soc = arrival_step.vehicle_soc["golf_0"];
    let expected = 0.5 + 22.0 * 0.25 * 0.95 / 50.0;
    assert!(
        (soc - expected).abs() < 1e-6,
        "soc after arrival step is {soc}, expected {expected}"
    );
}

#[test]
fn summary_reports_full_standing_time() {
    // the single vehicle stays connected for the whole run
    let (result, dt_hours) = common::run_with_strategy(&common::base_scenario(8), "greedy");
    let report = fleetsim::sim::SummaryReport::from_result(
        &result,
        dt_hours,
        &std::collections::BTreeMap::new(),
    );
    let gc = &report.gc["GC1"];
    assert!(
        (gc.standing_share - 1.0).abs() < 1e-9,
        "vehicle is connected every interval, share = {}",
        gc.standing_share
    );
    // no windows in this scenario, so no in-window split
    assert_eq!(gc.standing_in_window_share, None);
    // no PV plant: the cost breakdown nets to the plain energy cost
    assert_eq!(gc.feed_in_remuneration, 0.0);
    assert!((gc.total_cost - gc.energy_cost).abs() < 1e-12);
}

#[test]
fn identical_runs_export_identical_csv() {
    let (r1, _) = common::run_with_strategy(&common::base_scenario(24), "greedy");
    let (r2, _) = common::run_with_strategy(&common::base_scenario(24), "greedy");
    let mut buf1 = Vec::new();
    let mut buf2 = Vec::new();
    write_csv(&r1.records, &mut buf1).unwrap();
    write_csv(&r2.records, &mut buf2).unwrap();
    assert_eq!(buf1, buf2, "runs must be bitwise reproducible");
}
