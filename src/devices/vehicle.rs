//! Vehicle types and vehicle instances.

use chrono::{DateTime, FixedOffset};

use super::battery::Battery;
use super::curve::ChargingCurve;

/// Static description of a vehicle model.
#[derive(Debug, Clone)]
pub struct VehicleType {
    pub name: String,
    /// Battery capacity in kWh.
    pub capacity: f64,
    pub charging_curve: ChargingCurve,
    /// Power below which the vehicle refuses to charge (kW).
    pub min_charging_power: f64,
    pub battery_efficiency: f64,
    /// May the vehicle feed energy back into the grid?
    pub v2g: bool,
    /// Fraction of the charging curve peak usable for discharging.
    pub v2g_power_factor: f64,
    /// Minimum SoC kept while discharging.
    pub discharge_limit: f64,
    pub discharge_curve: ChargingCurve,
}

impl VehicleType {
    /// Builds a vehicle type. Without an explicit discharge curve the vehicle
    /// discharges with a flat bound of `peak * v2g_power_factor`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        capacity: f64,
        charging_curve: ChargingCurve,
        min_charging_power: f64,
        battery_efficiency: f64,
        v2g: bool,
        v2g_power_factor: f64,
        discharge_limit: f64,
        discharge_curve: Option<ChargingCurve>,
    ) -> Self {
        let discharge_curve = discharge_curve
            .unwrap_or_else(|| ChargingCurve::flat(charging_curve.max_power * v2g_power_factor));
        Self {
            name: name.into(),
            capacity,
            charging_curve,
            min_charging_power,
            battery_efficiency,
            v2g,
            v2g_power_factor,
            discharge_limit,
            discharge_curve,
        }
    }

    /// Fresh battery for a vehicle of this type.
    pub fn battery(&self, soc: f64) -> Battery {
        Battery::with_discharge_curve(
            self.capacity,
            self.charging_curve.clone(),
            self.discharge_curve.clone(),
            soc,
            self.battery_efficiency,
        )
    }
}

/// One vehicle of the fleet. Exists for the whole simulation; arrivals and
/// departures only switch the connected charging station.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub vehicle_type: VehicleType,
    pub battery: Battery,
    pub connected_charging_station: Option<String>,
    pub estimated_time_of_departure: Option<DateTime<FixedOffset>>,
    pub estimated_time_of_arrival: Option<DateTime<FixedOffset>>,
    pub desired_soc: f64,
    /// Per-interval target power from an individual schedule (kW).
    pub schedule: Option<f64>,
}

impl Vehicle {
    pub fn new(vehicle_type: VehicleType, soc: f64, desired_soc: f64) -> Self {
        let battery = vehicle_type.battery(soc);
        Self {
            vehicle_type,
            battery,
            connected_charging_station: None,
            estimated_time_of_departure: None,
            estimated_time_of_arrival: None,
            desired_soc,
            schedule: None,
        }
    }

    /// SoC still missing to the desired SoC (negative when above it).
    pub fn delta_soc(&self) -> f64 {
        self.desired_soc - self.battery.soc
    }

    /// Energy needed to reach the desired SoC, or a full battery (kWh, >= 0).
    pub fn energy_needed(&self, full: bool) -> f64 {
        let target = if full { 1.0 } else { self.desired_soc };
        (target - self.battery.soc).max(0.0) * self.battery.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_type() -> VehicleType {
        VehicleType::new(
            "golf",
            50.0,
            ChargingCurve::flat(22.0),
            0.0,
            0.95,
            true,
            0.5,
            0.5,
            None,
        )
    }

    #[test]
    fn default_discharge_curve_scales_with_power_factor() {
        let vt = test_type();
        assert_eq!(vt.discharge_curve.max_power, 11.0);
    }

    #[test]
    fn delta_soc_sign() {
        let vt = test_type();
        let mut v = Vehicle::new(vt, 0.3, 0.8);
        assert!((v.delta_soc() - 0.5).abs() < 1e-12);
        v.battery.soc = 0.9;
        assert!(v.delta_soc() < 0.0);
    }

    #[test]
    fn energy_needed_clamps_at_zero() {
        let vt = test_type();
        let mut v = Vehicle::new(vt, 0.3, 0.8);
        assert!((v.energy_needed(false) - 25.0).abs() < 1e-9);
        assert!((v.energy_needed(true) - 35.0).abs() < 1e-9);
        v.battery.soc = 0.9;
        assert_eq!(v.energy_needed(false), 0.0);
    }
}
