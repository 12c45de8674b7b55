//! Curve-limited energy store shared by vehicles and stationary batteries.

use super::curve::ChargingCurve;
use crate::util::EPS;

/// Capacity value standing in for an unlimited sink/source.
///
/// Large enough that the SoC barely moves over any scenario; the closed-form
/// segment solution stays numerically stable through `exp_m1`.
pub const UNLIMITED_CAPACITY: f64 = 18_446_744_073_709_551_616.0; // 2^64

/// Result of one (dis)charge operation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PowerFlow {
    /// Average power over the whole requested duration, grid side (kW).
    pub avg_power: f64,
    /// Magnitude of the SoC change.
    pub soc_delta: f64,
}

impl PowerFlow {
    const NONE: PowerFlow = PowerFlow {
        avg_power: 0.0,
        soc_delta: 0.0,
    };
}

/// Battery with a SoC-dependent charging power bound and a flat discharge bound.
///
/// Charging solves the initial value problem of the clamped charging curve
/// segment by segment in closed form: constant-power segments move the SoC
/// linearly, sloped segments follow the exponential solution of
/// `d soc/dt = (m * soc + n) / capacity`. Energy entering storage is the
/// drawn energy times `efficiency`; energy delivered on discharge is the
/// stored energy times `efficiency`.
#[derive(Debug, Clone)]
pub struct Battery {
    /// Energy capacity in kWh ([`UNLIMITED_CAPACITY`] for unlimited stores).
    pub capacity: f64,
    /// State of charge, 0 to 1.
    pub soc: f64,
    pub charging_curve: ChargingCurve,
    pub discharge_curve: ChargingCurve,
    /// One-way efficiency, applied on charge and on discharge.
    pub efficiency: f64,
}

impl Battery {
    /// Battery discharging with the charging curve's peak power.
    pub fn new(capacity: f64, charging_curve: ChargingCurve, soc: f64, efficiency: f64) -> Self {
        let discharge_curve = ChargingCurve::flat(charging_curve.max_power);
        Self::with_discharge_curve(capacity, charging_curve, discharge_curve, soc, efficiency)
    }

    pub fn with_discharge_curve(
        capacity: f64,
        charging_curve: ChargingCurve,
        discharge_curve: ChargingCurve,
        soc: f64,
        efficiency: f64,
    ) -> Self {
        Self {
            capacity,
            soc,
            charging_curve,
            discharge_curve,
            efficiency,
        }
    }

    /// Charges for `dt_hours` drawing at most `max_power` from the grid,
    /// stopping at `target_soc`. Returns the average drawn power.
    ///
    /// The charging duration is the smaller of `dt_hours` and the closed-form
    /// time to the target under the clamped curve; the reached SoC follows
    /// from the curve's forward integration, so no sub-stepping is involved.
    pub fn load(&mut self, dt_hours: f64, max_power: f64, target_soc: f64) -> PowerFlow {
        if dt_hours <= 0.0 || max_power <= 0.0 || target_soc - self.soc <= EPS {
            return PowerFlow::NONE;
        }
        let target = target_soc.min(1.0);
        let clamped = self.charging_curve.clamped(max_power);

        let charge_hours = clamped
            .time_to_reach(self.soc, target, self.capacity, self.efficiency)
            .min(dt_hours);
        if charge_hours <= 0.0 {
            return PowerFlow::NONE;
        }
        let new_soc = clamped
            .integrate_forward(self.soc, charge_hours, self.capacity, self.efficiency)
            .min(target);

        let soc_delta = new_soc - self.soc;
        self.soc = new_soc;
        PowerFlow {
            // energy drawn from the grid before conversion losses
            avg_power: soc_delta * self.capacity / self.efficiency / dt_hours,
            soc_delta,
        }
    }

    /// Discharges for `dt_hours` delivering at most `max_power` to the grid,
    /// refusing to go below `target_soc`. `None` means the discharge curve's
    /// peak. Returns the average delivered power over the full duration.
    pub fn unload(&mut self, dt_hours: f64, max_power: Option<f64>, target_soc: f64) -> PowerFlow {
        if dt_hours <= 0.0 || self.soc - target_soc <= EPS {
            return PowerFlow::NONE;
        }
        let internal_power = match max_power {
            // delivered power is scaled down by efficiency, draw more from the cells
            Some(p) => (p / self.efficiency).clamp(0.0, self.discharge_curve.max_power),
            None => self.discharge_curve.max_power,
        };
        if internal_power <= 0.0 {
            return PowerFlow::NONE;
        }

        let available_soc = self.soc - target_soc;
        let t = (available_soc * self.capacity / internal_power).min(dt_hours);
        let internal_energy = internal_power * t;
        let soc_delta = internal_energy / self.capacity;
        self.soc -= soc_delta;

        PowerFlow {
            avg_power: internal_energy * self.efficiency / dt_hours,
            soc_delta,
        }
    }

    /// Charges in one-second sub-steps instead of the closed-form solution.
    ///
    /// Slower but insensitive to segment handling; the balanced strategies
    /// use it as the reference integrator inside their binary searches.
    pub fn load_iterative(&mut self, dt_hours: f64, max_power: f64) -> PowerFlow {
        let seconds = (dt_hours * 3600.0).round();
        if seconds < 1.0 || max_power <= 0.0 {
            return PowerFlow::NONE;
        }
        let clamped = self.charging_curve.clamped(max_power);
        let old_soc = self.soc;
        let mut power_sum = 0.0;

        for _ in 0..seconds as usize {
            if self.soc >= 1.0 {
                break;
            }
            let power = clamped.power_at(self.soc);
            power_sum += power;
            let soc_delta = power / 3600.0 * self.efficiency / self.capacity;
            self.soc += soc_delta;
            if self.soc >= 1.0 {
                // drop the unused fraction of the final sub-step
                if soc_delta > 0.0 {
                    power_sum -= power * (self.soc - 1.0) / soc_delta;
                }
                self.soc = 1.0;
                break;
            }
        }

        PowerFlow {
            avg_power: power_sum / seconds,
            soc_delta: self.soc - old_soc,
        }
    }

    /// Maximum average power sustainable over `dt_hours` down to `target_soc`.
    /// No side effects.
    pub fn available_power(&self, dt_hours: f64, target_soc: f64) -> f64 {
        let mut probe = self.clone();
        probe.unload(dt_hours, None, target_soc).avg_power
    }
}
