//! Charging station below a grid connector.

/// Per-vehicle charging interface. At most one vehicle is connected at a time;
/// occupancy is derived from the vehicles' `connected_charging_station`.
#[derive(Debug, Clone)]
pub struct ChargingStation {
    /// Grid connector this station hangs off.
    pub parent: String,
    /// Hard power cap of the station (kW).
    pub max_power: f64,
    /// Below this power the station refuses to charge (kW).
    pub min_power: f64,
    /// Power allocated during the current interval (kW).
    pub current_power: f64,
}

impl ChargingStation {
    pub fn new(parent: impl Into<String>, max_power: f64, min_power: f64) -> Self {
        Self {
            parent: parent.into(),
            max_power,
            min_power,
            current_power: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unloaded() {
        let cs = ChargingStation::new("GC1", 22.0, 0.2);
        assert_eq!(cs.parent, "GC1");
        assert_eq!(cs.current_power, 0.0);
    }
}
