//! Physical components: curves, batteries, vehicles, stations, connectors.

pub mod battery;
pub mod curve;
pub mod grid;
pub mod station;
pub mod vehicle;

pub use battery::{Battery, PowerFlow, UNLIMITED_CAPACITY};
pub use curve::ChargingCurve;
pub use grid::GridConnector;
pub use station::ChargingStation;
pub use vehicle::{Vehicle, VehicleType};

/// Stationary battery attached to a grid connector.
#[derive(Debug, Clone)]
pub struct StationaryBattery {
    /// Grid connector this battery hangs off.
    pub parent: String,
    pub battery: Battery,
    /// Below this power the battery refuses to charge (kW).
    pub min_charging_power: f64,
}

/// PV plant feeding into a grid connector. The produced power arrives as a
/// local generation series; the nominal power selects the feed-in
/// remuneration tier in the summary report.
#[derive(Debug, Clone)]
pub struct Photovoltaics {
    pub parent: String,
    pub nominal_power: f64,
}
