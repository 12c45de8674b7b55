//! Simulation error types.

use thiserror::Error;

/// Errors raised while loading a scenario or advancing the simulation.
#[derive(Debug, Error)]
pub enum SimError {
    /// Scenario document could not be read or parsed.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    /// A component referenced by id does not exist.
    #[error("unknown {kind} \"{id}\"")]
    UnknownComponent { kind: &'static str, id: String },

    /// A vehicle SoC fell below zero on arrival and the policy forbids it.
    #[error("SoC of vehicle \"{vehicle}\" became negative at {time} (soc = {soc:.4})")]
    NegativeSoc {
        vehicle: String,
        time: String,
        soc: f64,
    },

    /// A grid connector has neither an energy tariff nor a schedule target.
    #[error("grid connector \"{0}\" has neither cost nor schedule at {1}")]
    MissingPriceOrSchedule(String, String),

    /// Fixed loads alone exceed the grid connector cap; no allocation can fix it.
    #[error("grid connector \"{gc}\" overloaded at step {step}: {load:.3} kW over {limit:.3} kW")]
    Overload {
        gc: String,
        step: usize,
        load: f64,
        limit: f64,
    },

    /// Strategy configuration problem (missing window table, bad sub-strategy, ...).
    #[error("strategy error: {0}")]
    Strategy(String),

    /// Underlying I/O failure (scenario file, CSV series, export).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
