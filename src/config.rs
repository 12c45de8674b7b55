//! TOML-based simulation options.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Top-level simulation options parsed from TOML.
///
/// All fields have defaults; a missing options file means a plain greedy run.
/// Load from TOML with [`SimOptions::from_toml_file`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimOptions {
    /// Simulation-wide behavior switches.
    pub simulation: SimulationOptions,
    /// Strategy selection and tunables.
    pub strategy: StrategyOptions,
}

/// Simulation-wide behavior switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationOptions {
    /// Keep going when a vehicle arrives with a negative SoC.
    pub allow_negative_soc: bool,
    /// Clamp a negative SoC back to zero (implies allowing it).
    pub reset_negative_soc: bool,
    /// Fraction of each station's rated power that is actually available.
    pub concurrency: f64,
    /// Allowed relative shortfall of the desired SoC on departure before a
    /// warning counts against the run.
    pub margin: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            allow_negative_soc: false,
            reset_negative_soc: false,
            concurrency: 1.0,
            margin: 0.1,
        }
    }
}

/// Strategy selection and tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyOptions {
    /// One of [`crate::strategy::STRATEGIES`].
    pub name: String,
    /// Prices at or below this threshold count as "cheap" (per kWh).
    pub price_threshold: f64,
    /// Look-ahead length for the market and window strategies (hours).
    pub horizon_hours: f64,
    /// Sub-strategy for schedule (`collective`/`individual`/`greedy`/
    /// `balanced`) and flex_window (`balanced`/`greedy`/`needy`).
    pub load_strategy: Option<String>,
    /// Path to the peak load window table (JSON), required by
    /// peak_load_window.
    pub time_windows: Option<String>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            name: "greedy".to_string(),
            price_threshold: 0.0,
            horizon_hours: 24.0,
            load_strategy: None,
            time_windows: None,
        }
    }
}

/// Options error with field path and constraint description.
#[derive(Debug)]
pub struct OptionsError {
    /// Dotted field path (e.g. `"strategy.name"`).
    pub field: String,
    pub message: String,
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "options error: {} — {}", self.field, self.message)
    }
}

impl SimOptions {
    /// Parses options from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an `OptionsError` when the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, OptionsError> {
        let content = fs::read_to_string(path).map_err(|e| OptionsError {
            field: "options".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses options from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an `OptionsError` when the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, OptionsError> {
        toml::from_str(s).map_err(|e| OptionsError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Options for a given strategy with everything else at defaults.
    pub fn default_with_strategy(name: &str, load_strategy: Option<&str>) -> Self {
        Self {
            simulation: SimulationOptions::default(),
            strategy: StrategyOptions {
                name: name.to_string(),
                load_strategy: load_strategy.map(str::to_string),
                ..StrategyOptions::default()
            },
        }
    }

    /// Validates all fields and returns a list of errors.
    pub fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();

        if !crate::strategy::STRATEGIES.contains(&self.strategy.name.as_str()) {
            errors.push(OptionsError {
                field: "strategy.name".into(),
                message: format!(
                    "must be one of {}, got \"{}\"",
                    crate::strategy::STRATEGIES.join(", "),
                    self.strategy.name
                ),
            });
        }
        if self.strategy.horizon_hours <= 0.0 {
            errors.push(OptionsError {
                field: "strategy.horizon_hours".into(),
                message: "must be > 0".into(),
            });
        }
        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.concurrency) {
            errors.push(OptionsError {
                field: "simulation.concurrency".into(),
                message: "must be in [0.0, 1.0]".into(),
            });
        }
        if !(0.0..=1.0).contains(&sim.margin) {
            errors.push(OptionsError {
                field: "simulation.margin".into(),
                message: "must be in [0.0, 1.0]".into(),
            });
        }
        if sim.reset_negative_soc && !sim.allow_negative_soc {
            errors.push(OptionsError {
                field: "simulation.reset_negative_soc".into(),
                message: "requires simulation.allow_negative_soc".into(),
            });
        }
        errors
    }
}
