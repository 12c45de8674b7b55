//! Simulation engine, events, step records, and the summary report.

pub mod engine;
pub mod event;
pub mod report;
pub mod types;

pub use engine::{Engine, SimResult};
pub use event::{Event, EventKind, EventQueue};
pub use report::SummaryReport;
pub use types::{NegativeSocPolicy, SimConfig, StepContext, StepRecord, World};
