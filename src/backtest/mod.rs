//! Offline evaluation over stored history.

pub mod lab;

pub use lab::{LabReport, LabRow, LabStatus, StrategyLab};
