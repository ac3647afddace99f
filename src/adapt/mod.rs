//! Nightly adaptation: factor diagnostics, bounded weight tuning and the
//! daily regime label. Everything here runs in the nightly batch and
//! writes only append-only, date-keyed rows read by the next day's
//! hourly cycles.

pub mod diagnostics;
pub mod regime;
pub mod stats;
pub mod tuner;
