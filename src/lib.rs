//! FlowScout: hourly capital-inflow scanner with outcome tracking, paper
//! trading and nightly self-tuning.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod adapt;
pub mod backtest;
pub mod calendar;
pub mod config;
pub mod data;
pub mod engine;
pub mod llm;
pub mod notify;
pub mod paper;
pub mod scoring;
pub mod status;
pub mod storage;
pub mod types;
