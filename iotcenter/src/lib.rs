//! Device registration, authorization issuance and synthetic telemetry on top
//! of an InfluxDB v2 time-series store.

pub mod authorizations;
pub mod config;
pub mod devices;
pub mod errors;
pub mod measurements;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod store;
pub mod telemetry;
