//! Background monitoring engine for the Loggist usage dashboard
//!
//! This crate provides the core functionality for:
//! - Budget monitoring with threshold alerts
//! - Anomaly signal evaluation over the metrics and log backends
//! - Live log fan-out with secret redaction
//! - Per-client rate limiting
//! - Time-series downsampling for charts
//! - Health checks and observability

pub mod backend;
pub mod budget;
pub mod downsample;
pub mod fanout;
pub mod health;
pub mod models;
pub mod notify;
pub mod observability;
pub mod ratelimit;
pub mod signals;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{MonitorMetrics, StructuredLogger};
