#![forbid(unsafe_code)]

//! Session monitoring and control engine.
//!
//! Polls long-running automation sessions per project, classifies each
//! one (`active`, `idle`, `stalled`, `paused`, `terminated`, `error`) and
//! publishes consistent snapshots. Operators pause, resume, terminate and
//! restart sessions through the controller, in process or over HTTP.

pub mod client;
pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod monitor;
pub mod source;

pub use config::{DetectionSettings, GlobalConfig, MonitoringConfig, MonitoringConfigPatch};
pub use errors::{AppError, Result};
pub use monitor::MonitoringContext;
