//! Monitoring engine: registry, pollers, detection and control.

pub mod controller;
pub mod detector;
pub mod events;
pub mod intents;
pub mod poller;
pub mod registry;

pub use controller::{validate_transition, Transition};
pub use events::{spawn_event_logger, MonitorEvent};
pub use registry::{MonitorEntry, MonitoringContext, SnapshotCell};
