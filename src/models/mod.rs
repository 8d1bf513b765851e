//! Domain model module declarations.

pub mod control;
pub mod health;
pub mod monitoring;
pub mod session;
