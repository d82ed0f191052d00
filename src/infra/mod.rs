//! Runtime bootstrap for the admin binary.

pub mod error;
pub mod telemetry;
