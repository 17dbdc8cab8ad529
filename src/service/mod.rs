//! # Service Layer
//!
//! Operator-facing command boundary over the protocol engine.

pub mod commands;

pub use commands::{CommandResult, DeviceInfo, DeviceService};
