//! # Utility Modules
//!
//! Supporting utilities shared by the protocol engine.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Unix millisecond timestamps and idle checks
//! - **Hash**: MD5 / SHA-256 over finished artifacts

pub mod hash;
pub mod logging;
pub mod metrics;
pub mod time;

pub use metrics::{Metrics, MetricsSnapshot};
