//! # device-link
//!
//! TCP protocol engine for embedded devices.
//!
//! Devices connect over plain TCP, register, heartbeat and upload large files
//! as sequence-numbered chunks. The server answers every report with a typed
//! response frame and reassembles uploads into one artifact per `(device, task)`.
//!
//! ## Layers
//! - [`core`]: CRC16, frame model and the `tokio_util` codec
//! - [`protocol`]: session and connection registries, upload reassembly,
//!   per-connection dispatcher, sweeper and event bus
//! - [`service`]: operator command boundary
//! - [`transport`]: TCP accept loop and graceful shutdown
//! - [`utils`]: logging, metrics, time and hashing helpers
//!
//! ## Quick Start
//! ```no_run
//! use device_link::config::LinkConfig;
//! use device_link::transport::server::Server;
//!
//! # async fn run() -> device_link::error::Result<()> {
//! let config = LinkConfig::from_env()?;
//! config.validate_strict()?;
//! let server = Server::new(config);
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::LinkConfig;
pub use error::{ProtocolError, Result};
