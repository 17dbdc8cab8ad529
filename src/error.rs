//! # Error Types
//!
//! Error handling for the device link protocol engine.
//!
//! This module defines every error variant that can surface while framing
//! bytes, driving device sessions or reassembling uploads.
//!
//! ## Error Categories
//! - **Framing Errors**: malformed header, bad length, CRC or end marker mismatch
//! - **Payload Errors**: unknown command byte, body shorter than its schema
//! - **Session Errors**: device not registered, transport already gone
//! - **Upload Errors**: temp chunk or artifact I/O failures
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! A missing start marker is deliberately *not* represented here: the decoder
//! simply waits for more bytes.
//!
//! ## Example Usage
//! ```rust
//! use device_link::error::{ProtocolError, Result};
//!
//! fn require_session(found: bool, device_id: u32) -> Result<()> {
//!     if found {
//!         Ok(())
//!     } else {
//!         Err(ProtocolError::SessionNotFound(device_id))
//!     }
//! }
//!
//! assert!(require_session(false, 42).is_err());
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Operator command results
    pub const MSG_COMMAND_SENT: &str = "Command sent";
    pub const MSG_DEVICE_NOT_CONNECTED: &str = "Device not connected";
    pub const MSG_CONNECTION_INACTIVE: &str = "Connection is no longer active";
    pub const MSG_DEVICE_DISCONNECTED: &str = "Device disconnected";

    /// Upload errors
    pub const ERR_NO_CHUNKS: &str = "No cached chunks for upload";
    pub const ERR_HASH_TASK: &str = "Hashing task failed to complete";
    pub const ERR_MERGE_TASK: &str = "Merge task failed to complete";

    /// Misc
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

/// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame header: {0}")]
    HeaderMalformed(String),

    #[error("Invalid frame length: {0} bytes")]
    LengthInvalid(u16),

    #[error("CRC mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Invalid end marker: 0x{0:04X}")]
    EndMarkerInvalid(u16),

    #[error("Unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Payload too short for command 0x{command:02X}: need {needed} bytes, have {available}")]
    PayloadMalformed {
        command: u8,
        needed: usize,
        available: usize,
    },

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Session not found for device {0}")]
    SessionNotFound(u32),

    #[error("Connection for device {0} is no longer active")]
    ConnectionInactive(u32),

    #[error("Upload I/O error on {}: {source}", path.display())]
    UploadIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error came out of frame validation and warrants a
    /// protocol-error response to the peer.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::HeaderMalformed(_)
                | ProtocolError::LengthInvalid(_)
                | ProtocolError::CrcMismatch { .. }
                | ProtocolError::EndMarkerInvalid(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
