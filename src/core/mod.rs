//! # Core Protocol Components
//!
//! Checksum, frame model and stream codec for the device wire format.
//!
//! ## Components
//! - **CRC16**: CCITT-FALSE checksum stamped on every frame
//! - **Frame**: `Command` discriminant and `Body` tagged union
//! - **Codec**: Tokio codec for framing over TCP byte streams
//!
//! ## Wire Format
//! ```text
//! [Start(2)] [Version(1)] [Length(2)] [Command(1)] [Device(4)] [Session(2)] [Task(4)] [Body(N)] [CRC(2)] [End(2)]
//! ```
//!
//! ## Limits
//! - Minimum frame: 20 bytes
//! - Maximum frame: 65535 bytes (16-bit length field)
//! - Length is validated before the decoder reserves space for a frame

pub mod codec;
pub mod crc16;
pub mod frame;

pub use codec::{Decoded, FrameCodec};
pub use frame::{Body, Command, Frame};
