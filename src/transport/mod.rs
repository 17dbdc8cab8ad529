//! # Transport Layer
//!
//! Plain TCP listener for device connections.
//!
//! Each accepted socket gets its own task running a `FramedRead` /
//! `FramedWrite` pair over [`FrameCodec`](crate::core::codec::FrameCodec) and
//! an outbound queue other components push frames into.

pub mod server;

pub use server::{connect, Server};
