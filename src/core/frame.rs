//! Frame data model.
//!
//! Every frame carries the same fixed prefix (`device_id`, `session_id`,
//! `task_id`) followed by a command body. The command byte selects exactly one
//! body schema, modelled here as the [`Body`] tagged union so encoding and
//! decoding are exhaustive matches.
//!
//! ```text
//! [Start 0xAA55 (2)] [Version (1)] [Total length (2)] [Command (1)]
//! [Device ID (4)] [Session ID (2)] [Task ID (4)] [Body (N)]
//! [CRC16 (2)] [End 0x55AA (2)]
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::PROTOCOL_VERSION;
use crate::error::{ProtocolError, Result};

/// Frame start marker
pub const START_MARKER: u16 = 0xAA55;

/// Frame end marker
pub const END_MARKER: u16 = 0x55AA;

/// Start marker (2) + version (1) + total length (2) + command (1)
pub const HEADER_LEN: usize = 6;

/// Device ID (4) + session ID (2) + task ID (4)
pub const PREFIX_LEN: usize = 10;

/// CRC (2) + end marker (2)
pub const TAIL_LEN: usize = 4;

/// Smallest frame the decoder accepts
pub const MIN_FRAME_LEN: usize = HEADER_LEN + PREFIX_LEN + TAIL_LEN;

/// The length field is 16 bits wide
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest chunk that still fits an upload frame next to its sequence number
pub const MAX_CHUNK_LEN: usize = MAX_FRAME_LEN - MIN_FRAME_LEN - 4;

/// Positive acknowledgement status byte
pub const STATUS_OK: u8 = 1;

/// Negative acknowledgement status byte
pub const STATUS_FAILED: u8 = 0;

/// Wire command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    DeviceBind = 0x01,
    DeviceUnbind = 0x02,
    StartRecording = 0x03,
    StopRecording = 0x04,
    ServerHeartbeat = 0x05,
    ForceDisconnect = 0x06,

    ConnectionAck = 0x11,
    HeartbeatAck = 0x12,
    KeyframeAck = 0x13,
    ChunkAck = 0x14,
    UploadEndAck = 0x15,
    ProtocolError = 0x16,

    ConnectionRequest = 0x21,
    BindAck = 0x22,
    StartRecordingAck = 0x23,
    StopRecordingAck = 0x24,
    Heartbeat = 0x25,
    KeyframeMark = 0x26,
    UploadChunk = 0x27,
    UploadEnd = 0x28,
}

impl Command {
    /// Raw wire value
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        let command = match value {
            0x01 => Command::DeviceBind,
            0x02 => Command::DeviceUnbind,
            0x03 => Command::StartRecording,
            0x04 => Command::StopRecording,
            0x05 => Command::ServerHeartbeat,
            0x06 => Command::ForceDisconnect,
            0x11 => Command::ConnectionAck,
            0x12 => Command::HeartbeatAck,
            0x13 => Command::KeyframeAck,
            0x14 => Command::ChunkAck,
            0x15 => Command::UploadEndAck,
            0x16 => Command::ProtocolError,
            0x21 => Command::ConnectionRequest,
            0x22 => Command::BindAck,
            0x23 => Command::StartRecordingAck,
            0x24 => Command::StopRecordingAck,
            0x25 => Command::Heartbeat,
            0x26 => Command::KeyframeMark,
            0x27 => Command::UploadChunk,
            0x28 => Command::UploadEnd,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// Command-specific frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    // Server-issued commands
    DeviceBind,
    DeviceUnbind,
    StartRecording,
    StopRecording,
    ServerHeartbeat,
    ForceDisconnect,

    // Server responses
    ConnectionAck { server_time: u64 },
    HeartbeatAck { server_time: u64 },
    KeyframeAck { seq: u32, status: u8 },
    ChunkAck { seq: u32, status: u8 },
    UploadEndAck { chunk_count: u32, content_hash: Bytes },
    ProtocolError,

    // Device reports
    ConnectionRequest,
    /// Acknowledges both bind and unbind
    BindAck { status: u16 },
    StartRecordingAck { status: u16 },
    StopRecordingAck { status: u16 },
    Heartbeat { battery: u8, status: u8 },
    KeyframeMark { seq: u32, timestamp: u64 },
    UploadChunk { seq: u32, data: Bytes },
    UploadEnd { total_chunks: u32 },
}

impl Body {
    pub fn command(&self) -> Command {
        match self {
            Body::DeviceBind => Command::DeviceBind,
            Body::DeviceUnbind => Command::DeviceUnbind,
            Body::StartRecording => Command::StartRecording,
            Body::StopRecording => Command::StopRecording,
            Body::ServerHeartbeat => Command::ServerHeartbeat,
            Body::ForceDisconnect => Command::ForceDisconnect,
            Body::ConnectionAck { .. } => Command::ConnectionAck,
            Body::HeartbeatAck { .. } => Command::HeartbeatAck,
            Body::KeyframeAck { .. } => Command::KeyframeAck,
            Body::ChunkAck { .. } => Command::ChunkAck,
            Body::UploadEndAck { .. } => Command::UploadEndAck,
            Body::ProtocolError => Command::ProtocolError,
            Body::ConnectionRequest => Command::ConnectionRequest,
            Body::BindAck { .. } => Command::BindAck,
            Body::StartRecordingAck { .. } => Command::StartRecordingAck,
            Body::StopRecordingAck { .. } => Command::StopRecordingAck,
            Body::Heartbeat { .. } => Command::Heartbeat,
            Body::KeyframeMark { .. } => Command::KeyframeMark,
            Body::UploadChunk { .. } => Command::UploadChunk,
            Body::UploadEnd { .. } => Command::UploadEnd,
        }
    }

    /// Number of bytes [`Body::write`] produces
    pub fn encoded_len(&self) -> usize {
        match self {
            Body::DeviceBind
            | Body::DeviceUnbind
            | Body::StartRecording
            | Body::StopRecording
            | Body::ServerHeartbeat
            | Body::ForceDisconnect
            | Body::ProtocolError
            | Body::ConnectionRequest => 0,
            Body::ConnectionAck { .. } | Body::HeartbeatAck { .. } => 8,
            Body::KeyframeAck { .. } | Body::ChunkAck { .. } => 5,
            Body::UploadEndAck { content_hash, .. } => 4 + content_hash.len(),
            Body::BindAck { .. } | Body::StartRecordingAck { .. } | Body::StopRecordingAck { .. } => 2,
            Body::Heartbeat { .. } => 2,
            Body::KeyframeMark { .. } => 12,
            Body::UploadChunk { data, .. } => 4 + data.len(),
            Body::UploadEnd { .. } => 4,
        }
    }

    /// Append the body bytes to `dst`
    pub fn write(&self, dst: &mut BytesMut) {
        match self {
            Body::DeviceBind
            | Body::DeviceUnbind
            | Body::StartRecording
            | Body::StopRecording
            | Body::ServerHeartbeat
            | Body::ForceDisconnect
            | Body::ProtocolError
            | Body::ConnectionRequest => {}
            Body::ConnectionAck { server_time } | Body::HeartbeatAck { server_time } => {
                dst.put_u64(*server_time);
            }
            Body::KeyframeAck { seq, status } | Body::ChunkAck { seq, status } => {
                dst.put_u32(*seq);
                dst.put_u8(*status);
            }
            Body::UploadEndAck {
                chunk_count,
                content_hash,
            } => {
                dst.put_u32(*chunk_count);
                dst.put_slice(content_hash);
            }
            Body::BindAck { status }
            | Body::StartRecordingAck { status }
            | Body::StopRecordingAck { status } => {
                dst.put_u16(*status);
            }
            Body::Heartbeat { battery, status } => {
                dst.put_u8(*battery);
                dst.put_u8(*status);
            }
            Body::KeyframeMark { seq, timestamp } => {
                dst.put_u32(*seq);
                dst.put_u64(*timestamp);
            }
            Body::UploadChunk { seq, data } => {
                dst.put_u32(*seq);
                dst.put_slice(data);
            }
            Body::UploadEnd { total_chunks } => {
                dst.put_u32(*total_chunks);
            }
        }
    }

    /// Parse the body of `command` from `src`.
    ///
    /// Bytes beyond a fixed-size schema are ignored. Variable-size bodies
    /// (chunk data, content hash) take the rest of `src`.
    pub fn parse(command: Command, mut src: Bytes) -> Result<Body> {
        let need = |n: usize, src: &Bytes| -> Result<()> {
            if src.remaining() < n {
                Err(ProtocolError::PayloadMalformed {
                    command: command.code(),
                    needed: n,
                    available: src.remaining(),
                })
            } else {
                Ok(())
            }
        };

        let body = match command {
            Command::DeviceBind => Body::DeviceBind,
            Command::DeviceUnbind => Body::DeviceUnbind,
            Command::StartRecording => Body::StartRecording,
            Command::StopRecording => Body::StopRecording,
            Command::ServerHeartbeat => Body::ServerHeartbeat,
            Command::ForceDisconnect => Body::ForceDisconnect,
            Command::ProtocolError => Body::ProtocolError,
            Command::ConnectionRequest => Body::ConnectionRequest,
            Command::ConnectionAck => {
                need(8, &src)?;
                Body::ConnectionAck {
                    server_time: src.get_u64(),
                }
            }
            Command::HeartbeatAck => {
                need(8, &src)?;
                Body::HeartbeatAck {
                    server_time: src.get_u64(),
                }
            }
            Command::KeyframeAck => {
                need(5, &src)?;
                Body::KeyframeAck {
                    seq: src.get_u32(),
                    status: src.get_u8(),
                }
            }
            Command::ChunkAck => {
                need(5, &src)?;
                Body::ChunkAck {
                    seq: src.get_u32(),
                    status: src.get_u8(),
                }
            }
            Command::UploadEndAck => {
                need(4, &src)?;
                let chunk_count = src.get_u32();
                Body::UploadEndAck {
                    chunk_count,
                    content_hash: src,
                }
            }
            Command::BindAck => {
                need(2, &src)?;
                Body::BindAck {
                    status: src.get_u16(),
                }
            }
            Command::StartRecordingAck => {
                need(2, &src)?;
                Body::StartRecordingAck {
                    status: src.get_u16(),
                }
            }
            Command::StopRecordingAck => {
                need(2, &src)?;
                Body::StopRecordingAck {
                    status: src.get_u16(),
                }
            }
            Command::Heartbeat => {
                need(2, &src)?;
                Body::Heartbeat {
                    battery: src.get_u8(),
                    status: src.get_u8(),
                }
            }
            Command::KeyframeMark => {
                need(12, &src)?;
                Body::KeyframeMark {
                    seq: src.get_u32(),
                    timestamp: src.get_u64(),
                }
            }
            Command::UploadChunk => {
                need(4, &src)?;
                let seq = src.get_u32();
                Body::UploadChunk { seq, data: src }
            }
            Command::UploadEnd => {
                need(4, &src)?;
                Body::UploadEnd {
                    total_chunks: src.get_u32(),
                }
            }
        };
        Ok(body)
    }
}

/// One complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub device_id: u32,
    /// `0` before registration
    pub session_id: u16,
    /// `0` when no task is bound
    pub task_id: u32,
    pub body: Body,
}

impl Frame {
    /// Build a frame stamped with the current protocol version
    pub fn new(device_id: u32, session_id: u16, task_id: u32, body: Body) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            session_id,
            task_id,
            body,
        }
    }

    #[inline]
    pub fn command(&self) -> Command {
        self.body.command()
    }

    /// Total wire length including markers and CRC
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.body.encoded_len()
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        super::codec::encode_frame(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_round_trip() {
        for code in 0u8..=0xFF {
            if let Ok(command) = Command::try_from(code) {
                assert_eq!(command.code(), code);
            }
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(matches!(
            Command::try_from(0x7F),
            Err(ProtocolError::UnknownCommand(0x7F))
        ));
        assert!(matches!(
            Command::try_from(0x00),
            Err(ProtocolError::UnknownCommand(0x00))
        ));
    }

    #[test]
    fn test_body_parse_short_payload() {
        let result = Body::parse(Command::KeyframeMark, Bytes::from_static(&[0, 0, 0, 1]));
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadMalformed {
                command: 0x26,
                needed: 12,
                available: 4
            })
        ));
    }

    #[test]
    fn test_body_parse_ignores_trailing_bytes() {
        let body = Body::parse(Command::Heartbeat, Bytes::from_static(&[80, 1, 0xFF])).unwrap();
        assert_eq!(
            body,
            Body::Heartbeat {
                battery: 80,
                status: 1
            }
        );
    }

    #[test]
    fn test_upload_chunk_takes_rest() {
        let body = Body::parse(
            Command::UploadChunk,
            Bytes::from_static(&[0, 0, 0, 7, 1, 2, 3]),
        )
        .unwrap();
        assert_eq!(
            body,
            Body::UploadChunk {
                seq: 7,
                data: Bytes::from_static(&[1, 2, 3])
            }
        );
    }

    #[test]
    fn test_encoded_len_matches_write() {
        let bodies = [
            Body::ConnectionRequest,
            Body::ConnectionAck { server_time: 1 },
            Body::ChunkAck { seq: 1, status: STATUS_OK },
            Body::UploadEndAck {
                chunk_count: 3,
                content_hash: Bytes::from_static(&[0xAB; 16]),
            },
            Body::BindAck { status: 0 },
            Body::Heartbeat { battery: 1, status: 2 },
            Body::KeyframeMark { seq: 1, timestamp: 2 },
            Body::UploadChunk {
                seq: 1,
                data: Bytes::from_static(b"abc"),
            },
            Body::UploadEnd { total_chunks: 9 },
        ];
        for body in bodies {
            let mut buf = BytesMut::new();
            body.write(&mut buf);
            assert_eq!(buf.len(), body.encoded_len(), "{body:?}");
        }
    }
}
