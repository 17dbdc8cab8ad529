//! Stream codec for device frames.
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed` and turns a raw TCP
//! byte stream into [`Decoded`] items and [`Frame`]s back into bytes.
//!
//! Decoding is a sliding-window scan over the receive buffer:
//! 1. Garbage before the start marker is dropped; no marker means wait.
//! 2. The 6-byte header must be complete, otherwise wait.
//! 3. Version and total length are validated.
//! 4. The whole frame must be buffered, otherwise wait. Nothing is consumed.
//! 5. CRC and end marker are validated.
//! 6. Prefix and command body are parsed and the frame is split off.
//!
//! Validation failures are yielded as [`Decoded::Rejected`] instead of `Err`,
//! which would end the framed stream. The caller answers those with a
//! protocol-error frame and keeps reading. How much input a rejection discards
//! is set by [`ResyncPolicy`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::config::{ResyncPolicy, PROTOCOL_VERSION};
use crate::core::crc16;
use crate::core::frame::{
    Body, Command, Frame, END_MARKER, HEADER_LEN, MAX_FRAME_LEN, MIN_FRAME_LEN, START_MARKER,
    TAIL_LEN,
};
use crate::error::{ProtocolError, Result};

const START_BYTES: [u8; 2] = START_MARKER.to_be_bytes();

/// One decoder output
#[derive(Debug)]
pub enum Decoded {
    /// A validated, fully parsed frame
    Frame(Frame),
    /// Input failed framing validation; answer with a protocol-error frame
    Rejected(ProtocolError),
}

/// Codec for the device wire format
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    resync: ResyncPolicy,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resync(resync: ResyncPolicy) -> Self {
        Self { resync }
    }

    /// Advance `src` to the next start marker. Returns `false` when none is
    /// buffered yet; a trailing half marker is kept for the next read.
    fn seek_start_marker(src: &mut BytesMut) -> bool {
        match src.windows(2).position(|w| w == START_BYTES) {
            Some(0) => true,
            Some(offset) => {
                trace!(skipped = offset, "Skipping bytes before start marker");
                src.advance(offset);
                true
            }
            None => {
                let keep = usize::from(src.last() == Some(&START_BYTES[0]));
                let skipped = src.len() - keep;
                if skipped > 0 {
                    trace!(skipped, "No start marker in buffered bytes");
                    src.advance(skipped);
                }
                false
            }
        }
    }

    fn reject(&self, src: &mut BytesMut, error: ProtocolError) -> Decoded {
        match self.resync {
            ResyncPolicy::NextStartMarker => src.advance(START_BYTES.len()),
            ResyncPolicy::DiscardBuffer => src.clear(),
        }
        warn!(error = %error, remaining = src.len(), "Rejected inbound frame");
        Decoded::Rejected(error)
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        loop {
            if !Self::seek_start_marker(src) || src.len() < HEADER_LEN {
                return Ok(None);
            }

            let version = src[2];
            let total_len = u16::from_be_bytes([src[3], src[4]]);
            let command = src[5];

            if version != PROTOCOL_VERSION {
                let error =
                    ProtocolError::HeaderMalformed(format!("unsupported version 0x{version:02X}"));
                return Ok(Some(self.reject(src, error)));
            }

            if usize::from(total_len) < MIN_FRAME_LEN {
                return Ok(Some(self.reject(src, ProtocolError::LengthInvalid(total_len))));
            }

            let total_len = usize::from(total_len);
            if src.len() < total_len {
                trace!(need = total_len, have = src.len(), "Partial frame buffered");
                src.reserve(total_len - src.len());
                return Ok(None);
            }

            let crc_offset = total_len - TAIL_LEN;
            let computed = crc16::compute(&src[..crc_offset]);
            let received = u16::from_be_bytes([src[crc_offset], src[crc_offset + 1]]);
            if computed != received {
                let error = ProtocolError::CrcMismatch { received, computed };
                return Ok(Some(self.reject(src, error)));
            }

            let end_marker = u16::from_be_bytes([src[crc_offset + 2], src[crc_offset + 3]]);
            if end_marker != END_MARKER {
                return Ok(Some(self.reject(src, ProtocolError::EndMarkerInvalid(end_marker))));
            }

            let mut payload = src.split_to(total_len).freeze();
            payload.advance(HEADER_LEN);
            payload.truncate(crc_offset - HEADER_LEN);

            let device_id = payload.get_u32();
            let session_id = payload.get_u16();
            let task_id = payload.get_u32();

            let parsed =
                Command::try_from(command).and_then(|command| Body::parse(command, payload));
            match parsed {
                Ok(body) => {
                    return Ok(Some(Decoded::Frame(Frame {
                        version,
                        device_id,
                        session_id,
                        task_id,
                        body,
                    })));
                }
                Err(error) => {
                    // The frame itself was intact; drop only its business parse.
                    warn!(
                        error = %error,
                        device_id,
                        command = format_args!("0x{command:02X}"),
                        "Dropping unparseable frame"
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        match self.decode(src)? {
            Some(decoded) => Ok(Some(decoded)),
            None => {
                if !src.is_empty() {
                    debug!(remaining = src.len(), "Discarding partial frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, dst)
    }
}

/// Append the wire form of `frame` to `dst`.
///
/// The length field is written as a placeholder and backfilled once the body
/// is in place; the CRC then covers start marker through body. On error
/// nothing is written.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let total = frame.encoded_len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame(total));
    }

    let start = dst.len();
    dst.reserve(total);

    dst.put_u16(START_MARKER);
    dst.put_u8(frame.version);
    dst.put_u16(0);
    dst.put_u8(frame.command().code());

    dst.put_u32(frame.device_id);
    dst.put_u16(frame.session_id);
    dst.put_u32(frame.task_id);
    frame.body.write(dst);

    let length = (dst.len() - start + TAIL_LEN) as u16;
    dst[start + 3..start + 5].copy_from_slice(&length.to_be_bytes());

    let crc = crc16::compute(&dst[start..]);
    dst.put_u16(crc);
    dst.put_u16(END_MARKER);

    debug_assert_eq!(dst.len() - start, total);
    Ok(())
}
