//! Property-based tests using proptest
//!
//! These tests validate framing invariants across a wide range of randomly
//! generated inputs: round trips, arbitrary read boundaries and hostile bytes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use device_link::core::codec::{Decoded, FrameCodec};
use device_link::core::crc16;
use device_link::core::frame::{Body, Frame, MAX_CHUNK_LEN};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Decoded> {
    let mut out = Vec::new();
    while let Some(item) = codec.decode(buf).expect("decode never errors") {
        out.push(item);
    }
    out
}

fn chunk_frame(device_id: u32, session_id: u16, task_id: u32, seq: u32, data: Vec<u8>) -> Frame {
    Frame::new(
        device_id,
        session_id,
        task_id,
        Body::UploadChunk {
            seq,
            data: Bytes::from(data),
        },
    )
}

// Property: Any chunk frame survives encode and decode unchanged
proptest! {
    #[test]
    fn prop_chunk_frame_roundtrip(
        device_id in any::<u32>(),
        session_id in any::<u16>(),
        task_id in any::<u32>(),
        seq in any::<u32>(),
        data in prop::collection::vec(any::<u8>(), 0..MAX_CHUNK_LEN),
    ) {
        let frame = chunk_frame(device_id, session_id, task_id, seq, data);
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame.clone(), &mut buf).expect("Encoding should not fail");

        let items = decode_all(&mut FrameCodec::new(), &mut buf);
        prop_assert_eq!(items.len(), 1);
        match &items[0] {
            Decoded::Frame(decoded) => prop_assert_eq!(decoded, &frame),
            Decoded::Rejected(e) => prop_assert!(false, "rejected: {}", e),
        }
        prop_assert!(buf.is_empty());
    }
}

// Property: Fixed-size report bodies survive encode and decode unchanged
proptest! {
    #[test]
    fn prop_report_roundtrip(battery in any::<u8>(), status in any::<u8>(), seq in any::<u32>(), ts in any::<u64>()) {
        let frames = vec![
            Frame::new(1, 2, 3, Body::Heartbeat { battery, status }),
            Frame::new(1, 2, 3, Body::KeyframeMark { seq, timestamp: ts }),
            Frame::new(1, 2, 3, Body::ChunkAck { seq, status }),
            Frame::new(1, 2, 3, Body::HeartbeatAck { server_time: ts }),
        ];

        let mut buf = BytesMut::new();
        let mut codec = FrameCodec::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        let decoded: Vec<Frame> = decode_all(&mut codec, &mut buf)
            .into_iter()
            .filter_map(|item| match item {
                Decoded::Frame(frame) => Some(frame),
                Decoded::Rejected(_) => None,
            })
            .collect();
        prop_assert_eq!(decoded, frames);
    }
}

// Property: CRC is deterministic and sensitive to any single bit flip
proptest! {
    #[test]
    fn prop_crc_deterministic(data in prop::collection::vec(any::<u8>(), 1..2048), bit in any::<usize>()) {
        let crc = crc16::compute(&data);
        prop_assert_eq!(crc, crc16::compute(&data));

        let mut flipped = data.clone();
        let bit = bit % (flipped.len() * 8);
        flipped[bit / 8] ^= 1 << (bit % 8);
        prop_assert_ne!(crc, crc16::compute(&flipped));
    }
}

// Property: Splitting the stream at any two points yields the same frames
proptest! {
    #[test]
    fn prop_arbitrary_read_boundaries(
        data in prop::collection::vec(any::<u8>(), 0..512),
        a in any::<usize>(),
        b in any::<usize>(),
    ) {
        let first = chunk_frame(7, 1, 9, 1, data.clone());
        let second = Frame::new(7, 1, 9, Body::UploadEnd { total_chunks: 1 });

        let mut wire = BytesMut::new();
        let mut codec = FrameCodec::new();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        let len = wire.len();
        let (mut x, mut y) = (a % (len + 1), b % (len + 1));
        if x > y {
            std::mem::swap(&mut x, &mut y);
        }

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in [&wire[..x], &wire[x..y], &wire[y..]] {
            buf.extend_from_slice(piece);
            for item in decode_all(&mut codec, &mut buf) {
                match item {
                    Decoded::Frame(frame) => frames.push(frame),
                    Decoded::Rejected(e) => prop_assert!(false, "rejected: {}", e),
                }
            }
        }

        prop_assert_eq!(frames, vec![first, second]);
        prop_assert!(buf.is_empty());
    }
}

// Property: Random input never panics and never grows the buffer
proptest! {
    #[test]
    fn prop_random_input_never_panics(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&data[..]);
        let before = buf.len();

        let _ = decode_all(&mut codec, &mut buf);
        prop_assert!(buf.len() <= before);

        let _ = codec.decode_eof(&mut buf).expect("decode_eof never errors");
    }
}

// Property: Leading noise without start-marker bytes is skipped
proptest! {
    #[test]
    fn prop_noise_before_frame_is_skipped(noise in prop::collection::vec(0u8..0xAA, 0..256)) {
        let frame = Frame::new(3, 4, 5, Body::Heartbeat { battery: 50, status: 1 });

        let mut buf = BytesMut::from(&noise[..]);
        FrameCodec::new().encode(frame.clone(), &mut buf).unwrap();

        let items = decode_all(&mut FrameCodec::new(), &mut buf);
        prop_assert_eq!(items.len(), 1);
        prop_assert!(matches!(&items[0], Decoded::Frame(decoded) if decoded == &frame));
    }
}
