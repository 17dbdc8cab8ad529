//! Integration tests for stream framing: split and merged TCP reads,
//! corruption handling and resynchronization.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::{Bytes, BytesMut};
use device_link::config::ResyncPolicy;
use device_link::core::codec::{Decoded, FrameCodec};
use device_link::core::crc16;
use device_link::core::frame::{Body, Frame, MAX_CHUNK_LEN, MIN_FRAME_LEN, STATUS_OK};
use device_link::error::ProtocolError;
use tokio_util::codec::{Decoder, Encoder};

fn sample_frame() -> Frame {
    Frame::new(
        42,
        0x1234,
        7,
        Body::UploadChunk {
            seq: 3,
            data: Bytes::from_static(b"chunk-payload-bytes"),
        },
    )
}

fn all_bodies() -> Vec<Body> {
    vec![
        Body::DeviceBind,
        Body::DeviceUnbind,
        Body::StartRecording,
        Body::StopRecording,
        Body::ServerHeartbeat,
        Body::ForceDisconnect,
        Body::ConnectionAck {
            server_time: 1_700_000_000_000,
        },
        Body::HeartbeatAck { server_time: 1 },
        Body::KeyframeAck {
            seq: 9,
            status: STATUS_OK,
        },
        Body::ChunkAck { seq: 10, status: 0 },
        Body::UploadEndAck {
            chunk_count: 3,
            content_hash: Bytes::from_static(&[0x5A; 16]),
        },
        Body::ProtocolError,
        Body::ConnectionRequest,
        Body::BindAck { status: 0x0102 },
        Body::StartRecordingAck { status: 1 },
        Body::StopRecordingAck { status: 2 },
        Body::Heartbeat {
            battery: 87,
            status: 1,
        },
        Body::KeyframeMark {
            seq: 11,
            timestamp: u64::MAX,
        },
        Body::UploadChunk {
            seq: 1,
            data: Bytes::new(),
        },
        Body::UploadEnd { total_chunks: 12 },
    ]
}

/// Decode everything currently decodable
fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Decoded> {
    let mut out = Vec::new();
    while let Some(item) = codec.decode(buf).expect("decode never errors") {
        out.push(item);
    }
    out
}

fn frames(items: Vec<Decoded>) -> Vec<Frame> {
    items
        .into_iter()
        .map(|item| match item {
            Decoded::Frame(frame) => frame,
            Decoded::Rejected(e) => panic!("unexpected rejection: {e}"),
        })
        .collect()
}

#[test]
fn test_every_command_round_trips() {
    let mut codec = FrameCodec::new();
    for body in all_bodies() {
        let frame = Frame::new(1, 2, 3, body);
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = frames(drain(&mut codec, &mut buf));
        assert_eq!(decoded, vec![frame]);
        assert!(buf.is_empty());
    }
}

#[test]
fn test_chunk_payload_sizes_round_trip() {
    let mut codec = FrameCodec::new();
    for size in [0usize, 1, 4096, 4097, MAX_CHUNK_LEN] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(
            5,
            6,
            7,
            Body::UploadChunk {
                seq: size as u32,
                data: Bytes::from(data),
            },
        );
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());

        assert_eq!(frames(drain(&mut codec, &mut buf)), vec![frame]);
    }
}

#[test]
fn test_split_at_every_boundary() {
    let encoded = sample_frame().to_bytes().unwrap();

    for split in 0..=encoded.len() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&encoded[..split]);

        let first = drain(&mut codec, &mut buf);
        if split < encoded.len() {
            assert!(first.is_empty(), "decoded early at split {split}");
        }

        buf.extend_from_slice(&encoded[split..]);
        let mut all = first;
        all.extend(drain(&mut codec, &mut buf));

        assert_eq!(frames(all), vec![sample_frame()], "split at {split}");
        assert!(buf.is_empty());
    }
}

#[test]
fn test_byte_by_byte_feed() {
    let encoded = sample_frame().to_bytes().unwrap();
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();

    for byte in encoded.iter() {
        buf.extend_from_slice(&[*byte]);
        decoded.extend(drain(&mut codec, &mut buf));
    }

    assert_eq!(frames(decoded), vec![sample_frame()]);
}

#[test]
fn test_concatenated_frames_decode_in_order() {
    let second = Frame::new(
        42,
        0x1234,
        7,
        Body::Heartbeat {
            battery: 10,
            status: 2,
        },
    );
    let third = Frame::new(43, 1, 0, Body::ConnectionRequest);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&sample_frame().to_bytes().unwrap());
    buf.extend_from_slice(&second.to_bytes().unwrap());
    buf.extend_from_slice(&third.to_bytes().unwrap());

    let mut codec = FrameCodec::new();
    assert_eq!(
        frames(drain(&mut codec, &mut buf)),
        vec![sample_frame(), second, third]
    );
}

#[test]
fn test_corrupted_crc_rejected_once_then_fresh_buffer_decodes() {
    let mut corrupted = BytesMut::from(&sample_frame().to_bytes().unwrap()[..]);
    // Flip one bit of the body.
    corrupted[MIN_FRAME_LEN] ^= 0x01;

    let mut codec = FrameCodec::new();
    let items = drain(&mut codec, &mut corrupted);

    assert_eq!(items.len(), 1);
    assert!(matches!(
        items[0],
        Decoded::Rejected(ProtocolError::CrcMismatch { .. })
    ));

    let mut fresh = BytesMut::from(&sample_frame().to_bytes().unwrap()[..]);
    assert_eq!(frames(drain(&mut codec, &mut fresh)), vec![sample_frame()]);
}

#[test]
fn test_crc_covers_start_marker_through_body() {
    let encoded = sample_frame().to_bytes().unwrap();
    let crc_offset = encoded.len() - 4;
    let stamped = u16::from_be_bytes([encoded[crc_offset], encoded[crc_offset + 1]]);

    assert_eq!(stamped, crc16::compute(&encoded[..crc_offset]));
}

#[test]
fn test_next_start_marker_policy_keeps_following_frame() {
    let mut corrupted = BytesMut::from(&sample_frame().to_bytes().unwrap()[..]);
    let last = corrupted.len() - 1;
    corrupted[last] = 0x00;

    let follower = Frame::new(9, 9, 9, Body::UploadEnd { total_chunks: 4 });
    corrupted.extend_from_slice(&follower.to_bytes().unwrap());

    let mut codec = FrameCodec::with_resync(ResyncPolicy::NextStartMarker);
    let items = drain(&mut codec, &mut corrupted);

    assert_eq!(items.len(), 2);
    assert!(matches!(
        items[0],
        Decoded::Rejected(ProtocolError::EndMarkerInvalid(_))
    ));
    match &items[1] {
        Decoded::Frame(frame) => assert_eq!(frame, &follower),
        other => panic!("expected follower frame, got {other:?}"),
    }
}

#[test]
fn test_discard_buffer_policy_drops_following_frame() {
    let mut corrupted = BytesMut::from(&sample_frame().to_bytes().unwrap()[..]);
    corrupted[MIN_FRAME_LEN] ^= 0x80;
    corrupted.extend_from_slice(&Frame::new(9, 9, 9, Body::ConnectionRequest).to_bytes().unwrap());

    let mut codec = FrameCodec::with_resync(ResyncPolicy::DiscardBuffer);
    let items = drain(&mut codec, &mut corrupted);

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Decoded::Rejected(_)));
    assert!(corrupted.is_empty());
}

#[test]
fn test_unknown_command_is_skipped() {
    let unknown = {
        // Valid framing around command 0x7E with an empty body.
        let mut raw = BytesMut::from(&Frame::new(1, 1, 1, Body::ConnectionRequest).to_bytes().unwrap()[..]);
        raw[5] = 0x7E;
        let crc = crc16::compute(&raw[..raw.len() - 4]);
        let crc_offset = raw.len() - 4;
        raw[crc_offset..crc_offset + 2].copy_from_slice(&crc.to_be_bytes());
        raw
    };
    let valid = Frame::new(2, 2, 2, Body::Heartbeat { battery: 1, status: 1 });

    let mut buf = unknown;
    buf.extend_from_slice(&valid.to_bytes().unwrap());

    let mut codec = FrameCodec::new();
    assert_eq!(frames(drain(&mut codec, &mut buf)), vec![valid]);
}

#[test]
fn test_short_payload_is_skipped() {
    let mut raw = BytesMut::from(&Frame::new(1, 1, 1, Body::ConnectionRequest).to_bytes().unwrap()[..]);
    // Relabel as a keyframe mark, whose 12-byte body is missing.
    raw[5] = 0x26;
    let crc_offset = raw.len() - 4;
    let crc = crc16::compute(&raw[..crc_offset]);
    raw[crc_offset..crc_offset + 2].copy_from_slice(&crc.to_be_bytes());

    let mut codec = FrameCodec::new();
    assert!(drain(&mut codec, &mut raw).is_empty());
    assert!(raw.is_empty());
}

#[test]
fn test_garbage_only_input_waits() {
    let mut buf = BytesMut::from(&[0x13u8, 0x37, 0x00, 0xFF, 0x55][..]);
    let mut codec = FrameCodec::new();

    assert!(drain(&mut codec, &mut buf).is_empty());
    assert!(buf.is_empty());
}

#[test]
fn test_marker_split_across_reads() {
    let encoded = sample_frame().to_bytes().unwrap();
    let mut buf = BytesMut::from(&[0x00, 0x01, encoded[0]][..]);
    let mut codec = FrameCodec::new();

    assert!(drain(&mut codec, &mut buf).is_empty());
    assert_eq!(&buf[..], &[0xAA]);

    buf.extend_from_slice(&encoded[1..]);
    assert_eq!(frames(drain(&mut codec, &mut buf)), vec![sample_frame()]);
}
