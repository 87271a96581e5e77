//! COBS encoder/decoder round-trips over KBI-framed payloads.

mod common;

use common::*;
use rand::prelude::*;

/// Encode a KBI frame and decode it byte for byte; the decoder must complete
/// with exactly the frame bytes.
fn round_trip(ftype: u8, code: u8, payload: &[u8]) {
    let frame = frame_bytes(ftype, code, payload);
    let encoded = encode_frame(&frame);
    assert!(
        !encoded[1..].contains(&0),
        "encoded frame must be free of zero bytes"
    );
    let decoded = decode_stream(&encoded).expect("decoder must complete");
    assert_eq!(decoded, frame);
}

#[test]
fn empty_payload_round_trip() {
    round_trip(type_octet(FrameClass::Request, CC_READ), 0x0A, &[]);
}

#[test]
fn single_byte_payload_round_trip() {
    round_trip(type_octet(FrameClass::Request, CC_WRITE), 0x12, &[0x0F]);
}

#[test]
fn all_zero_payload_round_trip() {
    round_trip(0x21, 0x20, &[0u8; 128]);
}

#[test]
fn no_zero_payload_round_trip() {
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 255 + 1) as u8).collect();
    round_trip(0x21, 0x2C, &payload);
}

#[test]
fn long_data_block_round_trip() {
    // 0xCF non-zero octets exercise the long-data continuation code
    round_trip(0x21, 0x2C, &[0xAB; 0xCF]);
}

#[test]
fn embedded_double_zero_round_trip() {
    let mut payload = vec![0x11, 0x22];
    payload.extend_from_slice(&[0x00, 0x00]);
    payload.extend_from_slice(&[0x33, 0x44]);
    round_trip(0x21, 0x2C, &payload);
}

#[test]
fn random_payload_round_trips() {
    let mut rng = StdRng::seed_from_u64(0x4B49);
    for _ in 0..200 {
        let len = rng.random_range(0..2048);
        let zero_bias: f64 = rng.random_range(0.0..1.0);
        let payload: Vec<u8> = (0..len)
            .map(|_| {
                if rng.random_bool(zero_bias) {
                    0
                } else {
                    rng.random_range(1..=255) as u8
                }
            })
            .collect();
        round_trip(0x21, 0x2C, &payload);
    }
}

#[test]
fn zero_run_payload_round_trips() {
    // Runs around the 14/15-zero code boundaries
    for zeros in [2usize, 3, 13, 14, 15, 16, 17, 29, 30, 31, 45] {
        let mut payload = vec![0x7F];
        payload.extend(std::iter::repeat_n(0u8, zeros));
        payload.push(0x7F);
        round_trip(0x21, 0x2C, &payload);
    }
}

#[test]
fn decoder_resynchronises_after_garbage() {
    let frame = frame_bytes(0x21, 0x12, &[0x0F]);
    let mut stream = vec![0xFF, 0xD1, 0x42];
    stream.push(0x00); // delimiter
    stream.extend(encode_frame(&frame)[1..].iter());

    let mut decoder = Decoder::new();
    let mut complete = None;
    for &byte in &stream {
        match decoder.feed(byte) {
            CobsStatus::Complete(size) => {
                complete = Some(decoder.data()[..size].to_vec());
                break;
            }
            CobsStatus::Pending | CobsStatus::Invalid => {}
        }
    }
    assert_eq!(complete, Some(frame));
}

#[test]
fn two_frames_back_to_back() {
    let first = frame_bytes(0x21, 0x12, &[0x0F]);
    let second = frame_bytes(0x21, 0x0A, b"KiNOS");
    let mut stream = encode_frame(&first);
    stream.extend(encode_frame(&second));

    let mut decoder = Decoder::new();
    let mut frames = Vec::new();
    for &byte in &stream {
        if let CobsStatus::Complete(size) = decoder.feed(byte) {
            frames.push(decoder.data()[..size].to_vec());
            decoder.reset();
        }
    }
    assert_eq!(frames, vec![first, second]);
}
