//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use kitool_lib::cobs::{CobsStatus, Decoder, Encoder, encode_frame};
#[allow(unused_imports)]
pub use kitool_lib::error::KiError;
#[allow(unused_imports)]
pub use kitool_lib::frame::{
    CC_EXEC, CC_READ, CC_WRITE, FrameClass, KbiRequest, KbiResponse, Notification, ResponseCode,
    type_octet, xor_checksum,
};

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

/// Build a wire frame from parts; requests and responses share the layout.
#[allow(dead_code)]
pub fn frame_bytes(ftype: u8, code: u8, payload: &[u8]) -> Vec<u8> {
    KbiRequest::from_parts(ftype, code, payload)
        .expect("frame within length bounds")
        .as_bytes()
        .to_vec()
}

/// Parse a response frame built from parts.
#[allow(dead_code)]
pub fn response(ftype: u8, code: u8, payload: &[u8]) -> KbiResponse {
    KbiResponse::parse(&frame_bytes(ftype, code, payload)).expect("self-built frame is valid")
}

/// Feed a full byte stream to a decoder, returning the first completed frame.
#[allow(dead_code)]
pub fn decode_stream(stream: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = Decoder::new();
    for &byte in stream {
        match decoder.feed(byte) {
            CobsStatus::Pending => {}
            CobsStatus::Complete(size) => return Some(decoder.data()[..size].to_vec()),
            CobsStatus::Invalid => return None,
        }
    }
    None
}
