//! DFU image suffix validation and GETSTATUS parsing.

use kitool_lib::dfu::{DfuFile, DfuState, DfuStatus, DfuStatusResult};

/// Assemble an image with the 16-octet trailing suffix.
fn image(body_len: usize, signature: &[u8; 3]) -> Vec<u8> {
    let mut raw: Vec<u8> = (0..body_len).map(|i| (i % 251) as u8).collect();
    raw.extend_from_slice(&0x0102u16.to_le_bytes()); // fwVersion
    raw.extend_from_slice(&0x0003u16.to_le_bytes()); // pid
    raw.extend_from_slice(&0x2DEFu16.to_le_bytes()); // vid
    raw.extend_from_slice(&0x0110u16.to_le_bytes()); // dfuSpec
    raw.extend_from_slice(signature);
    raw.push(16); // suffix length
    raw.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes()); // crc
    raw
}

#[test]
fn valid_suffix_is_parsed() {
    let raw = image(300, b"UFD");
    let file = DfuFile::from_bytes(&raw).expect("valid image");
    assert_eq!(file.data.len(), 300);
    assert_eq!(file.fw_version, 0x0102);
    assert_eq!(file.pid, 0x0003);
    assert_eq!(file.vid, 0x2DEF);
    assert_eq!(file.dfu_spec, 0x0110);
}

#[test]
fn bad_signature_is_rejected() {
    let raw = image(300, b"DFU");
    assert!(DfuFile::from_bytes(&raw).is_err());
}

#[test]
fn short_file_is_rejected() {
    assert!(DfuFile::from_bytes(&[0u8; 15]).is_err());
    // 16 octets with a valid signature is an empty but well-formed image
    let raw = image(0, b"UFD");
    let file = DfuFile::from_bytes(&raw).expect("empty image");
    assert!(file.data.is_empty());
    assert_eq!(file.block_count(), 0);
}

#[test]
fn blocks_are_64_octets_with_short_tail() {
    let raw = image(150, b"UFD");
    let file = DfuFile::from_bytes(&raw).expect("valid image");
    let blocks: Vec<&[u8]> = file.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert_eq!(file.block_count(), 3);
    assert_eq!(blocks[0].len(), 64);
    assert_eq!(blocks[1].len(), 64);
    assert_eq!(blocks[2].len(), 22);
    assert_eq!(blocks[0][0], file.data[0]);
}

#[test]
fn open_reads_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("image.dfu");
    std::fs::write(&path, image(128, b"UFD")).expect("write image");
    let file = DfuFile::open(&path).expect("valid image");
    assert_eq!(file.data.len(), 128);
}

#[test]
fn get_status_payload_parsing() {
    // status OK, poll timeout 0x000320 ms (800), state DFU_DNLOAD_BUSY
    let raw = [0x00, 0x20, 0x03, 0x00, 0x04, 0x00];
    let status = DfuStatusResult::parse(&raw).expect("well-formed");
    assert_eq!(status.status, DfuStatus::Ok);
    assert_eq!(status.poll_timeout_ms, 800);
    assert_eq!(status.state, DfuState::DownloadBusy);

    assert!(DfuStatusResult::parse(&raw[..5]).is_err());
}

#[test]
fn state_values_match_the_dfu_spec() {
    assert_eq!(u8::from(DfuState::DfuIdle), 0x02);
    assert_eq!(u8::from(DfuState::DownloadBusy), 0x04);
    assert_eq!(u8::from(DfuState::DownloadIdle), 0x05);
    assert_eq!(u8::from(DfuState::ManifestSync), 0x06);
    assert_eq!(u8::from(DfuState::Error), 0x0A);
}
