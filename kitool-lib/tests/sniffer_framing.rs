//! Sniffer frame-header recognition, timestamp reconstruction and PCAP
//! record layout.

mod common;

use kitool_lib::pcap::{PcapRecord, global_header};
use kitool_lib::sniffer::{FrameHeaderScanner, frame_usec, valid_channel};

fn scan(stream: &[u8]) -> Vec<(usize, u64, u8, u8, bool)> {
    let mut scanner = FrameHeaderScanner::new();
    let mut headers = Vec::new();
    let mut index = 0;
    while index < stream.len() {
        if let Some(info) = scanner.push(stream[index]) {
            headers.push((info.len, info.tstamp, info.rssi, info.lqi, info.micros));
            // Skip the PSDU the capture loop would read
            index += info.len;
        }
        index += 1;
    }
    headers
}

#[test]
fn legacy_header_with_u32_timestamp() {
    let mut stream = vec![0xC1, 0x1F, 0xFE, 0x72];
    stream.extend_from_slice(&5u16.to_be_bytes());
    stream.extend_from_slice(&0x10u32.to_be_bytes());
    stream.extend_from_slice(&[1, 2, 3, 4, 5]);

    let headers = scan(&stream);
    assert_eq!(headers, vec![(5, 0x10, 0, 0, false)]);
}

#[test]
fn snif_header_with_u64_timestamp() {
    let mut stream = vec![0x53, 0x4E, 0x49, 0x46];
    stream.extend_from_slice(&3u16.to_be_bytes());
    stream.extend_from_slice(&0x0000_0001_0000_0002u64.to_be_bytes());
    stream.extend_from_slice(&[9, 9, 9]);

    let headers = scan(&stream);
    assert_eq!(headers, vec![(3, 0x0000_0001_0000_0002, 0, 0, false)]);
}

#[test]
fn rssi_variant_splits_timestamp_field() {
    let mut stream = vec![0xB8, 0x97, 0x8C, 0x97];
    stream.extend_from_slice(&1u16.to_be_bytes());
    // RSSI 0xD8 (-40 dBm), LQI 0x60, 48-bit timestamp 0x123456
    let field = (0xD8u64 << 56) | (0x60u64 << 48) | 0x0012_3456;
    stream.extend_from_slice(&field.to_be_bytes());
    stream.push(0xAA);

    let headers = scan(&stream);
    assert_eq!(headers, vec![(1, 0x0012_3456, 0xD8, 0x60, false)]);
}

#[test]
fn microsecond_variant_sets_unit_flag() {
    let mut stream = vec![0xC0, 0x97, 0x8C, 0x97];
    stream.extend_from_slice(&2u16.to_be_bytes());
    stream.extend_from_slice(&0x99u64.to_be_bytes());
    stream.extend_from_slice(&[0, 0]);

    let headers = scan(&stream);
    assert_eq!(headers, vec![(2, 0x99, 0, 0, true)]);
}

#[test]
fn garbage_before_magic_is_skipped() {
    let mut stream = vec![0x00, 0xFF, 0xC1, 0x42, 0xC1, 0x1F, 0xFE, 0x72];
    stream.extend_from_slice(&1u16.to_be_bytes());
    stream.extend_from_slice(&0u32.to_be_bytes());
    stream.push(0x55);

    let headers = scan(&stream);
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].0, 1);
}

#[test]
fn timestamp_reconstruction_units() {
    let start = 1_700_000_000_000_000u64;
    assert_eq!(frame_usec(start, 0x10, false), start + 0x10 * 16);
    assert_eq!(frame_usec(start, 0x10, true), start + 0x10);
}

#[test]
fn channel_bounds() {
    assert!(!valid_channel(10));
    assert!(valid_channel(11));
    assert!(valid_channel(26));
    assert!(!valid_channel(27));
}

#[test]
fn global_header_layout() {
    let raw = global_header(false);
    assert_eq!(&raw[0..4], &0xA1B2_C3D4u32.to_be_bytes());
    assert_eq!(&raw[4..6], &2u16.to_be_bytes());
    assert_eq!(&raw[6..8], &4u16.to_be_bytes());
    assert_eq!(&raw[16..20], &0xFFFFu32.to_be_bytes());
    assert_eq!(&raw[20..24], &195u32.to_be_bytes());

    let tap = global_header(true);
    assert_eq!(&tap[20..24], &283u32.to_be_bytes());
}

#[test]
fn raw_record_layout() {
    let psdu = [1u8, 2, 3, 4, 5];
    let usec = 1_700_000_000_000_000u64 + 0x10 * 16;
    let record = PcapRecord::new(&psdu, false, usec, 0, 0, 15);
    let raw = record.as_bytes();

    assert_eq!(&raw[0..4], &((usec / 1_000_000) as u32).to_be_bytes());
    assert_eq!(&raw[4..8], &((usec % 1_000_000) as u32).to_be_bytes());
    assert_eq!(&raw[8..12], &5u32.to_be_bytes()); // incl_len
    assert_eq!(&raw[12..16], &5u32.to_be_bytes()); // orig_len
    assert_eq!(&raw[16..], &psdu);
}

#[test]
fn tap_record_layout() {
    let psdu = [0xAAu8; 7];
    let record = PcapRecord::new(&psdu, true, 2_000_000, 0xD8, 0x60, 26);
    let raw = record.as_bytes();

    // Record header counts the 36-octet TAP block
    assert_eq!(&raw[8..12], &43u32.to_be_bytes());
    assert_eq!(&raw[12..16], &43u32.to_be_bytes());

    // TAP header: version 0, reserved 0, length 36 little-endian
    let tap = &raw[16..];
    assert_eq!(&tap[0..4], &[0x00, 0x00, 0x24, 0x00]);

    // FCS type TLV: type 0, length 1, 16-bit CRC
    assert_eq!(&tap[4..12], &[0, 0, 1, 0, 1, 0, 0, 0]);
    // RSS TLV: type 1, length 4, f32 dBm
    assert_eq!(&tap[12..16], &[1, 0, 4, 0]);
    assert_eq!(&tap[16..20], &(-40f32).to_le_bytes());
    // LQI TLV: type 10, length 1
    assert_eq!(&tap[20..28], &[10, 0, 1, 0, 0x60, 0, 0, 0]);
    // Channel TLV: type 3, length 3, channel 26, page 0
    assert_eq!(&tap[28..36], &[3, 0, 3, 0, 26, 0, 0, 0]);
    // PSDU follows the TAP block
    assert_eq!(&tap[36..], &psdu);
}
