//! KBI firmware-update engine against a scripted link.

mod common;

use std::collections::VecDeque;
use std::time::Duration;

use common::*;
use indicatif::ProgressBar;
use kitool_lib::constants::CMD_FW_UP;
use kitool_lib::flash::{KbiFlashOptions, kbi_flash_device};
use kitool_lib::serial::KbiExchange;

/// A link that replays scripted responses and records traffic.
struct MockLink {
    responses: VecDeque<Result<KbiResponse, KiError>>,
    sent: Vec<KbiRequest>,
    commands: Vec<String>,
}

impl MockLink {
    fn new(responses: Vec<Result<KbiResponse, KiError>>) -> Self {
        Self {
            responses: responses.into(),
            sent: Vec::new(),
            commands: Vec::new(),
        }
    }
}

impl KbiExchange for MockLink {
    fn kbi_request(&mut self, request: &KbiRequest) -> Result<KbiResponse, KiError> {
        self.sent.push(request.clone());
        self.responses
            .pop_front()
            .unwrap_or(Err(KiError::ReadTimeout))
    }

    fn text_command(&mut self, command: &str) -> Result<Vec<String>, KiError> {
        self.commands.push(command.to_string());
        Ok(Vec::new())
    }
}

fn fast() -> KbiFlashOptions {
    KbiFlashOptions {
        retries: 5,
        retry_pause: Duration::ZERO,
    }
}

fn blocks(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| vec![i as u8; 64]).collect()
}

/// Value response echoing the opcode and block index, i.e. an ACK.
fn ack(block: u16) -> Result<KbiResponse, KiError> {
    Ok(response(0x21, CMD_FW_UP, &block.to_be_bytes()))
}

fn fwu_error() -> Result<KbiResponse, KiError> {
    Ok(response(0x27, CMD_FW_UP, &[]))
}

#[test]
fn happy_path_sends_every_block_and_resets() {
    let blocks = blocks(4);
    let mut link = MockLink::new((0..4).map(|b| ack(b as u16)).collect());
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: OK");
    assert_eq!(link.sent.len(), 4);
    assert_eq!(link.commands, vec!["reset"]);

    // Every request is a firmware-update command with the block index
    // prepended big-endian
    for (bnum, request) in link.sent.iter().enumerate() {
        assert_eq!(request.ftype(), 0x10);
        assert_eq!(request.code(), CMD_FW_UP);
        assert_eq!(&request.payload()[..2], &(bnum as u16).to_be_bytes());
        assert_eq!(request.payload().len(), 2 + 64);
    }
}

#[test]
fn fwu_error_aborts_the_device() {
    // Blocks 0..=6 acknowledged, block 7 answered with a firmware-update
    // error: no further blocks may be issued
    let mut responses: Vec<Result<KbiResponse, KiError>> = (0..7).map(|b| ack(b as u16)).collect();
    responses.push(fwu_error());
    let blocks = blocks(12);
    let mut link = MockLink::new(responses);
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: FWU error");
    assert_eq!(link.sent.len(), 8);
    assert!(link.commands.is_empty(), "no reset after an aborted flash");
}

#[test]
fn five_timeouts_exhaust_the_block_retries() {
    let blocks = blocks(2);
    let mut link = MockLink::new(Vec::new()); // every request times out
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: Could not send block #0 after 5 retries.");
    assert_eq!(link.sent.len(), 5);
}

#[test]
fn retry_counter_is_per_block() {
    // Block 0: two timeouts then an ACK; block 1: ACK straight away
    let responses = vec![
        Err(KiError::ReadTimeout),
        Err(KiError::Cobs),
        ack(0),
        ack(1),
    ];
    let blocks = blocks(2);
    let mut link = MockLink::new(responses);
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: OK");
    assert_eq!(link.sent.len(), 4);
}

#[test]
fn response_without_payload_is_not_an_acknowledgement() {
    // A value response with no payload must be retried, not taken as an ACK
    let responses = vec![Ok(response(0x21, CMD_FW_UP, &[])), ack(0)];
    let blocks = blocks(1);
    let mut link = MockLink::new(responses);
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: OK");
    assert_eq!(link.sent.len(), 2);
}

#[test]
fn mismatched_block_index_is_not_an_acknowledgement() {
    let responses = vec![ack(5), ack(0)];
    let blocks = blocks(1);
    let mut link = MockLink::new(responses);
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: OK");
    assert_eq!(link.sent.len(), 2);
}

#[test]
fn serial_failure_aborts_immediately() {
    let responses = vec![Err(KiError::Serial(serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        "gone",
    )))];
    let blocks = blocks(3);
    let mut link = MockLink::new(responses);
    let outcome = kbi_flash_device(&mut link, "KT123", &blocks, &fast(), &ProgressBar::hidden());

    assert_eq!(outcome, "KT123: Serial error");
    assert_eq!(link.sent.len(), 1);
}
