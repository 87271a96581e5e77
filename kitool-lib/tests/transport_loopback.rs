//! Threaded transport round-trip over a pseudo-terminal pair.
#![cfg(unix)]

mod common;

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use common::*;
use kitool_lib::cobs;
use kitool_lib::serial::{KiSerialThreaded, PortMode};
use serialport::{SerialPort, TTYPort};

/// Play the device side on the master end: decode one request, answer it.
fn device_side(mut port: TTYPort, responses: Vec<Vec<u8>>) {
    let mut decoder = Decoder::new();
    let mut served = 0;
    let mut byte = [0u8; 1];
    while served < responses.len() {
        match port.read(&mut byte) {
            Ok(1) => match decoder.feed(byte[0]) {
                CobsStatus::Complete(_) => {
                    decoder.reset();
                    let encoded = cobs::encode_frame(&responses[served]);
                    port.write_all(&encoded).expect("device write");
                    served += 1;
                }
                CobsStatus::Pending | CobsStatus::Invalid => {}
            },
            Ok(_) => {}
            Err(ref err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(_) => break,
        }
    }
}

#[test]
fn kbi_command_round_trip() {
    let (mut master, mut slave) = TTYPort::pair().expect("pty pair");
    master
        .set_timeout(Duration::from_millis(100))
        .expect("master timeout");
    slave
        .set_timeout(Duration::from_millis(100))
        .expect("slave timeout");

    // `show channel` answered with channel 15
    let device = thread::spawn(move || {
        device_side(master, vec![frame_bytes(0x21, 0x12, &[0x0F])]);
    });

    let mut transport =
        KiSerialThreaded::from_port(Box::new(slave), "pty-test", PortMode::Kbi).expect("transport");
    let lines = transport.command("show channel").expect("command");
    assert_eq!(lines, vec!["15".to_string()]);

    transport.close();
    device.join().expect("device thread");
}

#[test]
fn notification_goes_to_log_channel_not_response_queue() {
    let (mut master, mut slave) = TTYPort::pair().expect("pty pair");
    master
        .set_timeout(Duration::from_millis(100))
        .expect("master timeout");
    slave
        .set_timeout(Duration::from_millis(100))
        .expect("slave timeout");

    // The device interleaves a ping-reply notification before the response
    let device = thread::spawn(move || {
        let mut decoder = Decoder::new();
        let mut byte = [0u8; 1];
        loop {
            match master.read(&mut byte) {
                Ok(1) => {
                    if let CobsStatus::Complete(_) = decoder.feed(byte[0]) {
                        let mut ping = vec![0u8; 22];
                        ping[15] = 1;
                        ping[16..18].copy_from_slice(&64u16.to_be_bytes());
                        ping[18..20].copy_from_slice(&1u16.to_be_bytes());
                        ping[20..22].copy_from_slice(&2u16.to_be_bytes());
                        let notification = frame_bytes(0x30, 0x06, &ping);
                        let response = frame_bytes(0x21, 0x12, &[0x0F]);
                        master
                            .write_all(&cobs::encode_frame(&notification))
                            .expect("device write");
                        master
                            .write_all(&cobs::encode_frame(&response))
                            .expect("device write");
                        return;
                    }
                }
                Ok(_) => {}
                Err(ref err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return,
            }
        }
    });

    let mut transport =
        KiSerialThreaded::from_port(Box::new(slave), "pty-test", PortMode::Kbi).expect("transport");
    let lines = transport.command("show channel").expect("command");
    assert_eq!(lines, vec!["15".to_string()]);

    // The notification must have been captured on the log side
    let logs = transport.logs();
    assert_eq!(logs, vec!["# ping reply: saddr ::1 id 1 sq 2 - 64 bytes"]);

    transport.close();
    device.join().expect("device thread");
}

#[test]
fn timeout_then_retry_succeeds() {
    let (mut master, mut slave) = TTYPort::pair().expect("pty pair");
    master
        .set_timeout(Duration::from_millis(100))
        .expect("master timeout");
    slave
        .set_timeout(Duration::from_millis(100))
        .expect("slave timeout");

    // Stay silent for the first request, answer the retry
    let device = thread::spawn(move || {
        let mut decoder = Decoder::new();
        let mut requests = 0;
        let mut byte = [0u8; 1];
        while requests < 2 {
            match master.read(&mut byte) {
                Ok(1) => {
                    if let CobsStatus::Complete(_) = decoder.feed(byte[0]) {
                        decoder.reset();
                        requests += 1;
                        if requests == 2 {
                            let response = frame_bytes(0x21, 0x0A, b"KiNOS Sniffer v2.0");
                            master
                                .write_all(&cobs::encode_frame(&response))
                                .expect("device write");
                        }
                    }
                }
                Ok(_) => {}
                Err(ref err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return,
            }
        }
    });

    let mut transport =
        KiSerialThreaded::from_port(Box::new(slave), "pty-test", PortMode::Kbi).expect("transport");
    let lines = transport.command("show swver").expect("command succeeds on retry");
    assert_eq!(lines, vec!["KiNOS Sniffer v2.0".to_string()]);

    transport.close();
    device.join().expect("device thread");
}
