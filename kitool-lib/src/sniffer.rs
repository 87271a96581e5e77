//! 802.15.4 sniffer pipeline.
//!
//! The sniffer firmware streams captured PSDUs over the serial link, each
//! preceded by a vendor frame header. Four header framings exist:
//!
//! ```text
//! |  4 bytes     | 2 bytes |   4 bytes          | Packet |
//! | c11ffe72     |  Length | Timestamp[symbols] | ...    |
//!
//! |  4 bytes     | 2 bytes |   8 bytes          | Packet |
//! | 534e4946     |  Length | Timestamp[symbols] | ...    |
//!
//! |  4 bytes     | 2 bytes | 1 byte | 1 byte |  6 bytes           | Packet |
//! | b8978c97     |  Length |  RSSI  |  LQI   | Timestamp[symbols] | ...    |
//!
//! |  4 bytes     | 2 bytes | 1 byte | 1 byte |  6 bytes           | Packet |
//! | c0978c97     |  Length |  RSSI  |  LQI   | Timestamp[us]      | ...    |
//! ```
//!
//! The capture loop scans the stream with a rolling window, reads each PSDU,
//! reconstructs an absolute microsecond timestamp and fans the resulting
//! PCAP record out to the configured sinks.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use chrono::Utc;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::constants::{
    CHANNEL_MAX, CHANNEL_MIN, MAGIC_LEGACY_U32, MAGIC_RSSI_MICROS, MAGIC_RSSI_SYMBOLS, MAGIC_SNIF,
    SYMBOL_US,
};
use crate::error::KiError;
use crate::pcap::{CaptureSink, FileSink, PcapRecord};
use crate::serial::KiSerial;

/// Firmware name marker reported by `show swver` on sniffer builds.
const SNIFFER_FW: &str = "Sniffer";

#[derive(Debug, Clone, Copy)]
struct HeaderVariant {
    magic: u32,
    /// 8-byte timestamp field instead of 4
    wide: bool,
    /// RSSI/LQI occupy the top 16 bits of the timestamp field
    has_rssi: bool,
    /// Timestamp in microseconds instead of 16-µs symbols
    micros: bool,
}

static VARIANTS: &[HeaderVariant] = &[
    HeaderVariant { magic: MAGIC_LEGACY_U32, wide: false, has_rssi: false, micros: false },
    HeaderVariant { magic: MAGIC_SNIF, wide: true, has_rssi: false, micros: false },
    HeaderVariant { magic: MAGIC_RSSI_SYMBOLS, wide: true, has_rssi: true, micros: false },
    HeaderVariant { magic: MAGIC_RSSI_MICROS, wide: true, has_rssi: true, micros: true },
];

/// A recognised frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// PSDU length in octets
    pub len: usize,
    /// Raw 48-bit timestamp
    pub tstamp: u64,
    pub rssi: u8,
    pub lqi: u8,
    /// Timestamp unit: microseconds rather than symbols
    pub micros: bool,
}

/// Rolling scanner matching the four header framings on a byte stream.
#[derive(Debug, Default)]
pub struct FrameHeaderScanner {
    bytes: Vec<u8>,
    variant: Option<HeaderVariant>,
}

impl FrameHeaderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte; returns the frame info once a full header has been
    /// read.
    pub fn push(&mut self, byte: u8) -> Option<FrameInfo> {
        self.bytes.push(byte);
        match self.variant {
            None => {
                if self.bytes.len() == 4 {
                    let magic = BigEndian::read_u32(&self.bytes);
                    match VARIANTS.iter().find(|v| v.magic == magic) {
                        Some(variant) => self.variant = Some(*variant),
                        None => {
                            self.bytes.remove(0);
                        }
                    }
                }
                None
            }
            Some(variant) => {
                let footer = 2 + if variant.wide { 8 } else { 4 };
                if self.bytes.len() < 4 + footer {
                    return None;
                }
                let len = BigEndian::read_u16(&self.bytes[4..6]) as usize;
                let raw = if variant.wide {
                    BigEndian::read_u64(&self.bytes[6..14])
                } else {
                    u64::from(BigEndian::read_u32(&self.bytes[6..10]))
                };
                let (rssi, lqi) = if variant.has_rssi {
                    ((raw >> 56) as u8, (raw >> 48) as u8)
                } else {
                    (0, 0)
                };
                let info = FrameInfo {
                    len,
                    tstamp: raw & 0x0000_FFFF_FFFF_FFFF,
                    rssi,
                    lqi,
                    micros: variant.micros,
                };
                self.bytes.clear();
                self.variant = None;
                Some(info)
            }
        }
    }
}

/// Absolute capture timestamp in microseconds from a raw header timestamp.
pub fn frame_usec(init_ts: u64, tstamp: u64, micros: bool) -> u64 {
    if micros {
        init_ts + tstamp
    } else {
        init_ts + tstamp * SYMBOL_US
    }
}

/// A capture channel is one of the 2.4 GHz 802.15.4 channels.
pub fn valid_channel(channel: u8) -> bool {
    (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
}

type Sinks = Vec<Box<dyn CaptureSink + Send>>;

/// Sniffer device driving the capture pipeline.
pub struct KiSniffer {
    serial: KiSerial,
    sinks: Sinks,
    thread: Option<JoinHandle<Sinks>>,
    is_running: Arc<AtomicBool>,
    init_ts: u64,
    channel: u8,
    link_type_tap: bool,
}

impl KiSniffer {
    /// Whether the device on `port_name` runs sniffer firmware.
    pub fn is_sniffer(port_name: &str) -> bool {
        match KiSerial::open(port_name) {
            Ok(mut device) => device.is_valid() && has_sniffer_fw(&mut device),
            Err(_) => false,
        }
    }

    pub fn new(port_name: &str, link_type_tap: bool) -> Result<Self, KiError> {
        let serial = KiSerial::open(port_name)?;
        let mut sniffer = Self {
            serial,
            sinks: Vec::new(),
            thread: None,
            is_running: Arc::new(AtomicBool::new(false)),
            init_ts: 0,
            channel: 0,
            link_type_tap,
        };
        sniffer.reset()?;
        Ok(sniffer)
    }

    /// Leave any joined network so the radio is free for capturing.
    fn reset(&mut self) -> Result<(), KiError> {
        let status = self.serial.command("show status").unwrap_or_default();
        if status.first().map(String::as_str) == Some("none") {
            return Ok(());
        }
        self.serial.command("clear")?;
        Ok(())
    }

    /// Add a file sink; a `Capture_<port>_<timestamp>.pcapng` name in the
    /// working directory is generated when none is given.
    pub fn add_file_sink(&mut self, path: Option<PathBuf>) -> Result<PathBuf, KiError> {
        let path = match path {
            Some(path) => path,
            None => {
                let port = self
                    .serial
                    .name()
                    .rsplit(['/', '\\'])
                    .next()
                    .unwrap_or("capture")
                    .to_string();
                let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
                PathBuf::from(format!("Capture_{port}_{stamp}.pcapng"))
            }
        };
        let sink = FileSink::create(&path, self.link_type_tap)?;
        self.sinks.push(Box::new(sink));
        Ok(path)
    }

    /// Add a pipe sink for a live consumer and return its path.
    #[cfg(unix)]
    pub fn add_pipe_sink(&mut self) -> Result<String, KiError> {
        let name = format!("/tmp/Kirale{}", Utc::now().timestamp());
        let sink = crate::pcap::FifoSink::create(&name, self.link_type_tap)?;
        self.sinks.push(Box::new(sink));
        Ok(name)
    }

    #[cfg(windows)]
    pub fn add_pipe_sink(&mut self) -> Result<String, KiError> {
        let name = format!(r"\\.\pipe\Kirale{}", Utc::now().timestamp());
        let sink = crate::pcap::PipeSink::create(&name, self.link_type_tap)?;
        self.sinks.push(Box::new(sink));
        Ok(name)
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Configure the capture channel. Rejected while a capture runs.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), KiError> {
        if self.is_running() {
            return Err(KiError::CaptureRunning);
        }
        if !valid_channel(channel) {
            return Err(KiError::ChannelOutOfRange(channel));
        }
        self.serial.command(&format!("config channel {channel}"))?;
        self.channel = channel;
        Ok(())
    }

    /// Start capturing on the given channel: start the sinks, configure the
    /// channel, bring the interface up and spawn the capture thread.
    pub fn start(&mut self, channel: u8) -> Result<(), KiError> {
        self.init_ts = Utc::now().timestamp_micros() as u64;

        for sink in &mut self.sinks {
            sink.start()?;
        }
        self.set_channel(channel)?;
        self.serial.command_opts("ifup", true)?;

        self.is_running.store(true, Ordering::Relaxed);
        let port = self.serial.try_clone_port()?;
        let sinks = std::mem::take(&mut self.sinks);
        let run = Arc::clone(&self.is_running);
        let init_ts = self.init_ts;
        let link_type_tap = self.link_type_tap;
        let channel = u16::from(self.channel);
        self.thread = Some(thread::spawn(move || {
            capture_loop(port, sinks, run, init_ts, link_type_tap, channel)
        }));
        info!(channel = self.channel, "capture started");
        Ok(())
    }

    /// Stop the capture: drain the reader thread, take the interface down,
    /// flush the serial buffers after the stop command, release the sinks.
    pub fn stop(&mut self) -> Result<(), KiError> {
        self.is_running.store(false, Ordering::Relaxed);
        let mut sinks = match self.thread.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => std::mem::take(&mut self.sinks),
        };
        self.serial.command_opts("ifdown", true)?;
        // Allow for the last packet before flushing
        thread::sleep(Duration::from_millis(500));
        self.serial.flush_buffers()?;
        for sink in &mut sinks {
            if let Err(err) = sink.stop() {
                warn!("sink stop failed: {err}");
            }
        }
        info!("capture stopped");
        Ok(())
    }

    /// Take the interface down without touching the sinks.
    pub fn close(&mut self) {
        let _ = self.serial.command_opts("ifdown", true);
    }
}

fn has_sniffer_fw(device: &mut KiSerial) -> bool {
    device
        .command("show swver")
        .ok()
        .and_then(|lines| lines.last().cloned())
        .is_some_and(|swver| swver.contains(SNIFFER_FW))
}

fn capture_loop(
    mut port: Box<dyn SerialPort>,
    mut sinks: Sinks,
    run: Arc<AtomicBool>,
    init_ts: u64,
    link_type_tap: bool,
    channel: u16,
) -> Sinks {
    let mut scanner = FrameHeaderScanner::new();
    while run.load(Ordering::Relaxed) {
        let mut byte = [0u8; 1];
        let n = match port.read(&mut byte) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                warn!("capture read failed: {err}");
                break;
            }
        };
        if n == 0 {
            continue;
        }
        let Some(info) = scanner.push(byte[0]) else {
            continue;
        };
        let mut psdu = vec![0u8; info.len];
        if let Err(err) = port.read_exact(&mut psdu) {
            // Short read: abandon this record
            debug!("short PSDU read: {err}");
            continue;
        }
        let usec = frame_usec(init_ts, info.tstamp, info.micros);
        let record = PcapRecord::new(&psdu, link_type_tap, usec, info.rssi, info.lqi, channel);
        for sink in &mut sinks {
            if let Err(err) = sink.handle(&record) {
                warn!("sink write failed: {err}");
            }
        }
    }
    sinks
}
