//! Serial transports for KiNOS devices.
//!
//! Two link modes exist and are detected at connect time:
//!
//! - **KBI** (UART): COBS-framed binary request/response frames plus
//!   asynchronous notifications.
//! - **KSH** (USB CDC): a text shell terminated by the `kinos@local:~$ `
//!   prompt; lines starting with `#` are device log output.
//!
//! [`KiSerial`] is the simple polling transport. [`KiSerialThreaded`] runs a
//! reader and a writer thread over two bounded queues so notifications and
//! log lines are captured in real time; notifications are routed to the log
//! channel and never into the response queue. Within one transport requests
//! are totally ordered: a new request is only issued once the previous one's
//! response, error or timeout has been observed.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, trace, warn};

use crate::cobs::{self, CobsStatus, Decoder};
use crate::constants::{KI_BAUD_RATE, KIRALE_VID, KSH_PROMPT};
use crate::error::KiError;
use crate::frame::{KbiRequest, KbiResponse};

/// Per-read timeout on the underlying port.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Per-response timeout for a command round-trip.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause before the single automatic retry.
const RETRY_PAUSE: Duration = Duration::from_millis(100);
/// Depth of the reader/writer queues. One outstanding request at a time
/// keeps these nearly empty.
const QUEUE_DEPTH: usize = 8;

/// Link mode of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PortMode {
    #[strum(to_string = "KBI")]
    Kbi,
    #[strum(to_string = "KSH")]
    Ksh,
}

/// A device attached through USB CDC exposes the text shell; anything else
/// (a UART bridge) speaks the binary interface.
pub fn detect_mode(port_name: &str) -> PortMode {
    if let Ok(ports) = serialport::available_ports() {
        for info in ports {
            if info.port_name == port_name
                && let serialport::SerialPortType::UsbPort(usb) = &info.port_type
                && usb.vid == KIRALE_VID
            {
                return PortMode::Ksh;
            }
        }
    }
    PortMode::Kbi
}

/// Split accumulated KSH output into response lines and `#` log lines,
/// stripping the prompt sentinel.
pub fn split_ksh_output(raw: &str) -> (Vec<String>, Vec<String>) {
    let cleaned = raw.replace(KSH_PROMPT, "");
    let mut response = Vec::new();
    let mut logs = Vec::new();
    for line in cleaned.lines() {
        if line.starts_with('#') {
            logs.push(line.to_string());
        } else {
            response.push(line.to_string());
        }
    }
    (response, logs)
}

fn serial_err(err: io::Error) -> KiError {
    KiError::Serial(err.into())
}

fn transport_stopped() -> KiError {
    KiError::Serial(serialport::Error::new(
        serialport::ErrorKind::Unknown,
        "transport stopped",
    ))
}

fn contains_prompt(raw: &[u8]) -> bool {
    raw.windows(KSH_PROMPT.len())
        .any(|w| w == KSH_PROMPT.as_bytes())
}

fn latin1(raw: &[u8]) -> String {
    raw.iter().map(|b| *b as char).collect()
}

/// Reads that simply ran out of data before the port timeout.
fn is_read_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// The single KBI exchange seam. The firmware-update engine drives devices
/// through this trait so it can be exercised without hardware.
pub trait KbiExchange {
    /// One request/response round-trip, no retry policy applied.
    fn kbi_request(&mut self, request: &KbiRequest) -> Result<KbiResponse, KiError>;

    /// A text command through the full translation pipeline.
    fn text_command(&mut self, command: &str) -> Result<Vec<String>, KiError>;
}

/// Polling serial transport.
pub struct KiSerial {
    name: String,
    mode: PortMode,
    port: Box<dyn SerialPort>,
    logs: Vec<String>,
}

impl KiSerial {
    pub fn open(port_name: &str) -> Result<Self, KiError> {
        Self::open_with_baud(port_name, KI_BAUD_RATE)
    }

    pub fn open_with_baud(port_name: &str, baud: u32) -> Result<Self, KiError> {
        let mode = detect_mode(port_name);
        let port = serialport::new(port_name, baud).timeout(READ_TIMEOUT).open()?;
        info!(port = port_name, mode = %mode, "serial port opened");
        Ok(Self {
            name: port_name.to_string(),
            mode,
            port,
            logs: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PortMode {
        self.mode
    }

    /// A valid Kirale device reports a serial number starting with `KT`.
    pub fn is_valid(&mut self) -> bool {
        matches!(
            self.command("show snum"),
            Ok(lines) if lines.first().is_some_and(|l| l.starts_with("KT"))
        )
    }

    /// Whether the underlying port still answers status queries.
    pub fn is_active(&self) -> bool {
        self.port.bytes_to_read().is_ok()
    }

    /// Clone of the raw port handle, for the sniffer capture loop.
    pub fn try_clone_port(&self) -> Result<Box<dyn SerialPort>, KiError> {
        Ok(self.port.try_clone()?)
    }

    pub fn flush_buffers(&mut self) -> Result<(), KiError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    /// Send a text command and collect the response lines. Binary mode gets
    /// one automatic retry on a framing error or read timeout.
    pub fn command(&mut self, text: &str) -> Result<Vec<String>, KiError> {
        self.command_opts(text, false)
    }

    pub fn command_opts(&mut self, text: &str, no_response: bool) -> Result<Vec<String>, KiError> {
        match self.mode {
            PortMode::Kbi => {
                let request = KbiRequest::from_text(text)?;
                let response = match self.kbi_roundtrip(&request) {
                    Ok(response) => response,
                    Err(err @ KiError::Serial(_)) => return Err(err),
                    Err(err) => {
                        debug!(%err, "KBI round-trip failed, retrying once");
                        thread::sleep(RETRY_PAUSE);
                        self.kbi_roundtrip(&request).map_err(|retry_err| match retry_err {
                            KiError::Serial(inner) => KiError::Serial(inner),
                            _ => KiError::ReadTimeout,
                        })?
                    }
                };
                if response.code() != request.code() {
                    return Err(KiError::CodeMismatch);
                }
                Ok(response.to_text().lines().map(str::to_string).collect())
            }
            PortMode::Ksh => self.ksh_roundtrip(text, no_response),
        }
    }

    /// One binary round-trip: flush, encode, write, decode byte for byte.
    fn kbi_roundtrip(&mut self, request: &KbiRequest) -> Result<KbiResponse, KiError> {
        trace!(frame = %hex::encode(request.as_bytes()), "KBI request");
        let encoded = cobs::encode_frame(request.as_bytes());
        self.flush_buffers()?;
        self.port.write_all(&encoded).map_err(serial_err)?;

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut decoder = Decoder::new();
        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(n) if n > 0 => match decoder.feed(byte[0]) {
                    CobsStatus::Pending => {}
                    CobsStatus::Complete(size) => {
                        trace!(frame = %hex::encode(&decoder.data()[..size]), "KBI response");
                        return KbiResponse::parse(&decoder.data()[..size]);
                    }
                    CobsStatus::Invalid => return Err(KiError::Cobs),
                },
                Ok(_) => {}
                Err(err) if is_read_timeout(&err) => {}
                Err(err) => return Err(serial_err(err)),
            }
            if Instant::now() >= deadline {
                return Err(KiError::ReadTimeout);
            }
        }
    }

    /// One shell round-trip: CR-terminated command, accumulate until the
    /// prompt sentinel or the response deadline.
    fn ksh_roundtrip(&mut self, text: &str, no_response: bool) -> Result<Vec<String>, KiError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\r');
        self.port.write_all(line.as_bytes()).map_err(serial_err)?;
        if no_response {
            return Ok(Vec::new());
        }

        let mut raw = Vec::new();
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(n) if n > 0 => {
                    raw.push(byte[0]);
                    let pending = self.port.bytes_to_read().unwrap_or(0) as usize;
                    if pending > 0 {
                        let start = raw.len();
                        raw.resize(start + pending, 0);
                        let got = self.port.read(&mut raw[start..]).map_err(serial_err)?;
                        raw.truncate(start + got);
                    }
                    if contains_prompt(&raw) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) if is_read_timeout(&err) => {
                    debug!("KSH read timeout");
                }
                Err(err) => return Err(serial_err(err)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        let (response, logs) = split_ksh_output(&latin1(&raw));
        for log in &logs {
            info!(target: "device", "{log}");
        }
        self.logs.extend(logs);
        Ok(response)
    }

    /// Poll `show <key>` every second for up to 120 s until some response
    /// line is (or, with `inverse`, no longer is) one of `values`.
    pub fn wait_for(&mut self, key: &str, values: &[&str], inverse: bool) {
        for _ in 0..120 {
            let response = self.command(&format!("show {key}")).unwrap_or_default();
            let found = response.iter().any(|line| values.contains(&line.as_str()));
            if found != inverse {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    /// Enable device-side diagnostic logs for the given level and module.
    pub fn start_logs(&mut self, level: &str, module: &str) {
        self.logs.clear();
        let _ = self.command(&format!("debug module {module}"));
        let _ = self.command(&format!("debug level {level}"));
    }

    /// Stop device logs and return everything harvested so far.
    pub fn get_logs(&mut self, wait: u64) -> Vec<String> {
        for _ in 0..wait {
            let _ = self.command("");
            thread::sleep(Duration::from_secs(1));
        }
        let _ = self.command("debug module none");
        let _ = self.command("debug level none");
        let _ = self.flush_buffers();
        self.logs.clone()
    }
}

impl KbiExchange for KiSerial {
    fn kbi_request(&mut self, request: &KbiRequest) -> Result<KbiResponse, KiError> {
        self.kbi_roundtrip(request)
    }

    fn text_command(&mut self, command: &str) -> Result<Vec<String>, KiError> {
        self.command(command)
    }
}

enum Outgoing {
    Kbi(KbiRequest),
    Ksh { line: String, no_response: bool },
    Shutdown,
}

enum Incoming {
    Kbi(KbiResponse),
    DecodeFailure,
    Ksh(Vec<String>),
}

/// Threaded serial transport: a reader task and a writer task share two
/// bounded queues. Only the reader reads the port and only the writer
/// writes it.
pub struct KiSerialThreaded {
    name: String,
    mode: PortMode,
    port: Box<dyn SerialPort>,
    write_tx: SyncSender<Outgoing>,
    read_rx: Receiver<Incoming>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    run: Arc<AtomicBool>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl KiSerialThreaded {
    pub fn open(port_name: &str) -> Result<Self, KiError> {
        let mode = detect_mode(port_name);
        let port = serialport::new(port_name, KI_BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()?;
        Self::from_port(port, port_name, mode)
    }

    /// Wrap an already-open port. Used directly by tests with a pty pair.
    pub fn from_port(
        port: Box<dyn SerialPort>,
        name: &str,
        mode: PortMode,
    ) -> Result<Self, KiError> {
        let reader_port = port.try_clone()?;
        let writer_port = port.try_clone()?;
        let run = Arc::new(AtomicBool::new(true));
        let logs = Arc::new(Mutex::new(Vec::new()));
        let (write_tx, write_rx) = sync_channel(QUEUE_DEPTH);
        let (read_tx, read_rx) = sync_channel(QUEUE_DEPTH);

        let reader = {
            let run = Arc::clone(&run);
            let logs = Arc::clone(&logs);
            let tx = read_tx.clone();
            thread::spawn(move || reader_loop(reader_port, mode, run, tx, logs))
        };
        let writer = {
            let run = Arc::clone(&run);
            thread::spawn(move || writer_loop(writer_port, run, write_rx, read_tx))
        };

        info!(port = name, mode = %mode, "threaded transport started");
        Ok(Self {
            name: name.to_string(),
            mode,
            port,
            write_tx,
            read_rx,
            reader: Some(reader),
            writer: Some(writer),
            run,
            logs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PortMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.port.bytes_to_read().is_ok()
    }

    pub fn command(&mut self, text: &str) -> Result<Vec<String>, KiError> {
        self.command_opts(text, false)
    }

    pub fn command_opts(&mut self, text: &str, no_response: bool) -> Result<Vec<String>, KiError> {
        match self.mode {
            PortMode::Kbi => {
                let request = KbiRequest::from_text(text)?;
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    self.write_tx
                        .send(Outgoing::Kbi(request.clone()))
                        .map_err(|_| transport_stopped())?;
                    match self.read_rx.recv_timeout(RESPONSE_TIMEOUT) {
                        Ok(Incoming::Kbi(response)) => {
                            if response.code() != request.code() {
                                return Err(KiError::CodeMismatch);
                            }
                            return Ok(response.to_text().lines().map(str::to_string).collect());
                        }
                        Ok(Incoming::DecodeFailure) | Err(RecvTimeoutError::Timeout) => {
                            if attempt >= 2 {
                                return Err(KiError::ReadTimeout);
                            }
                            debug!("KBI exchange failed, retrying once");
                            thread::sleep(RETRY_PAUSE);
                        }
                        Ok(Incoming::Ksh(_)) => return Err(KiError::ReadTimeout),
                        Err(RecvTimeoutError::Disconnected) => return Err(transport_stopped()),
                    }
                }
            }
            PortMode::Ksh => {
                let mut line = String::with_capacity(text.len() + 1);
                line.push_str(text);
                line.push('\r');
                self.write_tx
                    .send(Outgoing::Ksh { line, no_response })
                    .map_err(|_| transport_stopped())?;
                match self.read_rx.recv_timeout(RESPONSE_TIMEOUT) {
                    Ok(Incoming::Ksh(lines)) => Ok(lines),
                    Ok(_) => Err(KiError::ReadTimeout),
                    Err(RecvTimeoutError::Timeout) => Err(KiError::ReadTimeout),
                    Err(RecvTimeoutError::Disconnected) => Err(transport_stopped()),
                }
            }
        }
    }

    /// Harvested device log lines and notifications.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Enable device-side diagnostic logs for the given level and module.
    pub fn start_logs(&mut self, level: &str, module: &str) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.clear();
        }
        let _ = self.command(&format!("debug module {module}"));
        let _ = self.command(&format!("debug level {level}"));
    }

    pub fn get_logs(&mut self, wait: u64) -> Vec<String> {
        thread::sleep(Duration::from_secs(wait));
        let _ = self.command("debug module none");
        let _ = self.command("debug level none");
        self.logs()
    }

    /// Stop both worker threads and release the port.
    pub fn close(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        let _ = self.write_tx.send(Outgoing::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!(port = %self.name, "transport closed");
    }
}

impl Drop for KiSerialThreaded {
    fn drop(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            self.close();
        }
    }
}

impl KbiExchange for KiSerialThreaded {
    fn kbi_request(&mut self, request: &KbiRequest) -> Result<KbiResponse, KiError> {
        self.write_tx
            .send(Outgoing::Kbi(request.clone()))
            .map_err(|_| transport_stopped())?;
        match self.read_rx.recv_timeout(RESPONSE_TIMEOUT) {
            Ok(Incoming::Kbi(response)) => Ok(response),
            Ok(Incoming::DecodeFailure) => Err(KiError::Cobs),
            Ok(Incoming::Ksh(_)) => Err(KiError::ReadTimeout),
            Err(RecvTimeoutError::Timeout) => Err(KiError::ReadTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(transport_stopped()),
        }
    }

    fn text_command(&mut self, command: &str) -> Result<Vec<String>, KiError> {
        self.command(command)
    }
}

fn reader_loop(
    mut port: Box<dyn SerialPort>,
    mode: PortMode,
    run: Arc<AtomicBool>,
    tx: SyncSender<Incoming>,
    logs: Arc<Mutex<Vec<String>>>,
) {
    let mut decoder = Decoder::new();
    let mut log_line = String::new();
    let mut in_log = false;
    let mut pending = String::new();
    let mut buf = [0u8; 256];

    while run.load(Ordering::Relaxed) {
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(err) if is_read_timeout(&err) => continue,
            Err(err) => {
                warn!("serial read failed: {err}");
                break;
            }
        };
        match mode {
            PortMode::Kbi => {
                for &byte in &buf[..n] {
                    match decoder.feed(byte) {
                        CobsStatus::Pending => {}
                        CobsStatus::Complete(size) => {
                            dispatch_frame(&decoder.data()[..size], &tx, &logs);
                            decoder.reset();
                        }
                        CobsStatus::Invalid => {
                            debug!("COBS framing error");
                            let _ = tx.send(Incoming::DecodeFailure);
                        }
                    }
                }
            }
            PortMode::Ksh => {
                for &byte in &buf[..n] {
                    let ch = byte as char;
                    if ch == '#' {
                        in_log = true;
                    }
                    if in_log {
                        if ch == '\n' {
                            in_log = false;
                            let line = std::mem::take(&mut log_line);
                            let line = line.trim_end_matches('\r').to_string();
                            info!(target: "device", "{line}");
                            if let Ok(mut logs) = logs.lock() {
                                logs.push(line);
                            }
                        } else {
                            log_line.push(ch);
                        }
                    } else {
                        pending.push(ch);
                    }
                }
                if pending.contains(KSH_PROMPT) {
                    let cleaned = pending.replace(KSH_PROMPT, "");
                    let response = cleaned.lines().map(str::to_string).collect();
                    let _ = tx.send(Incoming::Ksh(response));
                    pending.clear();
                }
            }
        }
    }
}

/// Route one complete decoded frame: notifications to the log channel,
/// responses to the response queue.
fn dispatch_frame(data: &[u8], tx: &SyncSender<Incoming>, logs: &Arc<Mutex<Vec<String>>>) {
    match KbiResponse::parse(data) {
        Ok(response) => {
            if let Some(notification) = response.notification() {
                let text = notification.to_string();
                info!(target: "device", "{text}");
                if let Ok(mut logs) = logs.lock() {
                    logs.push(text);
                }
            } else {
                let _ = tx.send(Incoming::Kbi(response));
            }
        }
        Err(err) => {
            debug!("invalid KBI frame: {err}");
            let _ = tx.send(Incoming::DecodeFailure);
        }
    }
}

fn writer_loop(
    mut port: Box<dyn SerialPort>,
    run: Arc<AtomicBool>,
    rx: Receiver<Outgoing>,
    tx: SyncSender<Incoming>,
) {
    while run.load(Ordering::Relaxed) {
        let job = match rx.recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        match job {
            Outgoing::Shutdown => break,
            Outgoing::Kbi(request) => {
                let encoded = cobs::encode_frame(request.as_bytes());
                let _ = port.clear(ClearBuffer::All);
                if let Err(err) = port.write_all(&encoded) {
                    warn!("serial write failed: {err}");
                    break;
                }
            }
            Outgoing::Ksh { line, no_response } => {
                if no_response {
                    let _ = tx.send(Incoming::Ksh(Vec::new()));
                }
                if let Err(err) = port.write_all(line.as_bytes()) {
                    warn!("serial write failed: {err}");
                    break;
                }
            }
        }
    }
}
