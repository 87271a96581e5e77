//! libpcap emission for captured 802.15.4 frames.
//!
//! Records either carry the raw PSDU (link type 195) or wrap it in an IEEE
//! 802.15.4 TAP header with RSSI/LQI/channel TLVs (link type 283). All
//! libpcap fields are big-endian; the TAP header and TLV payloads are
//! little-endian, and the TAP block length is a multiple of 4.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::constants::{LINKTYPE_IEEE802_15_4, LINKTYPE_IEEE802_15_4_TAP};
use crate::error::KiError;

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 0xFFFF;

/// TAP header plus the four fixed TLVs (8 octets each).
const TAP_BLOCK_LEN: usize = 4 + 4 * 8;

/// The 24-octet libpcap global header.
pub fn global_header(link_type_tap: bool) -> [u8; 24] {
    let network = if link_type_tap {
        LINKTYPE_IEEE802_15_4_TAP
    } else {
        LINKTYPE_IEEE802_15_4
    };
    let mut header = [0u8; 24];
    header[0..4].copy_from_slice(&PCAP_MAGIC.to_be_bytes());
    header[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_be_bytes());
    header[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_be_bytes());
    // thiszone (i32) and sigfigs stay zero
    header[16..20].copy_from_slice(&PCAP_SNAPLEN.to_be_bytes());
    header[20..24].copy_from_slice(&network.to_be_bytes());
    header
}

/// One libpcap record, ready to write to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PcapRecord {
    bytes: Vec<u8>,
}

impl PcapRecord {
    pub fn new(psdu: &[u8], link_type_tap: bool, usec: u64, rssi: u8, lqi: u8, channel: u16) -> Self {
        let tap_len = if link_type_tap { TAP_BLOCK_LEN } else { 0 };
        let total = psdu.len() + tap_len;
        let mut bytes = Vec::with_capacity(16 + total);

        // Record header, big-endian
        bytes.extend_from_slice(&((usec / 1_000_000) as u32).to_be_bytes());
        bytes.extend_from_slice(&((usec % 1_000_000) as u32).to_be_bytes());
        bytes.extend_from_slice(&(total as u32).to_be_bytes());
        bytes.extend_from_slice(&(total as u32).to_be_bytes());

        if link_type_tap {
            // TAP header: version 0, reserved 0, total block length
            bytes.push(0);
            bytes.push(0);
            bytes.extend_from_slice(&(TAP_BLOCK_LEN as u16).to_le_bytes());
            // FCS type TLV: 16-bit CRC
            bytes.extend_from_slice(&0u16.to_le_bytes());
            bytes.extend_from_slice(&1u16.to_le_bytes());
            bytes.extend_from_slice(&1u32.to_le_bytes());
            // RSS TLV: signal strength in dBm as f32
            bytes.extend_from_slice(&1u16.to_le_bytes());
            bytes.extend_from_slice(&4u16.to_le_bytes());
            bytes.extend_from_slice(&f32::from(rssi as i8).to_le_bytes());
            // LQI TLV
            bytes.extend_from_slice(&10u16.to_le_bytes());
            bytes.extend_from_slice(&1u16.to_le_bytes());
            bytes.extend_from_slice(&u32::from(lqi).to_le_bytes());
            // Channel TLV: channel number, page 0
            bytes.extend_from_slice(&3u16.to_le_bytes());
            bytes.extend_from_slice(&3u16.to_le_bytes());
            bytes.extend_from_slice(&channel.to_le_bytes());
            bytes.extend_from_slice(&0u16.to_le_bytes());
        }

        bytes.extend_from_slice(psdu);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Lifecycle shared by every capture output.
pub trait CaptureSink: Send {
    /// Prepare the output and write the global header.
    fn start(&mut self) -> Result<(), KiError>;
    /// Deliver one record.
    fn handle(&mut self, record: &PcapRecord) -> Result<(), KiError>;
    /// Release the output.
    fn stop(&mut self) -> Result<(), KiError>;
}

/// Capture sink writing to a regular file, flushed per record so a viewer
/// can follow the file live.
pub struct FileSink {
    path: PathBuf,
    link_type_tap: bool,
    file: Option<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>, link_type_tap: bool) -> Result<Self, KiError> {
        let file = File::create(path.as_ref())?;
        info!(path = %path.as_ref().display(), "capture file created");
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            link_type_tap,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSink for FileSink {
    fn start(&mut self) -> Result<(), KiError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(&global_header(self.link_type_tap))?;
        }
        Ok(())
    }

    fn handle(&mut self, record: &PcapRecord) -> Result<(), KiError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(record.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), KiError> {
        self.file.take();
        Ok(())
    }
}

/// Capture sink feeding a Unix FIFO for a live packet analyzer.
///
/// `start` keeps retrying the non-blocking writable open until a reader has
/// the other end; write failures afterwards are dropped silently since the
/// consumer may detach at any time.
#[cfg(unix)]
pub struct FifoSink {
    path: PathBuf,
    link_type_tap: bool,
    fifo: Option<File>,
}

#[cfg(unix)]
impl FifoSink {
    pub fn create(path: impl AsRef<Path>, link_type_tap: bool) -> Result<Self, KiError> {
        use nix::sys::stat::Mode;
        nix::unistd::mkfifo(path.as_ref(), Mode::from_bits_truncate(0o644))
            .map_err(|errno| KiError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        info!(path = %path.as_ref().display(), "capture fifo created");
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            link_type_tap,
            fifo: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl CaptureSink for FifoSink {
    fn start(&mut self) -> Result<(), KiError> {
        use std::os::unix::fs::OpenOptionsExt;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&self.path)
            {
                Ok(mut fifo) => {
                    fifo.write_all(&global_header(self.link_type_tap))?;
                    self.fifo = Some(fifo);
                    return Ok(());
                }
                Err(err) => {
                    // No reader on the other end yet
                    debug!("fifo not ready: {err}");
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
    }

    fn handle(&mut self, record: &PcapRecord) -> Result<(), KiError> {
        if let Some(fifo) = self.fifo.as_mut()
            && fifo.write_all(record.as_bytes()).is_ok()
        {
            let _ = fifo.flush();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), KiError> {
        self.fifo.take();
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

/// Capture sink feeding an outbound byte-mode Windows named pipe.
///
/// `start` blocks until the consumer connects; write failures afterwards are
/// dropped silently.
#[cfg(windows)]
pub struct PipeSink {
    name: String,
    link_type_tap: bool,
    runtime: tokio::runtime::Runtime,
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl PipeSink {
    pub fn create(name: &str, link_type_tap: bool) -> Result<Self, KiError> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let server = ServerOptions::new().access_inbound(false).create(name)?;
        info!(name, "capture pipe created");
        Ok(Self {
            name: name.to_string(),
            link_type_tap,
            runtime,
            server: Some(server),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(windows)]
impl CaptureSink for PipeSink {
    fn start(&mut self) -> Result<(), KiError> {
        use tokio::io::AsyncWriteExt;
        if let Some(server) = self.server.as_mut() {
            self.runtime.block_on(async {
                server.connect().await?;
                server.write_all(&global_header(self.link_type_tap)).await
            })?;
        }
        Ok(())
    }

    fn handle(&mut self, record: &PcapRecord) -> Result<(), KiError> {
        use tokio::io::AsyncWriteExt;
        if let Some(server) = self.server.as_mut() {
            let _ = self.runtime.block_on(server.write_all(record.as_bytes()));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), KiError> {
        if let Some(server) = self.server.take() {
            let _ = server.disconnect();
        }
        Ok(())
    }
}
