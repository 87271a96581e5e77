use std::io;
use thiserror::Error;

/// The primary error type for the `kitool` crates.
///
/// The `Display` text of the transport variants is exactly what the original
/// tool printed for them, so callers can surface `err.to_string()` directly.
#[derive(Error, Debug)]
pub enum KiError {
    #[error("Syntax error")]
    Syntax,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("COBS error")]
    Cobs,

    #[error("Response code not matching")]
    CodeMismatch,

    #[error("Serial problem")]
    Serial(#[source] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("Timeout during USB operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid DFU file: {0}")]
    InvalidDfuFile(String),

    #[error("No Kirale DFU devices found")]
    NoDfuDevices,

    #[error("No KBI devices found")]
    NoKbiDevices,

    #[error("Channel must be between 11 and 26, got {0}")]
    ChannelOutOfRange(u8),

    #[error("Channel setting while running not allowed")]
    CaptureRunning,
}

impl From<serialport::Error> for KiError {
    fn from(err: serialport::Error) -> Self {
        KiError::Serial(err)
    }
}
