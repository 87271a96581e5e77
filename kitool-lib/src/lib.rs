pub mod cobs;
pub mod commands;
pub mod constants;
pub mod dfu;
pub mod discovery;
pub mod error;
pub mod flash;
pub mod frame;
pub mod pcap;
pub mod serial;
pub mod sniffer;
pub mod value;

// Re-export commonly used types
pub use dfu::{DfuDevice, DfuFile, DfuState, DfuStatus, DfuStatusResult};
pub use discovery::{DeviceFilter, KiDevice, find_devices};
pub use error::KiError;
pub use flash::{FlashSummary, KbiFlashOptions};
pub use frame::{KbiRequest, KbiResponse, Notification};
pub use serial::{KbiExchange, KiSerial, KiSerialThreaded, PortMode};
pub use sniffer::KiSniffer;
