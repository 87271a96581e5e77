//! USB DFU 1.1 support: the firmware image file format and the class
//! control-transfer protocol spoken by the KiNOS bootloader.

use std::path::Path;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{FromPrimitive, IntoPrimitive};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Device, DeviceInfo, Interface};
use tracing::{debug, info, trace};

use crate::constants::{FW_BLOCK_SIZE, KINOS_DFU_PID};
use crate::error::KiError;

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// DFU class requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0x00,
    Dnload = 0x01,
    Upload = 0x02,
    GetStatus = 0x03,
    ClrStatus = 0x04,
    GetState = 0x05,
    Abort = 0x06,
}

/// Device states per the USB DFU 1.1 spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0x00,
    AppDetach = 0x01,
    DfuIdle = 0x02,
    DownloadSync = 0x03,
    DownloadBusy = 0x04,
    DownloadIdle = 0x05,
    ManifestSync = 0x06,
    Manifest = 0x07,
    ManifestWaitReset = 0x08,
    UploadIdle = 0x09,
    Error = 0x0A,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Status codes per the USB DFU 1.1 spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DfuStatus {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0A,
    ErrVendor = 0x0B,
    ErrUsbr = 0x0C,
    ErrPor = 0x0D,
    ErrUnknown = 0x0E,
    ErrStalledPkt = 0x0F,

    #[num_enum(catch_all)]
    Reserved(u8),
}

/// One GETSTATUS answer: `(status, poll_timeout, state, string_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatusResult {
    pub status: DfuStatus,
    pub state: DfuState,
    pub poll_timeout_ms: u32,
    pub string_index: u8,
}

impl DfuStatusResult {
    /// Parse the 6-octet GETSTATUS payload. The poll timeout is a 24-bit
    /// little-endian value in milliseconds.
    pub fn parse(raw: &[u8]) -> Result<Self, KiError> {
        if raw.len() < 6 {
            return Err(KiError::InvalidFrame(format!(
                "GETSTATUS payload too short: {} octets",
                raw.len()
            )));
        }
        Ok(Self {
            status: DfuStatus::from_primitive(raw[0]),
            poll_timeout_ms: LittleEndian::read_u24(&raw[1..4]),
            state: DfuState::from_primitive(raw[4]),
            string_index: raw[5],
        })
    }
}

/// Trailing 16-octet suffix of a DFU image, little-endian.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DfuSuffix {
    fw_version: U16,
    pid: U16,
    vid: U16,
    dfu_spec: U16,
    signature: [u8; 3],
    length: u8,
    crc: U32,
}

/// A validated DFU firmware image.
#[derive(Debug, Clone)]
pub struct DfuFile {
    /// Firmware image bytes, suffix stripped.
    pub data: Vec<u8>,
    pub fw_version: u16,
    pub pid: u16,
    pub vid: u16,
    pub dfu_spec: u16,
}

impl DfuFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KiError> {
        let raw = std::fs::read(path.as_ref())?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, KiError> {
        if raw.len() < 16 {
            return Err(KiError::InvalidDfuFile(
                "file shorter than the 16-octet suffix".to_string(),
            ));
        }
        let (body, suffix_bytes) = raw.split_at(raw.len() - 16);
        let suffix = DfuSuffix::read_from_bytes(suffix_bytes)
            .map_err(|_| KiError::InvalidDfuFile("unreadable suffix".to_string()))?;
        if &suffix.signature != b"UFD" {
            return Err(KiError::InvalidDfuFile(
                "suffix signature does not match".to_string(),
            ));
        }
        Ok(Self {
            data: body.to_vec(),
            fw_version: suffix.fw_version.get(),
            pid: suffix.pid.get(),
            vid: suffix.vid.get(),
            dfu_spec: suffix.dfu_spec.get(),
        })
    }

    /// 64-octet upload blocks; the last one may be short.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks(FW_BLOCK_SIZE)
    }

    pub fn block_count(&self) -> usize {
        self.data.len().div_ceil(FW_BLOCK_SIZE)
    }
}

/// A Kirale device exposing the DFU class interface.
pub struct DfuDevice {
    #[allow(dead_code)]
    device: Device,
    interface: Interface,
    interface_number: u8,
    info: DeviceInfo,
}

impl DfuDevice {
    /// Open the device and claim its DFU interface (interface 0).
    pub async fn open(info: DeviceInfo) -> Result<Self, KiError> {
        let device = info.open().await?;
        // Driver may already be detached
        if let Err(err) = device.detach_kernel_driver(0) {
            trace!("could not detach interface 0: {err}");
        }
        let interface = device.claim_interface(0).await?;
        debug!(
            serial = info.serial_number().unwrap_or("unknown"),
            "DFU interface claimed"
        );
        Ok(Self {
            device,
            interface,
            interface_number: 0,
            info,
        })
    }

    pub fn serial(&self) -> String {
        self.info.serial_number().unwrap_or("unknown").to_string()
    }

    pub fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    /// Whether the device currently runs the bootloader (DFU mode).
    pub fn is_boot(&self) -> bool {
        self.info.product_id() == KINOS_DFU_PID
    }

    async fn control_out(
        &self,
        request: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), KiError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: request.into(),
                    value,
                    index: u16::from(self.interface_number),
                    data,
                },
                USB_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn control_in(
        &self,
        request: DfuRequest,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, KiError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: request.into(),
                    value,
                    index: u16::from(self.interface_number),
                    length,
                },
                USB_TIMEOUT,
            )
            .await?;
        Ok(data)
    }

    /// Ask a run-time device to re-enumerate in DFU mode.
    pub async fn detach(&self, timeout_ms: u16) -> Result<(), KiError> {
        self.control_out(DfuRequest::Detach, timeout_ms, &[]).await
    }

    /// Download one firmware block.
    pub async fn download(&self, block: u16, data: &[u8]) -> Result<(), KiError> {
        self.control_out(DfuRequest::Dnload, block, data).await
    }

    /// Zero-length download, triggering the manifest phase.
    pub async fn leave(&self) -> Result<(), KiError> {
        self.download(0, &[]).await
    }

    pub async fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, KiError> {
        self.control_in(DfuRequest::Upload, block, length).await
    }

    pub async fn get_status(&self) -> Result<DfuStatusResult, KiError> {
        let raw = self.control_in(DfuRequest::GetStatus, 0, 6).await?;
        DfuStatusResult::parse(&raw)
    }

    pub async fn clear_status(&self) -> Result<(), KiError> {
        self.control_out(DfuRequest::ClrStatus, 0, &[]).await
    }

    pub async fn get_state(&self) -> Result<DfuState, KiError> {
        let raw = self.control_in(DfuRequest::GetState, 0, 1).await?;
        raw.first()
            .map(|b| DfuState::from_primitive(*b))
            .ok_or_else(|| KiError::InvalidFrame("empty GETSTATE response".to_string()))
    }

    /// Poll GETSTATUS while the device stays in `state`, honouring the
    /// per-poll timeout it reports.
    pub async fn wait_while_state(&self, state: DfuState) -> Result<DfuStatusResult, KiError> {
        let mut status = self.get_status().await?;
        while status.state == state {
            tokio::time::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms))).await;
            status = self.get_status().await?;
        }
        Ok(status)
    }

    /// Bootloader version, read through a 2-octet UPLOAD. Only meaningful in
    /// DFU mode.
    pub async fn boot_version(&self) -> Result<String, KiError> {
        if !self.is_boot() {
            return Ok(String::new());
        }
        // Clear left-over errors
        if self.get_status().await?.state == DfuState::Error {
            self.clear_status().await?;
        }
        let raw = self.upload(0, 2).await?;
        if raw.len() < 2 {
            return Err(KiError::InvalidFrame("short version response".to_string()));
        }
        info!(serial = %self.serial(), "bootloader v{}.{}", raw[0], raw[1]);
        Ok(format!("v{}.{}", raw[0], raw[1]))
    }
}
