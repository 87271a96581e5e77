//! KBI frame construction and parsing.
//!
//! ```text
//!                         KBI Frame Format
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Payload Len 0 | Payload Len 1 |      Type     |     Code      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Checksum   |                  Payload...                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The type octet packs the frame class into the upper nibble and a
//! class-specific sub-code (command control, response code or notification
//! code) into the lower nibble. The checksum is the XOR of every other octet
//! in the frame.

use std::fmt;
use std::net::Ipv6Addr;

use bytes::Bytes;
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::commands;
use crate::constants::{KBI_HEADER_SIZE, KBI_MAX_PAYLOAD};
use crate::error::KiError;

/// Command-control sub-codes for request frames. Execute shares the write
/// encoding.
pub const CC_WRITE: u8 = 0x00;
pub const CC_EXEC: u8 = 0x00;
pub const CC_READ: u8 = 0x01;
pub const CC_DELETE: u8 = 0x02;

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeField {
    pub sub: B4,
    pub class: B4,
}

/// Frame classes carried in the upper nibble of the type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FrameClass {
    Result = 0x0,
    Request = 0x1,
    Response = 0x2,
    Notification = 0x3,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Response codes carried in the lower nibble of response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    Value = 0x01,
    BadParam = 0x02,
    BadCommand = 0x03,
    NotAllowed = 0x04,
    MemoryError = 0x05,
    ConfigError = 0x06,
    FwUpdateError = 0x07,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Notification codes carried in the lower nibble of notification frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum NotificationCode {
    PingReply = 0x00,
    UdpReceive = 0x01,
    NamedPingReply = 0x02,
    NamedUdpReceive = 0x03,
    DestUnreachable = 0x04,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Compose a type octet from class and sub-code.
pub fn type_octet(class: FrameClass, sub: u8) -> u8 {
    TypeField::new()
        .with_class(class.into())
        .with_sub(sub & 0x0F)
        .into_bytes()[0]
}

/// XOR of all octets, the KBI checksum.
pub fn xor_checksum<'a, I: IntoIterator<Item = &'a u8>>(bytes: I) -> u8 {
    bytes.into_iter().fold(0, |acc, b| acc ^ b)
}

/// An outgoing KBI request, stored as its full wire image.
#[derive(Debug, Clone, PartialEq)]
pub struct KbiRequest {
    bytes: Bytes,
}

impl KbiRequest {
    /// Build a request frame from its raw parts.
    pub fn from_parts(ftype: u8, code: u8, payload: &[u8]) -> Result<Self, KiError> {
        if payload.len() > KBI_MAX_PAYLOAD {
            return Err(KiError::InvalidFrame(format!(
                "payload too long: {} octets",
                payload.len()
            )));
        }
        let mut data = Vec::with_capacity(KBI_HEADER_SIZE + payload.len());
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.push(ftype);
        data.push(code);
        data.push(0);
        data.extend_from_slice(payload);
        data[4] = xor_checksum(&data);
        Ok(Self { bytes: Bytes::from(data) })
    }

    /// Translate a text command through the command table.
    pub fn from_text(command: &str) -> Result<Self, KiError> {
        let (ftype, code, payload) = commands::text_to_kbi(command).ok_or(KiError::Syntax)?;
        Self::from_parts(ftype, code, &payload)
    }

    pub fn ftype(&self) -> u8 {
        self.bytes[2]
    }

    pub fn code(&self) -> u8 {
        self.bytes[3]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[KBI_HEADER_SIZE..]
    }

    /// Full frame image, ready for COBS encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A validated incoming KBI frame (response or notification).
#[derive(Debug, Clone, PartialEq)]
pub struct KbiResponse {
    ftype: u8,
    code: u8,
    payload: Bytes,
}

impl KbiResponse {
    /// Parse and validate a decoded frame: minimum size, checksum, and the
    /// declared length against the actual payload length.
    pub fn parse(data: &[u8]) -> Result<Self, KiError> {
        if data.len() < KBI_HEADER_SIZE {
            return Err(KiError::InvalidFrame(format!(
                "frame too short: {} octets",
                data.len()
            )));
        }
        let checksum = xor_checksum(data[..4].iter().chain(&data[KBI_HEADER_SIZE..]));
        if checksum != data[4] {
            return Err(KiError::InvalidFrame(format!(
                "checksum mismatch: computed {checksum:#04x}, frame carries {:#04x}",
                data[4]
            )));
        }
        let declared = u16::from_be_bytes([data[0], data[1]]) as usize;
        if declared != data.len() - KBI_HEADER_SIZE {
            return Err(KiError::InvalidFrame(format!(
                "length mismatch: declared {declared}, got {}",
                data.len() - KBI_HEADER_SIZE
            )));
        }
        Ok(Self {
            ftype: data[2],
            code: data[3],
            payload: Bytes::copy_from_slice(&data[KBI_HEADER_SIZE..]),
        })
    }

    pub fn ftype(&self) -> u8 {
        self.ftype
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn frame_class(&self) -> FrameClass {
        FrameClass::from_primitive(TypeField::from_bytes([self.ftype]).class())
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from_primitive(TypeField::from_bytes([self.ftype]).sub())
    }

    pub fn is_notification(&self) -> bool {
        self.frame_class() == FrameClass::Notification
    }

    /// Decode the payload as an asynchronous notification.
    pub fn notification(&self) -> Option<Notification> {
        if !self.is_notification() {
            return None;
        }
        let code = NotificationCode::from_primitive(TypeField::from_bytes([self.ftype]).sub());
        Some(Notification::decode(code, &self.payload))
    }

    /// Human text for this frame: notification rendering for notifications,
    /// response-code rendering otherwise.
    pub fn to_text(&self) -> String {
        match self.notification() {
            Some(notification) => notification.to_string(),
            None => commands::response_to_text(self.ftype, self.code, &self.payload),
        }
    }
}

/// Asynchronous device notifications, decoded from fixed-offset layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PingReply {
        saddr: Ipv6Addr,
        label: Option<String>,
        id: u16,
        seq: u16,
        bytes: u16,
    },
    UdpReceive {
        saddr: Ipv6Addr,
        label: Option<String>,
        sport: u16,
        dport: u16,
        len: usize,
    },
    DestUnreachable {
        daddr: Ipv6Addr,
    },
    Unknown,
}

fn read_u16be(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn read_addr(payload: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&payload[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

fn read_label(payload: &[u8], range: std::ops::Range<usize>) -> String {
    payload[range]
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

impl Notification {
    fn decode(code: NotificationCode, payload: &[u8]) -> Self {
        match code {
            NotificationCode::PingReply if payload.len() >= 22 => Notification::PingReply {
                saddr: read_addr(payload, 0),
                label: None,
                bytes: read_u16be(payload, 16),
                id: read_u16be(payload, 18),
                seq: read_u16be(payload, 20),
            },
            NotificationCode::NamedPingReply if payload.len() >= 54 => Notification::PingReply {
                saddr: read_addr(payload, 32),
                label: Some(read_label(payload, 0..32)),
                bytes: read_u16be(payload, 48),
                id: read_u16be(payload, 50),
                seq: read_u16be(payload, 52),
            },
            NotificationCode::UdpReceive if payload.len() >= 20 => Notification::UdpReceive {
                dport: read_u16be(payload, 0),
                sport: read_u16be(payload, 2),
                saddr: read_addr(payload, 4),
                label: None,
                len: payload.len() - 20,
            },
            NotificationCode::NamedUdpReceive if payload.len() >= 52 => Notification::UdpReceive {
                dport: read_u16be(payload, 0),
                sport: read_u16be(payload, 2),
                label: Some(read_label(payload, 4..35)),
                saddr: read_addr(payload, 36),
                len: payload.len() - 52,
            },
            NotificationCode::DestUnreachable if payload.len() >= 16 => {
                Notification::DestUnreachable {
                    daddr: read_addr(payload, 0),
                }
            }
            _ => Notification::Unknown,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::PingReply {
                saddr,
                label: Some(label),
                id,
                seq,
                bytes,
            } => write!(
                f,
                "# ping reply: saddr {saddr} [{label}] id {id} sq {seq} - {bytes} bytes"
            ),
            Notification::PingReply {
                saddr,
                label: None,
                id,
                seq,
                bytes,
            } => write!(
                f,
                "# ping reply: saddr {saddr} id {id} sq {seq} - {bytes} bytes"
            ),
            Notification::UdpReceive {
                saddr,
                label: Some(label),
                sport,
                dport,
                len,
            } => write!(
                f,
                "# udp rcv: saddr {saddr} [{label}] sport {sport} dport {dport} - {len} bytes"
            ),
            Notification::UdpReceive {
                saddr,
                label: None,
                sport,
                dport,
                len,
            } => write!(
                f,
                "# udp rcv: saddr {saddr} sport {sport} dport {dport} - {len} bytes"
            ),
            Notification::DestUnreachable { daddr } => {
                write!(f, "# dst unreachable: daddr {daddr}")
            }
            Notification::Unknown => write!(f, "# unknown notification"),
        }
    }
}
