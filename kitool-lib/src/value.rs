//! String/byte conversions for KBI command parameters and response values.
//!
//! Both directions are data driven: the command table tags each parameter
//! with a [`ParamKind`] and the printer table tags each readable value with a
//! [`ValueKind`]. IPv6 parsing is delegated to `std::net::Ipv6Addr`.

use std::net::Ipv6Addr;

/// Thread device roles and their KBI encodings.
pub static ROLES: &[(&str, u8)] = &[
    ("leader", 6),
    ("router", 1),
    ("reed", 2),
    ("fed", 3),
    ("med", 4),
    ("sed", 5),
    ("not configured", 0),
];

/// Steering data keywords.
pub static STEERING: &[(&str, u8)] = &[("all", 0), ("none", 1), ("on", 2)];

/// Device status codes as reported by `show status`.
static STATUS_CODES: &[(u8, &str)] = &[
    (0, "none"),
    (1, "booting"),
    (2, "discovering"),
    (3, "comminssioning"),
    (4, "attaching"),
    (5, "joined"),
    (6, "rebooting"),
    (7, "change partition"),
    (8, "attaching"),
    (9, "not joined"),
    (10, "rejected"),
    (11, "attaching"),
    (12, "attaching"),
    (13, "rebooting"),
    (14, "rebooting"),
    (15, "attaching"),
    (16, "clearing"),
];

/// Reason suffixes for the `none` status.
static NONE_CODES: &[(u8, &str)] = &[
    (0, ""),
    (1, " - saved configuration"),
    (2, " - network not found"),
    (3, " - comminssioning failed"),
    (4, " - attaching failed"),
];

fn lookup<'a>(table: &'a [(u8, &str)], key: u8) -> Option<&'a str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Coercion applied to one textual command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Decimal integer packed big-endian into the given width (1, 2 or 4)
    Dec(u8),
    /// `0x`-prefixed hex string, even number of digits
    Hex,
    /// Bare hex digits, `0x` prefix implied
    HexRaw,
    /// Raw string bytes
    Str,
    /// String truncated and zero-padded to a fixed width
    StrN(usize),
    /// MAC address, `xx-xx-xx-xx-xx-xx-xx-xx`
    Mac,
    /// IPv6 address, 16 octets
    Addr,
    /// IPv6 address truncated to its upper 8 octets (mesh-local prefix)
    AddrPrefix,
    /// Role name
    Role,
    /// Steering data keyword
    Steering,
}

impl ParamKind {
    /// Convert one argument to its wire bytes. `None` means the argument is
    /// not valid for this parameter, which the caller reports as a syntax
    /// error.
    pub fn coerce(&self, arg: &str) -> Option<Vec<u8>> {
        match self {
            ParamKind::Dec(width) => {
                let value: u64 = arg.parse().ok()?;
                match width {
                    1 => u8::try_from(value).ok().map(|v| vec![v]),
                    2 => u16::try_from(value).ok().map(|v| v.to_be_bytes().to_vec()),
                    4 => u32::try_from(value).ok().map(|v| v.to_be_bytes().to_vec()),
                    _ => None,
                }
            }
            ParamKind::Hex => {
                let digits = arg.strip_prefix("0x")?;
                if digits.len() % 2 != 0 {
                    return None;
                }
                hex::decode(digits).ok()
            }
            ParamKind::HexRaw => {
                if arg.len() % 2 != 0 {
                    return None;
                }
                hex::decode(arg).ok()
            }
            ParamKind::Str => Some(arg.as_bytes().to_vec()),
            ParamKind::StrN(width) => {
                let mut bytes: Vec<u8> = arg.bytes().take(*width).collect();
                bytes.resize(*width, 0);
                Some(bytes)
            }
            ParamKind::Mac => {
                let digits = arg.replace('-', "");
                if digits.len() % 2 != 0 {
                    return None;
                }
                hex::decode(digits).ok()
            }
            ParamKind::Addr => {
                let addr: Ipv6Addr = arg.to_lowercase().parse().ok()?;
                Some(addr.octets().to_vec())
            }
            ParamKind::AddrPrefix => {
                let addr: Ipv6Addr = arg.to_lowercase().parse().ok()?;
                Some(addr.octets()[..8].to_vec())
            }
            ParamKind::Role => ROLES
                .iter()
                .find(|(name, _)| *name == arg)
                .map(|(_, v)| vec![*v]),
            ParamKind::Steering => STEERING
                .iter()
                .find(|(name, _)| *name == arg)
                .map(|(_, v)| vec![*v]),
        }
    }
}

/// Pretty-printer applied to a value response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Big-endian unsigned integer, decimal
    Dec,
    /// NUL-terminated string
    Str,
    /// `0x`-prefixed hex dump
    Hex,
    /// Hex dump without the `0x` prefix
    HexBare,
    /// 8-octet MAC addresses, one per line
    Mac,
    /// IPv6 address from the first `n` octets, zero-extended
    Addr(usize),
    /// List of 17-octet `state + address` entries
    AddrList,
    /// Role value
    Role,
    /// Status code plus reason
    Status,
    /// Uptime / UTC time / MCU temperature block
    Time,
    /// DHCP/DNS/NTP server flags
    Serv,
}

impl ValueKind {
    /// Render a payload to human text. `None` means the payload does not fit
    /// this printer (too short); the caller substitutes its fixed error text.
    pub fn render(&self, payload: &[u8]) -> Option<String> {
        match self {
            ValueKind::Dec => Some(dec_string(payload)),
            ValueKind::Str => Some(nul_string(payload)),
            ValueKind::Hex => Some(format!("0x{}", hex::encode(payload))),
            ValueKind::HexBare => Some(hex::encode(payload)),
            ValueKind::Mac => {
                let mut out = String::new();
                for group in payload.chunks(8) {
                    let parts: Vec<String> = group.iter().map(|b| format!("{b:02x}")).collect();
                    out.push_str(&parts.join("-"));
                    out.push_str("\r\n");
                }
                Some(out)
            }
            ValueKind::Addr(n) => {
                if payload.len() < *n {
                    return None;
                }
                Some(addr_string(&payload[..*n]))
            }
            ValueKind::AddrList => {
                let mut out = String::new();
                for entry in payload.chunks(17) {
                    if entry.len() < 17 {
                        break;
                    }
                    let state = match entry[0] {
                        0 => "T",
                        1 => "R",
                        4 => "I",
                        _ => "?",
                    };
                    out.push_str(&format!("[{state}] {}\r\n", addr_string(&entry[1..17])));
                }
                Some(out)
            }
            ValueKind::Role => {
                let value = dec_string(payload).parse::<u64>().ok()?;
                let name = ROLES
                    .iter()
                    .find(|(_, v)| u64::from(*v) == value)
                    .map(|(name, _)| *name)
                    .unwrap_or("bad role");
                Some(name.to_string())
            }
            ValueKind::Status => {
                let first = *payload.first()?;
                let mut status = lookup(STATUS_CODES, first).unwrap_or("unknown").to_string();
                if status == "none" {
                    let reason = payload.get(1).copied().unwrap_or(0);
                    status.push_str(lookup(NONE_CODES, reason).unwrap_or("unknown"));
                }
                Some(status)
            }
            ValueKind::Time => {
                if payload.len() < 9 {
                    return None;
                }
                let uptime = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let utc = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let temperature = payload[8] as i8;
                let mut out = format!(
                    "Uptime           : {} days, {:02} hours, {:02} minutes and {:02} seconds\r\n",
                    uptime / 86_400,
                    uptime % 86_400 / 3_600,
                    uptime % 3_600 / 60,
                    uptime % 60,
                );
                out.push_str(&format!(
                    "Current UTC Time : {:02}:{:02}:{:02}\r\n",
                    utc % 86_400 / 3_600,
                    utc % 3_600 / 60,
                    utc % 60,
                ));
                out.push_str(&format!("MCU Temperature  : {temperature}\u{b0}C"));
                Some(out)
            }
            ValueKind::Serv => {
                if payload.len() < 3 {
                    return None;
                }
                let on_off = |b: u8| if b == 0x01 { "on" } else { "off" };
                Some(format!(
                    "DHCP server: {}\nDNS server: {}\nNTP server: {}",
                    on_off(payload[0]),
                    on_off(payload[1]),
                    on_off(payload[2]),
                ))
            }
        }
    }
}

/// Big-endian unsigned decimal of an arbitrary byte run.
fn dec_string(payload: &[u8]) -> String {
    let value = payload.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
    value.to_string()
}

/// String up to the first NUL, bytes taken as Latin-1.
fn nul_string(payload: &[u8]) -> String {
    payload
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

/// Compressed IPv6 text from up to 16 address octets, zero-extended.
fn addr_string(bytes: &[u8]) -> String {
    let mut octets = [0u8; 16];
    let n = bytes.len().min(16);
    octets[..n].copy_from_slice(&bytes[..n]);
    Ipv6Addr::from(octets).to_string()
}
