//! KBI command and response tables.
//!
//! Both directions are plain static data: the command table maps canonical
//! command text to an opcode plus parameter coercers, the printer table maps
//! `(type, code)` pairs of value responses to a pretty-printer. Text commands
//! are matched by longest prefix over whitespace-split tokens so overlapping
//! entries like `config joiner remove` / `config joiner remove all` resolve
//! unambiguously.

use crate::frame::{CC_DELETE, CC_EXEC, CC_READ, CC_WRITE, FrameClass, ResponseCode, TypeField, type_octet};
use crate::value::{ParamKind, ValueKind};

/// One entry of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandEntry {
    pub text: &'static str,
    pub control: u8,
    pub opcode: u8,
    pub params: &'static [ParamKind],
    pub last_optional: bool,
}

const fn e(text: &'static str, control: u8, opcode: u8) -> CommandEntry {
    CommandEntry {
        text,
        control,
        opcode,
        params: &[],
        last_optional: false,
    }
}

const fn ep(
    text: &'static str,
    control: u8,
    opcode: u8,
    params: &'static [ParamKind],
) -> CommandEntry {
    CommandEntry {
        text,
        control,
        opcode,
        params,
        last_optional: false,
    }
}

const fn eo(
    text: &'static str,
    control: u8,
    opcode: u8,
    params: &'static [ParamKind],
) -> CommandEntry {
    CommandEntry {
        text,
        control,
        opcode,
        params,
        last_optional: true,
    }
}

use crate::value::ParamKind::{Addr, AddrPrefix, Dec, Hex, HexRaw, Mac, Role, Steering, Str, StrN};

pub static COMMAND_TABLE: &[CommandEntry] = &[
    e("clear", CC_EXEC, 0x00),
    ep("config thver", CC_WRITE, 0x01, &[Dec(2)]),
    e("show thver", CC_READ, 0x01),
    e("show uptime", CC_READ, 0x02),
    e("reset", CC_EXEC, 0x03),
    e("config autojoin on", CC_WRITE, 0x04),
    e("config autojoin off", CC_DELETE, 0x04),
    e("show autojoin", CC_READ, 0x04),
    e("show status", CC_READ, 0x05),
    ep("ping", CC_EXEC, 0x06, &[Addr, Dec(2)]),
    e("ifdown", CC_EXEC, 0x07),
    e("ifup", CC_EXEC, 0x08),
    eo("config socket add", CC_WRITE, 0x09, &[Dec(2)]),
    ep("config socket del", CC_DELETE, 0x09, &[Dec(2)]),
    e("show swver", CC_READ, 0x0A),
    e("show hwver", CC_READ, 0x0B),
    e("show snum", CC_READ, 0x0C),
    ep("config emac", CC_WRITE, 0x0D, &[Mac]),
    e("show emac", CC_READ, 0x0D),
    e("show eui64", CC_READ, 0x0E),
    e("config lowpower on", CC_WRITE, 0x0F),
    e("config lowpower off", CC_DELETE, 0x0F),
    e("show lowpower", CC_READ, 0x0F),
    ep("config txpower", CC_WRITE, 0x10, &[Dec(1)]),
    e("show txpower", CC_READ, 0x10),
    ep("config panid", CC_WRITE, 0x11, &[Hex]),
    e("show panid", CC_READ, 0x11),
    ep("config channel", CC_WRITE, 0x12, &[Dec(1)]),
    e("show channel", CC_READ, 0x12),
    ep("config xpanid", CC_WRITE, 0x13, &[Hex]),
    e("show xpanfilt", CC_READ, 0x1F),
    e("show xpanid", CC_READ, 0x13),
    ep("config netname", CC_WRITE, 0x14, &[Str]),
    e("show netname", CC_READ, 0x14),
    ep("config mkey", CC_WRITE, 0x15, &[Hex]),
    e("show mkey", CC_READ, 0x15),
    ep("config commcred", CC_WRITE, 0x16, &[Str]),
    e("show commcred", CC_READ, 0x16),
    ep("config joincred", CC_WRITE, 0x17, &[Str]),
    e("show joincred", CC_READ, 0x17),
    ep("config joiner add", CC_WRITE, 0x18, &[Mac, Str]),
    e("config joiner remove all", CC_DELETE, 0x18),
    ep("config joiner remove", CC_DELETE, 0x18, &[Mac]),
    e("show joiners", CC_READ, 0x18),
    ep("config role", CC_WRITE, 0x19, &[Role]),
    e("show role", CC_READ, 0x19),
    e("show rloc16", CC_READ, 0x1A),
    e("config comm on", CC_WRITE, 0x1B),
    e("config comm off", CC_DELETE, 0x1B),
    ep("config mlprefix", CC_WRITE, 0x1C, &[AddrPrefix]),
    e("show mlprefix", CC_READ, 0x1C),
    ep("config maxchild", CC_WRITE, 0x1D, &[Dec(1)]),
    e("show maxchild", CC_READ, 0x1D),
    ep("config timeout", CC_WRITE, 0x1E, &[Dec(4)]),
    e("show timeout", CC_READ, 0x1E),
    ep("config xpanfilt add", CC_WRITE, 0x1F, &[Hex]),
    e("config xpanfilt remove all", CC_DELETE, 0x1F),
    ep("config ipaddr add", CC_WRITE, 0x20, &[Addr]),
    ep("config ipaddr remove", CC_DELETE, 0x20, &[Addr]),
    e("show ipaddr", CC_READ, 0x20),
    ep("config joinport", CC_WRITE, 0x21, &[Hex]),
    e("show heui64", CC_READ, 0x22),
    ep("config pollrate", CC_WRITE, 0x23, &[Dec(4)]),
    e("show pollrate", CC_READ, 0x23),
    e("config outband", CC_WRITE, 0x24),
    ep("config steering", CC_WRITE, 0x25, &[Steering]),
    ep("config prefix add", CC_WRITE, 0x26, &[Addr, Dec(1), Hex]),
    ep("config prefix remove", CC_DELETE, 0x26, &[Addr, Dec(1)]),
    ep("config route add", CC_WRITE, 0x27, &[Addr, Dec(1), Hex]),
    ep("config route remove", CC_DELETE, 0x27, &[Addr, Dec(1)]),
    ep("config service add", CC_WRITE, 0x28, &[Dec(1), Str, Str]),
    ep("config service remove", CC_DELETE, 0x28, &[Dec(1), Str]),
    e("show parent", CC_READ, 0x29),
    e("show routert", CC_READ, 0x2A),
    e("show ldrdata", CC_READ, 0x2B),
    e("show netdata", CC_READ, 0x2C),
    e("show stats", CC_READ, 0x2D),
    e("show childt", CC_READ, 0x2E),
    ep("netcat", CC_EXEC, 0x2F, &[Dec(2), Dec(2), Addr, Hex]),
    ep("config hwmode", CC_WRITE, 0x31, &[Dec(1)]),
    e("show hwmode", CC_READ, 0x31),
    e("config led on", CC_WRITE, 0x32),
    e("config led off", CC_DELETE, 0x32),
    e("show led", CC_READ, 0x32),
    ep("config vname", CC_WRITE, 0x33, &[Str]),
    e("show vname", CC_READ, 0x33),
    ep("config vmodel", CC_WRITE, 0x34, &[Str]),
    e("show vmodel", CC_READ, 0x34),
    ep("config vdata", CC_WRITE, 0x35, &[Str]),
    e("show vdata", CC_READ, 0x35),
    ep("config vswver", CC_WRITE, 0x36, &[Str]),
    e("show vswver", CC_READ, 0x36),
    ep("config actstamp", CC_WRITE, 0x37, &[Hex]),
    ep("show actstamp", CC_READ, 0x37, &[Hex]),
    ep("nping", CC_EXEC, 0x38, &[StrN(32), Dec(2)]),
    ep("nnetcat", CC_EXEC, 0x39, &[Dec(2), Dec(2), StrN(32), Hex]),
    e("show services", CC_READ, 0x3A),
    ep("config provurl", CC_WRITE, 0x3B, &[Str]),
    e("show provurl", CC_READ, 0x3C),
    e("show commsid", CC_READ, 0x3D),
    eo("exec pendget", CC_EXEC, 0x3E, &[Addr, HexRaw]),
    ep("exec pendset", CC_EXEC, 0x3E, &[Addr, HexRaw]),
    eo("exec activeget", CC_EXEC, 0x3F, &[Addr, HexRaw]),
    ep("exec activeset", CC_EXEC, 0x40, &[Addr, HexRaw]),
    eo("exec commget", CC_EXEC, 0x41, &[Addr, HexRaw]),
    ep("exec commset", CC_EXEC, 0x42, &[Addr, HexRaw]),
    ep("exec panidqry", CC_EXEC, 0x43, &[Addr, Hex, Hex]),
    // Thread 1.3 commands
    ep("config cslch", CC_WRITE, 0x64, &[Dec(1)]),
    e("show cslch", CC_READ, 0x64),
    ep("config csltout", CC_WRITE, 0x65, &[Dec(4)]),
    e("show csltout", CC_READ, 0x65),
    ep("config cslprd", CC_WRITE, 0x66, &[Dec(2)]),
    e("show cslprd", CC_READ, 0x66),
];

/// Split a command line into tokens, honouring single and double quotes.
fn split_tokens(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Match an input token list against the table, longest prefix wins.
fn find_entry(tokens: &[String]) -> Option<(&'static CommandEntry, usize)> {
    let mut best: Option<(&CommandEntry, usize)> = None;
    for entry in COMMAND_TABLE {
        let words: Vec<&str> = entry.text.split_whitespace().collect();
        if words.len() > tokens.len() {
            continue;
        }
        if words.iter().zip(tokens).all(|(w, t)| *w == t.as_str())
            && best.map(|(_, n)| words.len() > n).unwrap_or(true)
        {
            best = Some((entry, words.len()));
        }
    }
    best
}

/// Translate a text command into `(type, code, payload)`. `None` marks a
/// command that is unknown or carries invalid parameters.
pub fn text_to_kbi(command: &str) -> Option<(u8, u8, Vec<u8>)> {
    let tokens = split_tokens(command);
    let (entry, matched) = find_entry(&tokens)?;
    let args = &tokens[matched..];

    let mut params = entry.params;
    if entry.last_optional && args.len() + 1 == params.len() {
        params = &params[..params.len() - 1];
    }

    let mut payload = Vec::new();
    for (param, arg) in params.iter().zip(args) {
        payload.extend_from_slice(&param.coerce(arg)?);
    }
    if args.len() < params.len() {
        return None;
    }

    Some((
        type_octet(FrameClass::Request, entry.control),
        entry.opcode,
        payload,
    ))
}

/// One entry of the response printer table.
#[derive(Debug, Clone, Copy)]
pub struct PrinterEntry {
    pub ftype: u8,
    pub opcode: u8,
    pub kind: ValueKind,
}

/// Type octet of a value response (Response class, Value code).
const RSP_VALUE: u8 = 0x21;

const fn p(opcode: u8, kind: ValueKind) -> PrinterEntry {
    PrinterEntry {
        ftype: RSP_VALUE,
        opcode,
        kind,
    }
}

pub static RESPONSE_PRINTERS: &[PrinterEntry] = &[
    p(0x01, ValueKind::Dec),      // thver
    p(0x02, ValueKind::Time),     // uptime
    p(0x04, ValueKind::Dec),      // autojoin
    p(0x05, ValueKind::Status),   // status
    p(0x09, ValueKind::Dec),      // socket
    p(0x0A, ValueKind::Str),      // swver
    p(0x0B, ValueKind::Str),      // hwver
    p(0x0C, ValueKind::Str),      // snum
    p(0x0D, ValueKind::Mac),      // emac
    p(0x0E, ValueKind::Mac),      // eui64
    p(0x0F, ValueKind::Dec),      // lowpower
    p(0x10, ValueKind::Dec),      // txpower
    p(0x11, ValueKind::Hex),      // panid
    p(0x12, ValueKind::Dec),      // channel
    p(0x13, ValueKind::Hex),      // xpanid
    p(0x14, ValueKind::Str),      // netname
    p(0x15, ValueKind::Hex),      // mkey
    p(0x16, ValueKind::Str),      // commcred
    p(0x17, ValueKind::Str),      // joincred
    p(0x18, ValueKind::Mac),      // joiners
    p(0x19, ValueKind::Role),     // role
    p(0x1A, ValueKind::Hex),      // rloc16
    p(0x1C, ValueKind::Addr(8)),  // mlprefix
    p(0x1D, ValueKind::Dec),      // maxchild
    p(0x1E, ValueKind::Dec),      // timeout
    p(0x1F, ValueKind::Hex),      // xpanfilt
    p(0x20, ValueKind::AddrList), // ipaddr
    p(0x22, ValueKind::Mac),      // heui64
    p(0x23, ValueKind::Dec),      // pollrate
    p(0x29, ValueKind::Hex),      // parent
    p(0x2A, ValueKind::HexBare),  // routert
    p(0x2B, ValueKind::HexBare),  // ldrdata
    p(0x2C, ValueKind::HexBare),  // netdata
    p(0x2D, ValueKind::HexBare),  // stats
    p(0x2E, ValueKind::HexBare),  // childt
    p(0x31, ValueKind::Dec),      // hwmode
    p(0x32, ValueKind::Dec),      // led
    p(0x33, ValueKind::Str),      // vname
    p(0x34, ValueKind::Str),      // vmodel
    p(0x35, ValueKind::Str),      // vdata
    p(0x36, ValueKind::Str),      // vswver
    p(0x37, ValueKind::Hex),      // actstamp
    p(0x3A, ValueKind::Serv),     // services
    p(0x3C, ValueKind::Hex),      // commsid
    p(0x64, ValueKind::Dec),      // cslch
    p(0x65, ValueKind::Dec),      // csltout
    p(0x66, ValueKind::Dec),      // cslprd
];

/// Render a response frame's payload to human text.
pub fn response_to_text(ftype: u8, code: u8, payload: &[u8]) -> String {
    const WRONG_VALUE: &str = "Wrong value or parser not implemented";

    let response_code = ResponseCode::from(TypeField::from_bytes([ftype]).sub());
    match response_code {
        ResponseCode::Ok if payload.is_empty() => String::new(),
        ResponseCode::Value => RESPONSE_PRINTERS
            .iter()
            .find(|entry| entry.ftype == ftype && entry.opcode == code)
            .and_then(|entry| entry.kind.render(payload))
            .unwrap_or_else(|| WRONG_VALUE.to_string()),
        ResponseCode::BadParam => "Bad parameter".to_string(),
        ResponseCode::BadCommand => "Bad command".to_string(),
        ResponseCode::NotAllowed => "Command not allowed".to_string(),
        ResponseCode::MemoryError => "Memory allocation error".to_string(),
        ResponseCode::ConfigError => "Configuration settings missing".to_string(),
        ResponseCode::FwUpdateError => "Firmware update error".to_string(),
        _ => "Unknown error".to_string(),
    }
}
