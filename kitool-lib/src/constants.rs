// Protocol constants for the KiNOS host interfaces

/// Size of the KBI frame header (len:u16be, type, code, xor)
pub const KBI_HEADER_SIZE: usize = 5;

/// Maximum KBI payload length (16-bit length field)
pub const KBI_MAX_PAYLOAD: usize = u16::MAX as usize;

/// Firmware update block upload opcode
pub const CMD_FW_UP: u8 = 0x30;

/// Firmware image block size for both DFU and KBI upload paths
pub const FW_BLOCK_SIZE: usize = 64;

/// Kirale USB vendor ID
pub const KIRALE_VID: u16 = 0x2DEF;

/// Product ID reported by the KiNOS bootloader in DFU mode
pub const KINOS_DFU_PID: u16 = 0x0000;

/// KSH shell prompt, used as the end-of-response sentinel
pub const KSH_PROMPT: &str = "kinos@local:~$ ";

/// Serial baud rate for KiNOS devices
pub const KI_BAUD_RATE: u32 = 115_200;

/// Sniffer frame magics. The first two variants carry no RSSI/LQI; the last
/// two embed RSSI and LQI in the top 16 bits of the 8-byte timestamp field.
pub const MAGIC_LEGACY_U32: u32 = 0xC11F_FE72;
pub const MAGIC_SNIF: u32 = 0x534E_4946;
pub const MAGIC_RSSI_SYMBOLS: u32 = 0xB897_8C97;
pub const MAGIC_RSSI_MICROS: u32 = 0xC097_8C97;

/// Duration of one 802.15.4 symbol in microseconds
pub const SYMBOL_US: u64 = 16;

/// libpcap link types emitted by the sniffer
pub const LINKTYPE_IEEE802_15_4: u32 = 195;
pub const LINKTYPE_IEEE802_15_4_TAP: u32 = 283;

/// Valid 802.15.4 capture channels (2.4 GHz band)
pub const CHANNEL_MIN: u8 = 11;
pub const CHANNEL_MAX: u8 = 26;
