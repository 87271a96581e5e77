//! Discovery of connected Kirale devices.
//!
//! Enumerates serial ports and probes each candidate for a Kirale identity
//! (`show snum` answering with a `KT…` serial number).

use std::fmt;

use serialport::SerialPortType;
use tracing::debug;

use crate::serial::{KiSerial, PortMode};

/// Descriptor of a discovered device, used for selection and flashing.
#[derive(Debug, Clone)]
pub struct KiDevice {
    pub port: String,
    pub desc: String,
    pub snum: String,
    pub swver: String,
    pub mode: PortMode,
}

impl fmt::Display for KiDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14}{:<5}{:<30}{:<36}{}",
            self.port, self.mode, self.swver, self.snum, self.desc
        )
    }
}

/// Filters applied during discovery.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Keep only the device with this serial number.
    pub snum: Option<String>,
    /// Keep only border routers (devices exposing `hwmode`).
    pub border_router: Option<bool>,
    /// Keep only UART (KBI) or only USB (KSH) devices.
    pub uart_only: Option<bool>,
}

/// Enumerate serial ports and return every Kirale device passing the filter.
pub fn find_devices(filter: &DeviceFilter) -> Vec<KiDevice> {
    let mut devices = Vec::new();
    let Ok(ports) = serialport::available_ports() else {
        return devices;
    };
    for info in ports {
        let desc = match &info.port_type {
            SerialPortType::UsbPort(usb) => usb.product.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let Ok(mut device) = KiSerial::open(&info.port_name) else {
            continue;
        };
        if !device.is_valid() {
            continue;
        }
        let snum = last_line(device.command("show snum").unwrap_or_default());
        let swver = last_line(device.command("show swver").unwrap_or_default());

        if let Some(wanted) = &filter.snum
            && snum != *wanted
        {
            continue;
        }
        if let Some(wanted) = filter.border_router {
            let is_br = device
                .command("config")
                .unwrap_or_default()
                .join("")
                .contains("hwmode");
            if wanted != is_br {
                continue;
            }
        }
        if let Some(wanted) = filter.uart_only
            && wanted != (device.mode() == PortMode::Kbi)
        {
            continue;
        }

        debug!(port = %info.port_name, %snum, "found Kirale device");
        devices.push(KiDevice {
            port: info.port_name,
            desc,
            snum,
            swver,
            mode: device.mode(),
        });
    }
    devices
}

fn last_line(lines: Vec<String>) -> String {
    lines.last().cloned().unwrap_or_default()
}
