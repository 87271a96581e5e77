//! Firmware flashing engines.
//!
//! The image is uploaded in 64-octet blocks either through USB DFU control
//! transfers (bootloader) or through KBI firmware-update requests over the
//! serial link. Devices flash in parallel worker tasks; every worker writes
//! its terminal outcome string to a shared channel and the supervisor joins
//! a whole batch before starting the next.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::constants::{CMD_FW_UP, KINOS_DFU_PID, KIRALE_VID};
use crate::dfu::{DfuDevice, DfuFile, DfuState};
use crate::discovery::{DeviceFilter, KiDevice, find_devices};
use crate::error::KiError;
use crate::frame::{CC_EXEC, FrameClass, KbiRequest, ResponseCode, type_octet};
use crate::serial::{KbiExchange, KiSerial};

/// Concurrency cap for one USB-DFU batch.
pub const MAX_PARALLEL_DFU: usize = 18;

/// Retry policy for the KBI upload path. The defaults match the device's
/// flash-write pacing.
#[derive(Debug, Clone)]
pub struct KbiFlashOptions {
    pub retries: u32,
    pub retry_pause: Duration,
}

impl Default for KbiFlashOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            retry_pause: Duration::from_secs(5),
        }
    }
}

/// Wall time and per-device outcomes of one flash run.
#[derive(Debug, Clone)]
pub struct FlashSummary {
    pub elapsed: Duration,
    pub outcomes: Vec<String>,
}

impl FlashSummary {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.contains("OK")).count()
    }
}

impl fmt::Display for FlashSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs();
        writeln!(f, "Elapsed: {:02} m {:02} s", secs / 60, secs % 60)?;
        for outcome in &self.outcomes {
            writeln!(f, "\t{outcome}")?;
        }
        write!(
            f,
            "Flashed {} of {} devices.",
            self.success_count(),
            self.outcomes.len()
        )
    }
}

fn progress_bar(progress: &MultiProgress, serial: &str, blocks: u64) -> ProgressBar {
    let bar = progress.add(ProgressBar::new(blocks));
    if let Ok(style) = ProgressStyle::with_template("{prefix:>12} [{bar:40}] {pos}/{len} blocks") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_prefix(serial.to_string());
    bar
}

/// Enumerate Kirale devices on the USB bus.
pub async fn list_kirale_usb() -> Result<Vec<nusb::DeviceInfo>, KiError> {
    Ok(nusb::list_devices()
        .await?
        .filter(|info| info.vendor_id() == KIRALE_VID)
        .collect())
}

/// Detach every run-time device into DFU mode, then flash all bootloaders.
pub async fn dfu_find_and_flash(file: &DfuFile) -> Result<FlashSummary, KiError> {
    let devices = list_kirale_usb().await?;
    let total = devices.len();
    if total == 0 {
        return Err(KiError::NoDfuDevices);
    }

    let mut runtime = 0usize;
    for info in devices {
        if info.product_id() == KINOS_DFU_PID {
            continue;
        }
        runtime += 1;
        match DfuDevice::open(info).await {
            Ok(device) => {
                if let Err(err) = device.detach(0).await {
                    debug!("detach request failed: {err}");
                }
            }
            Err(err) => debug!("could not open run-time device: {err}"),
        }
    }
    if runtime > 0 {
        info!("detaching {runtime} run-time devices");
        // Give the devices time to re-enumerate as bootloaders
        tokio::time::sleep(Duration::from_millis(2_000 + 100 * total as u64)).await;
    }

    let mut dfus = Vec::new();
    for info in list_kirale_usb().await? {
        if info.product_id() != KINOS_DFU_PID {
            continue;
        }
        match DfuDevice::open(info).await {
            Ok(device) => dfus.push(device),
            Err(err) => warn!("could not open DFU device: {err}"),
        }
    }
    if dfus.is_empty() {
        return Err(KiError::NoDfuDevices);
    }
    if dfus.len() < total {
        warn!("expecting at least {total} DFU devices, found {}", dfus.len());
    }

    Ok(flash_all_dfu(dfus, file).await)
}

/// Flash every device over USB DFU, at most [`MAX_PARALLEL_DFU`] at a time.
pub async fn flash_all_dfu(devices: Vec<DfuDevice>, file: &DfuFile) -> FlashSummary {
    let start = Instant::now();
    let progress = MultiProgress::new();
    let blocks: Arc<Vec<Vec<u8>>> = Arc::new(file.blocks().map(<[u8]>::to_vec).collect());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut remaining = devices;
    while !remaining.is_empty() {
        let batch: Vec<DfuDevice> = remaining
            .drain(..remaining.len().min(MAX_PARALLEL_DFU))
            .collect();
        let mut workers = JoinSet::new();
        for device in batch {
            let tx = tx.clone();
            let blocks = Arc::clone(&blocks);
            let bar = progress_bar(&progress, &device.serial(), blocks.len() as u64);
            workers.spawn(async move {
                let outcome = dfu_flash_device(&device, &blocks, &bar).await;
                bar.finish();
                let _ = tx.send(outcome);
            });
        }
        while workers.join_next().await.is_some() {}
    }
    drop(tx);

    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    FlashSummary {
        elapsed: start.elapsed(),
        outcomes,
    }
}

/// Upload all blocks to one DFU device and run the manifest phase.
async fn dfu_flash_device(device: &DfuDevice, blocks: &[Vec<u8>], bar: &ProgressBar) -> String {
    let serial = device.serial();

    // Clear left-over errors
    match device.get_status().await {
        Ok(status) if status.state == DfuState::Error => {
            if device.clear_status().await.is_err() {
                return format!("{serial}: USB error");
            }
        }
        Ok(_) => {}
        Err(_) => return format!("{serial}: USB error"),
    }

    for (bnum, block) in blocks.iter().enumerate() {
        if let Err(err) = device.download(bnum as u16, block).await {
            debug!(%serial, bnum, "download failed: {err}");
            return format!("{serial}: USB error");
        }
        match device.wait_while_state(DfuState::DownloadBusy).await {
            Ok(status) if status.state == DfuState::DownloadIdle => bar.inc(1),
            Ok(status) => return format!("{serial}: Error {}", u8::from(status.state)),
            Err(_) => return format!("{serial}: USB error"),
        }
    }

    if device.leave().await.is_err() {
        return format!("{serial}: USB error");
    }
    match device.get_status().await {
        Ok(status) if status.state == DfuState::ManifestSync => format!("{serial}: OK"),
        Ok(_) => format!("{serial}: Error finish"),
        Err(_) => format!("{serial}: Error finish"),
    }
}

/// Discover UART-attached devices and flash them over KBI.
pub fn kbi_find_and_flash(file: &DfuFile) -> Result<FlashSummary, KiError> {
    let filter = DeviceFilter {
        uart_only: Some(true),
        ..DeviceFilter::default()
    };
    let devices = find_devices(&filter);
    if devices.is_empty() {
        return Err(KiError::NoKbiDevices);
    }
    info!("found {} KBI devices", devices.len());
    Ok(flash_all_kbi(&devices, file, &KbiFlashOptions::default()))
}

/// Flash every device over the serial KBI path, one worker thread each.
pub fn flash_all_kbi(
    devices: &[KiDevice],
    file: &DfuFile,
    options: &KbiFlashOptions,
) -> FlashSummary {
    let start = Instant::now();
    let progress = MultiProgress::new();
    let blocks: Arc<Vec<Vec<u8>>> = Arc::new(file.blocks().map(<[u8]>::to_vec).collect());
    let (tx, rx) = mpsc::channel();

    let mut workers = Vec::new();
    for device in devices {
        let tx = tx.clone();
        let blocks = Arc::clone(&blocks);
        let options = options.clone();
        let port = device.port.clone();
        let snum = device.snum.clone();
        let bar = progress_bar(&progress, &snum, blocks.len() as u64);
        workers.push(thread::spawn(move || {
            let outcome = match KiSerial::open(&port) {
                Ok(mut link) => kbi_flash_device(&mut link, &snum, &blocks, &options, &bar),
                Err(_) => format!("{snum}: Serial error"),
            };
            bar.finish();
            let _ = tx.send(outcome);
        }));
    }
    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }

    FlashSummary {
        elapsed: start.elapsed(),
        outcomes: rx.iter().collect(),
    }
}

/// Upload all blocks to one device over KBI and reset it.
///
/// Each block is sent as a firmware-update request whose payload is the
/// big-endian block index followed by the block data. The device
/// acknowledges by echoing the opcode and the block index in a value
/// response; a firmware-update error response aborts the device, and a
/// response without a payload is not an acknowledgement.
pub fn kbi_flash_device<L: KbiExchange>(
    link: &mut L,
    snum: &str,
    blocks: &[Vec<u8>],
    options: &KbiFlashOptions,
    bar: &ProgressBar,
) -> String {
    for (bnum, block) in blocks.iter().enumerate() {
        let mut payload = Vec::with_capacity(2 + block.len());
        payload.extend_from_slice(&(bnum as u16).to_be_bytes());
        payload.extend_from_slice(block);
        let request =
            match KbiRequest::from_parts(type_octet(FrameClass::Request, CC_EXEC), CMD_FW_UP, &payload) {
                Ok(request) => request,
                Err(_) => return format!("{snum}: Serial error"),
            };

        let mut acknowledged = false;
        for attempt in 0..options.retries {
            match link.kbi_request(&request) {
                Ok(response) => {
                    if response.frame_class() == FrameClass::Response
                        && response.response_code() == ResponseCode::FwUpdateError
                    {
                        return format!("{snum}: FWU error");
                    }
                    if response.frame_class() == FrameClass::Response
                        && response.response_code() == ResponseCode::Value
                        && response.code() == CMD_FW_UP
                        && response.payload().len() >= 2
                        && u16::from_be_bytes([response.payload()[0], response.payload()[1]])
                            == bnum as u16
                    {
                        acknowledged = true;
                        break;
                    }
                }
                Err(KiError::Serial(_)) => return format!("{snum}: Serial error"),
                Err(err) => debug!(%snum, bnum, attempt, "block not acknowledged: {err}"),
            }
            // Give the device time before resending the block
            if attempt + 1 < options.retries {
                thread::sleep(options.retry_pause);
            }
        }
        if !acknowledged {
            return format!(
                "{snum}: Could not send block #{bnum} after {} retries.",
                options.retries
            );
        }
        bar.inc(1);
    }

    let _ = link.text_command("reset");
    format!("{snum}: OK")
}
