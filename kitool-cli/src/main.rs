use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use kitool_lib::{DeviceFilter, DfuFile, KiSerialThreaded, KiSniffer, find_devices, flash};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kitool",
    version,
    about = "Serial interface to the KiNOS KBI, KSH, DFU and Sniffer"
)]
struct Args {
    /// Serial device to use
    #[arg(long)]
    port: Option<String>,

    /// Sniffer channel (802.15.4)
    #[arg(long, value_parser = clap::value_parser!(u8).range(11..=26))]
    channel: Option<u8>,

    /// Launch a live capture through a pipe consumer
    #[arg(long)]
    live: bool,

    /// Sniffer capture output file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Show more program output
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=4))]
    debug: u8,

    /// DFU file to flash all connected Kirale devices using the DFU protocol
    #[arg(long)]
    flashdfu: Option<PathBuf>,

    /// DFU file to flash all connected Kirale devices using the KBI protocol
    #[arg(long)]
    flashkbi: Option<PathBuf>,
}

fn init_tracing(debug: u8) {
    let level = match debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Some(path) = &args.flashdfu {
        let file = DfuFile::open(path)?;
        let summary = flash::dfu_find_and_flash(&file).await?;
        println!("{summary}");
        return Ok(());
    }
    if let Some(path) = &args.flashkbi {
        let file = DfuFile::open(path)?;
        let summary = tokio::task::spawn_blocking(move || flash::kbi_find_and_flash(&file)).await??;
        println!("{summary}");
        return Ok(());
    }

    let port = match args.port.clone() {
        Some(port) => port,
        None => choose_port()?,
    };

    if KiSniffer::is_sniffer(&port) {
        run_sniffer(&port, &args).await?;
    } else {
        port_loop(&port)?;
    }
    Ok(())
}

/// Let the user pick among the connected Kirale devices.
fn choose_port() -> Result<String, Box<dyn std::error::Error>> {
    println!("Scanning ports...");
    let devices = find_devices(&DeviceFilter::default());
    if devices.is_empty() {
        return Err("No Kirale devices available.".into());
    }
    println!("Available Kirale devices:");
    for (index, device) in devices.iter().enumerate() {
        println!("{}:  {device}", index + 1);
    }
    if devices.len() == 1 {
        return Ok(devices[0].port.clone());
    }
    let stdin = io::stdin();
    loop {
        print!("Enter port index: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err("No port selected.".into());
        }
        if let Ok(index) = line.trim().parse::<usize>()
            && (1..=devices.len()).contains(&index)
        {
            return Ok(devices[index - 1].port.clone());
        }
    }
}

async fn run_sniffer(port: &str, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut sniffer = KiSniffer::new(port, false)?;
    if args.live {
        let name = sniffer.add_pipe_sink()?;
        println!("Live capture pipe: {name}");
    } else {
        let path = sniffer.add_file_sink(args.file.clone())?;
        println!("Capturing to {}", path.display());
    }

    let channel = match args.channel {
        Some(channel) => channel,
        None => ask_channel()?,
    };
    sniffer.start(channel)?;
    println!("Capture started on channel {channel}.");

    tokio::signal::ctrl_c().await?;
    sniffer.stop()?;
    Ok(())
}

fn ask_channel() -> Result<u8, Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    loop {
        print!("Enter the 802.15.4 capture channel: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err("No channel selected.".into());
        }
        if let Ok(channel) = line.trim().parse::<u8>()
            && (11..=26).contains(&channel)
        {
            return Ok(channel);
        }
    }
}

/// Minimal terminal loop over a threaded transport.
fn port_loop(port: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut device = KiSerialThreaded::open(port)?;
    let short_name = port.rsplit(['/', '\\']).next().unwrap_or(port).to_string();
    let stdin = io::stdin();
    loop {
        print!("{}@{short_name}> ", device.mode());
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        match device.command(command) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
            }
            Err(err) => println!("{err}"),
        }
        if command.contains("reset") {
            break;
        }
    }
    device.close();
    Ok(())
}
