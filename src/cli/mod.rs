//! Types and functions for the command-line interface
//!
//! No stability guaranties apply

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::Duration,
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};

use self::{config::Config, serial::get_serial_port};
use crate::{
    codec::Value,
    command::{CommandRequest, CommandStatus},
    flasher::FlashState,
    progress::ProgressCallbacks,
    registry::{discover, SystemPorts},
    session::SessionConfig,
    DeviceProfile,
    Error,
    Peripheral,
};

pub mod config;

mod serial;

/// How often `monitor` collects telemetry
const MONITOR_INTERVAL: Duration = Duration::from_millis(50);

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "PERIPHLINK_PORT")]
    pub serial: Option<String>,
    /// Response timeout in milliseconds, overriding the configuration
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Run a single block command
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct RunArgs {
    /// Opcode of the block, e.g. `screenInit`
    pub opcode: String,
    /// Positional arguments; all of them, or none to use the block's defaults
    pub args: Vec<String>,
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Upload the device firmware
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Firmware image to upload instead of the profile's
    #[arg(long)]
    pub firmware: Option<PathBuf>,
    /// Transfer without pausing between blocks
    #[arg(long)]
    pub no_slow_mode: bool,
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Connect to the peripheral selected by `args` and `config`
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Peripheral> {
    let profile = config.profile();
    let port = get_serial_port(args, config, &profile, &SystemPorts)?;

    let mut session_config: SessionConfig = config.session.session;
    if let Some(timeout) = args.timeout {
        session_config.response_timeout_ms = timeout;
    }

    let mut peripheral = Peripheral::new(profile)?
        .with_session_config(session_config)
        .with_flash_settings(config.flash.settings)
        .with_connect_timeout(config.session.connect_timeout());

    println!("Serial port: '{port}'");
    println!("Connecting...\n");

    peripheral
        .connect(&port)
        .wrap_err_with(|| format!("Failed to open serial port {port}"))?;

    Ok(peripheral)
}

/// Print the attached ports matching the configured profile
pub fn list_ports(config: &Config) -> Result<()> {
    let candidates = discover(&config.profile(), &SystemPorts)?;

    if candidates.is_empty() {
        println!("No matching serial ports found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Port")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Device")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Product")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
        ]);

    for candidate in candidates {
        table.add_row(vec![
            Cell::new(&candidate.port_name),
            Cell::new(&candidate.token),
            Cell::new(candidate.product.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");

    Ok(())
}

/// Print the validated block table
pub fn print_blocks(config: &Config) -> Result<()> {
    let peripheral = Peripheral::new(config.profile())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Category").add_attribute(Attribute::Bold),
            Cell::new("Opcode").add_attribute(Attribute::Bold),
            Cell::new("Kind").add_attribute(Attribute::Bold),
            Cell::new("Text").add_attribute(Attribute::Bold),
            Cell::new("Arguments").add_attribute(Attribute::Bold),
        ]);

    for entry in peripheral.blocks().entries() {
        let args = entry
            .block
            .args
            .iter()
            .map(|arg| match arg.menu {
                Some(menu) => format!("{}: {} = {} [{menu}]", arg.name, arg.ty, arg.default),
                None => format!("{}: {} = {}", arg.name, arg.ty, arg.default),
            })
            .collect::<Vec<_>>()
            .join("\n");

        table.add_row(vec![
            Cell::new(entry.category.name),
            Cell::new(entry.opcode).fg(Color::Cyan),
            Cell::new(entry.block.kind),
            Cell::new(entry.block.text),
            Cell::new(args),
        ]);
    }

    println!("{table}");

    Ok(())
}

/// Submit one command and print its result
pub fn run_command(args: RunArgs, config: &Config) -> Result<()> {
    // Validate before touching the device
    let request = if args.args.is_empty() {
        Peripheral::new(config.profile())?
            .blocks()
            .request(&args.opcode, &[])?
    } else {
        let raw = args.args.iter().map(String::as_str).collect::<Vec<_>>();
        CommandRequest::from_name(&args.opcode, &raw)?
    };
    debug!("Request: {request:?}");

    let peripheral = connect(&args.connect_args, config)?;
    let result = peripheral.run(request)?;

    match &result.status {
        CommandStatus::Ok(Some(value)) => print_value(value),
        CommandStatus::Ok(None) => println!("{} completed", result.opcode),
        _ => {}
    }

    result.into_result()?;

    Ok(())
}

fn print_value(value: &Value) {
    match value {
        Value::Bytes(bytes) => println!("{} bytes", bytes.len()),
        value => println!("{value}"),
    }
}

/// Upload firmware with a progress bar
pub fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let mut profile = config.profile();

    let image_path = match &args.firmware {
        Some(path) => path.clone(),
        None => profile.firmware_path(&config.firmware_dir()),
    };
    let image = std::fs::read(&image_path)
        .map_err(|e| Error::FirmwareNotFound(image_path.clone(), e))?;

    if args.no_slow_mode {
        let mut flash = profile.flash().clone();
        flash.slow_mode = false;
        profile = DeviceProfile::new(
            profile.id(),
            profile.filters().to_vec(),
            *profile.serial(),
            flash,
        )?;
    }

    let mut config = config.clone();
    config.profile = Some(profile);

    let peripheral = connect(&args.connect_args, &config)?;

    println!("Flashing {} ({} bytes)", image_path.display(), image.len());
    peripheral.upload_image(image, Some(Box::new(FlashProgress::default())))?;

    println!("Flashing has completed!");

    Ok(())
}

/// Print telemetry events until interrupted
pub fn monitor(args: ConnectArgs, config: &Config) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .into_diagnostic()
            .wrap_err("Failed to install the Ctrl-C handler")?;
    }

    let peripheral = connect(&args, config)?;
    let session = peripheral.session()?;

    println!("Monitoring telemetry, press Ctrl-C to exit");

    while !stop.load(Ordering::SeqCst) {
        for event in session.drain_telemetry() {
            match &event.value {
                Some(value) => println!("[{}] {value}", event.channel),
                None => println!("[{}]", event.channel),
            }
        }

        sleep(MONITOR_INTERVAL);
    }

    Ok(())
}

/// Progress bar for firmware uploads
#[derive(Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, total: usize) {
        let pb = ProgressBar::new(total as u64).with_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message("writing blocks");

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish_with_message("transferred");
        }
    }

    fn stage(&mut self, state: FlashState) {
        match &self.pb {
            _ if state == FlashState::Idle => {}
            Some(pb) if !pb.is_finished() => pb.set_message(state.to_string()),
            _ => println!("{state}"),
        }
    }
}
