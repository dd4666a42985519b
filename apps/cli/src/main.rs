use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fwup_core::session::{BootloaderEntry, FirmwareSource, Updater};
use fwup_core::transport::DeviceBroker;
use fwup_core::{
    CommandChannel, DirectoryFetcher, FirmwareManifest, NusbBroker, PreparedImage, TargetProfile,
};
use tracing::{error, info, warn};

mod serial;

use serial::{DEFAULT_BAUD_RATE, TtyChannel};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DfuSe firmware updater for the STM32F446 instrument",
    long_about = None
)]
struct Cli {
    /// Target profile (TOML); defaults to the STM32F446 instrument
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flash a local Intel HEX file
    Flash {
        /// Firmware image (.hex)
        hex: PathBuf,
        /// Serial port of the running instrument; enters DFU mode automatically.
        /// Without it the device must already be in DFU mode.
        #[arg(long)]
        serial: Option<PathBuf>,
    },
    /// Compare the running firmware with a release manifest
    Check {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        serial: Option<PathBuf>,
    },
    /// Install a release if it is newer than the running firmware
    Update {
        #[arg(long)]
        manifest: PathBuf,
        /// Directory holding the release artifacts
        #[arg(long)]
        release_dir: PathBuf,
        #[arg(long)]
        serial: Option<PathBuf>,
        /// Flash even if the running firmware is up to date
        #[arg(long)]
        force: bool,
    },
    /// Show what a HEX file would write, without touching a device
    Inspect { hex: PathBuf },
    /// List connected bootloader devices
    Devices,
    /// Print the target profile as TOML
    Profile {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let profile = match &cli.config {
        Some(path) => TargetProfile::load_from_file(path)?,
        None => TargetProfile::default(),
    };

    match cli.command {
        Commands::Flash { hex, serial } => {
            let text = std::fs::read_to_string(&hex)
                .with_context(|| format!("Failed to read {}", hex.display()))?;
            let source = FirmwareSource::Local {
                file_name: file_name(&hex),
                text,
            };
            install(updater(&profile), source, serial.as_deref())
        }
        Commands::Check { manifest, serial } => {
            let manifest = load_manifest(&manifest)?;
            let mut channel = open_channel(serial.as_deref())?;
            let channel = channel.as_mut().map(|c| c as &mut dyn CommandChannel);
            let info = updater(&profile).check_for_update(channel, manifest)?;

            println!("Current: {}", info.current);
            println!("Latest:  {}", info.latest);
            println!("{}", info.manifest.description());
            if info.available {
                println!("Update available");
            } else {
                println!("Firmware is up to date");
            }
            Ok(())
        }
        Commands::Update {
            manifest,
            release_dir,
            serial,
            force,
        } => {
            let manifest = load_manifest(&manifest)?;
            let mut updater = updater(&profile).with_fetcher(DirectoryFetcher::new(release_dir));

            let mut channel = open_channel(serial.as_deref())?;
            let info = updater.check_for_update(
                channel.as_mut().map(|c| c as &mut dyn CommandChannel),
                manifest,
            )?;
            if !info.available && !force {
                info!(current = %info.current, "Firmware is up to date");
                return Ok(());
            }
            info!(from = %info.current, to = %info.latest, "Installing release");

            let source = FirmwareSource::Release {
                manifest: info.manifest,
            };
            let entry = match channel.as_mut() {
                Some(channel) => BootloaderEntry::Automatic(channel),
                None => BootloaderEntry::Manual,
            };
            report(updater.perform_update(source, entry))
        }
        Commands::Inspect { hex } => inspect(&profile, &hex),
        Commands::Devices => devices(&profile),
        Commands::Profile { output } => {
            match output {
                Some(path) => {
                    profile.save_to_file(&path)?;
                    info!(path = %path.display(), "Profile written");
                }
                None => print!("{}", profile.to_toml()?),
            }
            Ok(())
        }
    }
}

fn updater(profile: &TargetProfile) -> Updater<NusbBroker, fwup_core::TracingObserver> {
    let broker = NusbBroker::new(profile.device_wait()).with_max_polls(profile.max_status_polls);
    Updater::new(broker, profile.clone())
}

fn install(
    mut updater: Updater<NusbBroker, fwup_core::TracingObserver>,
    source: FirmwareSource,
    serial: Option<&Path>,
) -> Result<()> {
    match open_channel(serial)? {
        Some(mut channel) => {
            let entry = BootloaderEntry::Automatic(&mut channel);
            report(updater.perform_update(source, entry))
        }
        None => report(updater.perform_update(source, BootloaderEntry::Manual)),
    }
}

fn report(result: Result<fwup_core::UpdateReport, fwup_core::UpdateError>) -> Result<()> {
    match result {
        Ok(report) => {
            info!(
                device = %report.device,
                bytes = report.flash.bytes_written,
                blocks = report.flash.blocks,
                "Firmware updated"
            );
            for span in &report.rejected {
                warn!(segment = %span, "Not written (outside safe ranges)");
            }
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            warn!("No DFU device selected or found");
            Ok(())
        }
        Err(e) => {
            for recovery in &e.recovery_errors {
                warn!(error = %recovery, "Recovery step failed");
            }
            Err(e.into())
        }
    }
}

fn inspect(profile: &TargetProfile, hex: &Path) -> Result<()> {
    let text = std::fs::read_to_string(hex)
        .with_context(|| format!("Failed to read {}", hex.display()))?;
    let image = PreparedImage::from_hex(&text, &profile.safe_ranges, profile.merge_gap)?;
    let map = profile.default_memory_map()?;

    println!("{}: {} parsed segment(s)", hex.display(), image.parsed_count);
    for span in &image.rejected {
        println!("  skipped  {}", span);
    }
    for segment in &image.segments {
        println!("  write    {}", segment.span());
        for sector in map.erase_footprint(segment.start, segment.len())? {
            println!(
                "    erase  0x{:08X}..0x{:08X} ({} KB)",
                sector.start,
                sector.end,
                sector.sector_size / 1024
            );
        }
    }
    let sectors = image.verify_erase_footprint(&map, &profile.safe_ranges)?;
    println!(
        "{} byte(s) in {} segment(s), {} sector(s) erased",
        image.total_bytes(),
        image.segments.len(),
        sectors
    );
    Ok(())
}

fn devices(profile: &TargetProfile) -> Result<()> {
    let mut broker = NusbBroker::new(Duration::ZERO);
    let found = broker.authorized_devices(profile.bootloader)?;
    if found.is_empty() {
        println!("No {} bootloader found", profile.bootloader);
        return Ok(());
    }
    for device in found {
        println!("{}", device);
        match broker.dfu_interfaces(&device) {
            Ok(interfaces) => {
                for interface in interfaces {
                    println!(
                        "  interface {} alt {}: {}",
                        interface.number,
                        interface.alt_setting,
                        interface.name.as_deref().unwrap_or("-")
                    );
                }
            }
            Err(e) => warn!(error = %e, "Could not read interfaces"),
        }
    }
    Ok(())
}

fn open_channel(path: Option<&Path>) -> Result<Option<TtyChannel>> {
    path.map(|p| {
        TtyChannel::open(p, DEFAULT_BAUD_RATE)
            .with_context(|| format!("Failed to open serial port {}", p.display()))
    })
    .transpose()
}

fn load_manifest(path: &Path) -> Result<FirmwareManifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    Ok(FirmwareManifest::from_json(&text)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

