//! Raster-scan bench tool.
//!
//! Subcommands:
//! - `scan`: Run a full raster and print or save the photon-count map
//! - `estimate`: Show grid size and expected duration without hardware
//! - `point`: Steer the mirror to a pair of mechanical angles
//! - `goto`: Steer the mirror to a sample coordinate in microns

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hardware::mirror::{CalibrationTable, MirrorDriver, MirrorLink};
use hardware::odmr::AcquisitionClient;
use raster::{BenchConfig, ScanConfig, ScanEngine, ScanStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Raster-scan photon-count mapping
#[derive(Parser, Debug)]
#[command(name = "raster_scan")]
#[command(about = "Galvo raster scan with ODMR photon counting")]
#[command(version)]
struct Args {
    /// Bench configuration JSON (defaults are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the mirror controller serial port
    #[arg(long, global = true)]
    port: Option<String>,

    /// Override the ODMR board address (host:port)
    #[arg(long, global = true)]
    odmr_addr: Option<String>,

    /// Override the PWM calibration CSV
    #[arg(long, global = true)]
    calibration: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Grid and timing of one raster
#[derive(clap::Args, Debug)]
struct GridArgs {
    /// First X position (µm)
    #[arg(long, allow_hyphen_values = true)]
    x_start: f64,

    /// Exclusive X bound (µm)
    #[arg(long, allow_hyphen_values = true)]
    x_stop: f64,

    /// X step (µm)
    #[arg(long, default_value = "1.0")]
    x_step: f64,

    /// First Y position (µm)
    #[arg(long, allow_hyphen_values = true)]
    y_start: f64,

    /// Exclusive Y bound (µm)
    #[arg(long, allow_hyphen_values = true)]
    y_stop: f64,

    /// Y step (µm)
    #[arg(long, default_value = "1.0")]
    y_step: f64,

    /// Drive-voltage scale (V/µm)
    #[arg(short = 'k', long, allow_hyphen_values = true)]
    volts_per_micron: f64,

    /// Photon integration time per point (s)
    #[arg(short, long, default_value = "0.5")]
    integration: f64,
}

impl GridArgs {
    fn to_config(&self) -> ScanConfig {
        ScanConfig {
            x_start: self.x_start,
            x_stop: self.x_stop,
            x_step: self.x_step,
            y_start: self.y_start,
            y_stop: self.y_stop,
            y_step: self.y_step,
            volts_per_micron: self.volts_per_micron,
            integration_seconds: self.integration,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a raster scan
    Scan {
        #[command(flatten)]
        grid: GridArgs,

        /// Write the scan report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Estimate scan duration (no hardware)
    Estimate {
        #[command(flatten)]
        grid: GridArgs,
    },

    /// Point the mirror at mechanical angles (degrees)
    Point {
        /// X mechanical angle
        #[arg(long, allow_hyphen_values = true)]
        x_angle: f64,

        /// Y mechanical angle
        #[arg(long, allow_hyphen_values = true)]
        y_angle: f64,

        /// Read and print controller feedback after the move
        #[arg(long)]
        feedback: bool,
    },

    /// Point the mirror at a sample coordinate (µm)
    Goto {
        /// X position (µm)
        #[arg(long, allow_hyphen_values = true)]
        x_um: f64,

        /// Y position (µm)
        #[arg(long, allow_hyphen_values = true)]
        y_um: f64,

        /// Drive-voltage scale (V/µm)
        #[arg(short = 'k', long, allow_hyphen_values = true)]
        volts_per_micron: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let bench = load_bench(&args)?;

    match &args.command {
        Command::Scan { grid, output } => run_scan(&bench, &grid.to_config(), output.as_ref()),
        Command::Estimate { grid } => {
            let config = grid.to_config();
            config.check_range(&bench.voltage)?;
            let est = config.estimate(&bench.client_settings()?)?;
            println!("Grid:     {} x {} ({} points)", est.shape.0, est.shape.1, est.points);
            println!("Nominal:  {:.1} s", est.nominal.as_secs_f64());
            println!("Expected: {:.1} s", est.expected.as_secs_f64());
            Ok(())
        }
        Command::Point {
            x_angle,
            y_angle,
            feedback,
        } => {
            let (vx, vy) = bench.voltage.angle_drive(*x_angle, *y_angle);
            info!("Angles ({x_angle}, {y_angle}) deg -> ({vx:.4}, {vy:.4}) V");
            let mut link = open_mirror(&bench)?;
            link.drive(vx, vy)?;
            if *feedback {
                match link.read_feedback(bench.feedback_gain)? {
                    Some(v) => println!("Feedback: {v:.4} V"),
                    None => println!("No feedback received"),
                }
            }
            link.close();
            Ok(())
        }
        Command::Goto {
            x_um,
            y_um,
            volts_per_micron,
        } => {
            let (vx, vy) = bench
                .voltage
                .coordinate_drive(*x_um, *y_um, *volts_per_micron)?;
            info!("Coordinate ({x_um}, {y_um}) um -> ({vx:.4}, {vy:.4}) V");
            let mut link = open_mirror(&bench)?;
            link.drive(vx, vy)?;
            link.close();
            Ok(())
        }
    }
}

fn load_bench(args: &Args) -> Result<BenchConfig> {
    let mut bench = match &args.config {
        Some(path) => BenchConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => BenchConfig::default(),
    };
    if let Some(port) = &args.port {
        bench.serial_port = port.clone();
    }
    if let Some(addr) = &args.odmr_addr {
        bench.odmr_addr = addr.clone();
    }
    if let Some(path) = &args.calibration {
        bench.calibration_path = path.clone();
    }
    Ok(bench)
}

fn open_mirror(bench: &BenchConfig) -> Result<MirrorLink> {
    let path = &bench.calibration_path;
    let calibration = CalibrationTable::from_path(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let (min, max) = calibration.voltage_range();
    info!("Calibration: {} samples, {min:.3}..{max:.3} V", calibration.len());
    Ok(MirrorLink::connect(
        &bench.serial_port,
        bench.baud_rate,
        Arc::new(calibration),
    )?)
}

fn run_scan(bench: &BenchConfig, config: &ScanConfig, output: Option<&PathBuf>) -> Result<()> {
    // Reject bad parameters before opening any device
    config.check_range(&bench.voltage)?;
    let est = config.estimate(&bench.client_settings()?)?;
    info!(
        "Scanning {} x {} points, expected {:.1} s",
        est.shape.0,
        est.shape.1,
        est.expected.as_secs_f64()
    );

    let mirror = open_mirror(bench)?;
    let counter = AcquisitionClient::connect(bench.odmr_addr.as_str(), bench.client_settings()?)
        .with_context(|| format!("Failed to connect to ODMR board at {}", bench.odmr_addr))?;

    let report = ScanEngine::new(mirror, counter, bench.voltage, bench.request).run(config)?;

    match &report.status {
        ScanStatus::Complete => info!("Scan complete"),
        ScanStatus::Cancelled { completed } => warn!("Scan cancelled after {completed} points"),
        ScanStatus::Aborted { completed, reason } => {
            warn!("Scan aborted after {completed} points: {reason}")
        }
    }
    if report.invalid_points > 0 {
        warn!("{} points without a valid count", report.invalid_points);
    }

    match output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", report.matrix.counts()),
    }
    Ok(())
}
