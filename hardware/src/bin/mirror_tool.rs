//! Command-line tool for the galvo mirror controller.
//!
//! Subcommands:
//! - `angle`: Point the mirror at a pair of mechanical angles
//! - `volts`: Drive a pair of centred voltages directly
//! - `duty`: Print the calibrated duty cycle for a voltage without moving
//! - `feedback`: Read and decode the controller's raw ADC feedback

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hardware::mirror::{
    format_duty_cycle, CalibrationTable, MirrorDriver, MirrorLink, VoltageCodec, DEFAULT_ANGLE_SCALE,
    DEFAULT_BAUD_RATE, DEFAULT_CENTER_OFFSET_V, DEFAULT_FEEDBACK_GAIN, DEFAULT_MAX_DRIVE_V,
};
use tracing::info;

/// Galvo Mirror Controller Tool
#[derive(Parser, Debug)]
#[command(name = "mirror_tool")]
#[command(about = "Drive the two-axis galvo mirror controller over serial")]
#[command(version)]
struct Args {
    /// Serial port of the controller (e.g. /dev/ttyUSB0 or COM3)
    #[arg(long, global = true, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// PWM calibration CSV
    #[arg(long, global = true, default_value = "pwm_correction.csv")]
    calibration: PathBuf,

    /// Centre offset added to every logical voltage
    #[arg(long, global = true, default_value_t = DEFAULT_CENTER_OFFSET_V)]
    center_offset: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Point at mechanical angles (degrees)
    Angle {
        /// X mechanical angle
        #[arg(short, long, allow_hyphen_values = true)]
        x: f64,

        /// Y mechanical angle
        #[arg(short, long, allow_hyphen_values = true)]
        y: f64,

        /// Volts per degree
        #[arg(long, default_value_t = DEFAULT_ANGLE_SCALE)]
        scale: f64,
    },

    /// Drive centred voltages directly
    Volts {
        /// X centred voltage
        #[arg(short, long)]
        x: f64,

        /// Y centred voltage
        #[arg(short, long)]
        y: f64,
    },

    /// Show calibrated duty cycle for a centred voltage (no hardware)
    Duty {
        /// Centred voltage
        voltage: f64,
    },

    /// Read raw ADC feedback
    Feedback {
        /// Divider gain between amplifier and ADC
        #[arg(long, default_value_t = DEFAULT_FEEDBACK_GAIN)]
        gain: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let calibration = Arc::new(
        CalibrationTable::from_path(&args.calibration)
            .with_context(|| format!("Failed to load {}", args.calibration.display()))?,
    );
    let (min, max) = calibration.voltage_range();
    info!("Calibration: {} samples, {min:.3}..{max:.3} V", calibration.len());

    match args.command {
        Command::Angle { x, y, scale } => {
            let codec = VoltageCodec {
                center_offset_v: args.center_offset,
                angle_scale: scale,
                max_drive_v: DEFAULT_MAX_DRIVE_V,
            };
            let (vx, vy) = codec.angle_drive(x, y);
            info!("Angles ({x}, {y}) deg -> ({vx:.4}, {vy:.4}) V");
            drive_once(&args.port, args.baud, calibration, vx, vy)
        }
        Command::Volts { x, y } => drive_once(&args.port, args.baud, calibration, x, y),
        Command::Duty { voltage } => {
            let duty = calibration.duty_cycle_for(voltage)?;
            println!("{voltage:.4} V -> duty {}", format_duty_cycle(duty));
            Ok(())
        }
        Command::Feedback { gain } => {
            let mut link = MirrorLink::connect(&args.port, args.baud, calibration)?;
            match link.read_feedback(gain)? {
                Some(v) => println!("Feedback: {v:.4} V"),
                None => println!("No feedback received"),
            }
            Ok(())
        }
    }
}

fn drive_once(
    port: &str,
    baud: u32,
    calibration: Arc<CalibrationTable>,
    vx: f64,
    vy: f64,
) -> Result<()> {
    let mut link = MirrorLink::connect(port, baud, calibration)?;
    link.drive(vx, vy)?;
    link.close();
    info!("Done!");
    Ok(())
}
