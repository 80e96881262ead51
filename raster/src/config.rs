//! Scan and bench configuration.
//!
//! Two layers of configuration exist:
//!
//! - [`ScanConfig`] describes one raster: the grid in microns, the
//!   micron-to-volt scale and the per-point integration time. It is built
//!   and validated before any hardware is touched.
//! - [`BenchConfig`] holds the per-installation constants: device
//!   addresses, protocol timeouts and the hardware-unit-specific voltage
//!   constants. It is loaded from JSON, every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hardware::mirror::{RangeError, VoltageCodec, DEFAULT_BAUD_RATE, DEFAULT_FEEDBACK_GAIN};
use hardware::odmr::{ClientSettings, RequestSettings, DEFAULT_ODMR_ADDR};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{axis_positions, RasterGrid};

/// Upper bound on grid size; larger grids are almost certainly unit mistakes.
pub const MAX_SCAN_POINTS: usize = 4_000_000;

/// Upper bound on per-point integration time (4 h).
pub const MAX_INTEGRATION_SECONDS: f64 = 14_400.0;

/// Errors in scan or bench configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric field is NaN or infinite.
    #[error("{field} must be finite, got {value}")]
    NotFinite {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
    },

    /// A step, scale or time that must be positive is not.
    #[error("{field} must be positive, got {value}")]
    NotPositive {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
    },

    /// Stop cannot be reached from start by positive steps.
    #[error("{axis} axis is empty: stop {stop} must exceed start {start}")]
    EmptyAxis {
        /// Axis label
        axis: &'static str,
        /// Start position in microns
        start: f64,
        /// Stop position in microns
        stop: f64,
    },

    /// A time or size exceeds its upper bound.
    #[error("{field} must not exceed {limit}, got {value}")]
    TooLarge {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
        /// Upper bound
        limit: f64,
    },

    /// Grid has more points than [`MAX_SCAN_POINTS`].
    #[error("Scan has {points} points, limit is {MAX_SCAN_POINTS}")]
    TooManyPoints {
        /// Requested point count
        points: usize,
    },

    /// A grid corner maps to a drive voltage beyond the optical limit.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Bench configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bench configuration file is not valid JSON for [`BenchConfig`].
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

fn finite(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigError::NotFinite { field, value })
    }
}

fn positive(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if finite(field, value)? > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    positive(field, value)?;
    let duration =
        Duration::try_from_secs_f64(value).map_err(|_| ConfigError::NotFinite { field, value })?;
    // Sub-nanosecond values round to zero, which socket timeouts reject
    if duration.is_zero() {
        return Err(ConfigError::NotPositive { field, value });
    }
    Ok(duration)
}

/// One raster scan.
///
/// Axes follow the half-open convention: `start, start + step, ...` while
/// strictly below `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First X position (µm)
    pub x_start: f64,
    /// Exclusive X bound (µm)
    pub x_stop: f64,
    /// X step (µm)
    pub x_step: f64,
    /// First Y position (µm)
    pub y_start: f64,
    /// Exclusive Y bound (µm)
    pub y_stop: f64,
    /// Y step (µm)
    pub y_step: f64,
    /// Drive-voltage scale of the optics
    pub volts_per_micron: f64,
    /// Photon integration time per point (s)
    pub integration_seconds: f64,
}

impl ScanConfig {
    /// Check every field and the grid size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        finite("x_start", self.x_start)?;
        finite("x_stop", self.x_stop)?;
        finite("y_start", self.y_start)?;
        finite("y_stop", self.y_stop)?;
        positive("x_step", self.x_step)?;
        positive("y_step", self.y_step)?;
        seconds("integration_seconds", self.integration_seconds)?;
        if self.integration_seconds > MAX_INTEGRATION_SECONDS {
            return Err(ConfigError::TooLarge {
                field: "integration_seconds",
                value: self.integration_seconds,
                limit: MAX_INTEGRATION_SECONDS,
            });
        }

        if finite("volts_per_micron", self.volts_per_micron)? == 0.0 {
            return Err(ConfigError::NotPositive {
                field: "volts_per_micron",
                value: self.volts_per_micron,
            });
        }

        for (axis, start, stop) in [
            ("x", self.x_start, self.x_stop),
            ("y", self.y_start, self.y_stop),
        ] {
            if stop <= start {
                return Err(ConfigError::EmptyAxis { axis, start, stop });
            }
        }

        let points = self.axis_len(self.x_start, self.x_stop, self.x_step)
            .saturating_mul(self.axis_len(self.y_start, self.y_stop, self.y_step));
        if points > MAX_SCAN_POINTS {
            return Err(ConfigError::TooManyPoints { points });
        }
        Ok(())
    }

    fn axis_len(&self, start: f64, stop: f64, step: f64) -> usize {
        ((stop - start) / step).ceil() as usize
    }

    /// Integration time as a duration.
    pub fn integration(&self) -> Result<Duration, ConfigError> {
        self.validate()?;
        seconds("integration_seconds", self.integration_seconds)
    }

    /// Validate and generate the raster grid.
    pub fn grid(&self) -> Result<RasterGrid, ConfigError> {
        self.validate()?;
        Ok(RasterGrid::new(
            axis_positions(self.x_start, self.x_stop, self.x_step),
            axis_positions(self.y_start, self.y_stop, self.y_step),
        ))
    }

    /// Reject grids whose corners exceed the codec's optical limit.
    ///
    /// The coordinate to voltage map is linear, so checking the extreme
    /// coordinates of each axis covers every point.
    pub fn check_range(&self, codec: &VoltageCodec) -> Result<(), ConfigError> {
        let grid = self.grid()?;
        for (x, y) in grid.corners() {
            codec.coordinate_drive(x, y, self.volts_per_micron)?;
        }
        Ok(())
    }

    /// Pre-flight duration estimate.
    pub fn estimate(&self, settings: &ClientSettings) -> Result<ScanEstimate, ConfigError> {
        let grid = self.grid()?;
        let integration = self.integration()?;
        let points = grid.len();
        let per_point = settings
            .settle_time(integration)
            .saturating_add(settings.poll_delay);
        Ok(ScanEstimate {
            shape: grid.shape(),
            points,
            nominal: integration.saturating_mul(points as u32),
            expected: per_point.saturating_mul(points as u32),
        })
    }
}

/// How long a scan will take, before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanEstimate {
    /// `(len(xs), len(ys))`
    pub shape: (usize, usize),
    /// Total number of points
    pub points: usize,
    /// Points × integration time
    pub nominal: Duration,
    /// Including settle margin and poll delay per point
    pub expected: Duration,
}

/// Per-installation constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Mirror controller serial port
    pub serial_port: String,
    /// Mirror controller baud rate
    pub baud_rate: u32,
    /// ODMR board `host:port`
    pub odmr_addr: String,
    /// PWM calibration CSV
    pub calibration_path: PathBuf,
    /// TCP connect timeout (s)
    pub connect_timeout_s: f64,
    /// Start request timeout (s)
    pub request_timeout_s: f64,
    /// Poll timeout (s)
    pub poll_timeout_s: f64,
    /// Delay between poll send and receive (s)
    pub poll_delay_s: f64,
    /// Wait after start as a multiple of integration time
    pub settle_multiplier: f64,
    /// ADC feedback divider gain
    pub feedback_gain: f64,
    /// Voltage conversion constants
    pub voltage: VoltageCodec,
    /// RF settings for photon-count requests
    pub request: RequestSettings,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let client = ClientSettings::default();
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            odmr_addr: DEFAULT_ODMR_ADDR.to_string(),
            calibration_path: PathBuf::from("pwm_correction.csv"),
            connect_timeout_s: client.connect_timeout.as_secs_f64(),
            request_timeout_s: client.request_timeout.as_secs_f64(),
            poll_timeout_s: client.poll_timeout.as_secs_f64(),
            poll_delay_s: client.poll_delay.as_secs_f64(),
            settle_multiplier: client.settle_multiplier,
            feedback_gain: DEFAULT_FEEDBACK_GAIN,
            voltage: VoltageCodec::default(),
            request: RequestSettings::default(),
        }
    }
}

impl BenchConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.client_settings()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Session timing derived from this configuration.
    pub fn client_settings(&self) -> Result<ClientSettings, ConfigError> {
        let poll_delay = if self.poll_delay_s == 0.0 {
            Duration::ZERO
        } else {
            seconds("poll_delay_s", self.poll_delay_s)?
        };
        Ok(ClientSettings {
            connect_timeout: seconds("connect_timeout_s", self.connect_timeout_s)?,
            request_timeout: seconds("request_timeout_s", self.request_timeout_s)?,
            poll_timeout: seconds("poll_timeout_s", self.poll_timeout_s)?,
            poll_delay,
            settle_multiplier: positive("settle_multiplier", self.settle_multiplier)?,
        })
    }
}
