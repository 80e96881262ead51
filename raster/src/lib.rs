//! Raster-scan acquisition engine.
//!
//! Builds a 2D photon-count map by steering the galvo mirror across a grid
//! of sample coordinates and taking one ODMR photon count at each position.
//!
//! - [`config`] - Validated scan parameters and per-installation bench settings
//! - [`grid`] - Half-open axis generation and x-major visiting order
//! - [`matrix`] - Results with row and column labels in raster order
//! - [`engine`] - The scan loop, its failure policy and cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hardware::mirror::{CalibrationTable, MirrorLink, VoltageCodec};
//! use hardware::odmr::{AcquisitionClient, ClientSettings, RequestSettings};
//! use raster::{ScanConfig, ScanEngine};
//!
//! let calibration = Arc::new(CalibrationTable::from_path("pwm_correction.csv".as_ref())?);
//! let mirror = MirrorLink::connect("/dev/ttyUSB0", 115_200, calibration)?;
//! let counter = AcquisitionClient::connect("192.168.0.2:9100", ClientSettings::default())?;
//!
//! let config = ScanConfig {
//!     x_start: 0.0, x_stop: 10.0, x_step: 1.0,
//!     y_start: 0.0, y_stop: 10.0, y_step: 1.0,
//!     volts_per_micron: 0.1,
//!     integration_seconds: 0.5,
//! };
//! let engine = ScanEngine::new(mirror, counter, VoltageCodec::default(), RequestSettings::default());
//! let report = engine.run(&config)?;
//! println!("{}", report.matrix.counts());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod engine;
pub mod grid;
pub mod matrix;

pub use config::{
    BenchConfig, ConfigError, ScanConfig, ScanEstimate, MAX_INTEGRATION_SECONDS,
    MAX_SCAN_POINTS,
};
pub use engine::{CancelToken, ScanEngine, ScanError, ScanReport, ScanStatus};
pub use grid::{axis_positions, Coordinate, GridPoint, RasterGrid};
pub use matrix::{Cell, ResultMatrix};
