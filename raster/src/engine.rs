//! Raster-scan orchestration.
//!
//! The engine owns one mirror driver and one photon counter for the length of
//! a scan. For every grid point, in x-major order, it drives the mirror and
//! then acquires a single count. The loop is strictly sequential: the mirror
//! has to settle and the counter has to integrate before the next point.
//!
//! Failure policy:
//! - Configuration, range and calibration problems are found before the
//!   first drive command and abort with an error.
//! - A failed acquisition degrades that cell to an invalid result and the
//!   raster continues.
//! - A failed drive stops the raster. Cells already collected are returned
//!   in a report tagged [`ScanStatus::Aborted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hardware::mirror::{MirrorDriver, MirrorError, VoltageCodec};
use hardware::odmr::{AcquisitionResult, PhotonCounter, RequestSettings};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ScanConfig};
use crate::grid::Coordinate;
use crate::matrix::ResultMatrix;

/// Errors that prevent a scan from starting.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Scan parameters are invalid or exceed the optical range.
    #[error("Invalid scan configuration: {0}")]
    Config(#[from] ConfigError),

    /// A grid corner cannot be driven with the loaded calibration.
    #[error("Mirror pre-flight failed: {0}")]
    Mirror(#[from] MirrorError),
}

/// Request to stop a running scan between points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the scan to stop before its next point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanStatus {
    /// Every point was visited.
    Complete,
    /// Stopped on request after `completed` points.
    Cancelled {
        /// Points measured before the stop
        completed: usize,
    },
    /// Stopped by a mirror failure after `completed` points.
    Aborted {
        /// Points measured before the failure
        completed: usize,
        /// The drive error
        reason: String,
    },
}

/// Outcome of [`ScanEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Results in raster order
    pub matrix: ResultMatrix,
    /// How the scan ended
    pub status: ScanStatus,
    /// Cells without a valid count
    pub invalid_points: usize,
    /// Wall-clock duration in seconds
    pub elapsed_s: f64,
}

impl ScanReport {
    /// True unless every point was visited.
    pub fn is_partial(&self) -> bool {
        self.status != ScanStatus::Complete
    }
}

/// Drives one raster scan over an owned mirror and photon counter.
///
/// `run` consumes the engine, so a mirror or counter cannot be shared by
/// two scans at once. Both are closed when the scan ends, however it ends.
pub struct ScanEngine<M: MirrorDriver, C: PhotonCounter> {
    mirror: M,
    counter: C,
    codec: VoltageCodec,
    request: RequestSettings,
    cancel: CancelToken,
}

impl<M: MirrorDriver, C: PhotonCounter> ScanEngine<M, C> {
    /// Create an engine from its devices and conversion settings.
    pub fn new(mirror: M, counter: C, codec: VoltageCodec, request: RequestSettings) -> Self {
        Self {
            mirror,
            counter,
            codec,
            request,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally held cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops this engine's scan.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the scan described by `config`.
    ///
    /// Returns an error only if the scan could not start; in that case no
    /// drive command has been sent.
    pub fn run(mut self, config: &ScanConfig) -> Result<ScanReport, ScanError> {
        let result = self.scan(config);
        self.mirror.close();
        self.counter.close();
        result
    }

    /// Range and calibration checks on the grid corners.
    fn preflight(&self, config: &ScanConfig) -> Result<(), ScanError> {
        for (x, y) in config.grid()?.corners() {
            let (vx, vy) = self
                .codec
                .coordinate_drive(x, y, config.volts_per_micron)
                .map_err(ConfigError::from)?;
            self.mirror.check(vx, vy)?;
        }
        Ok(())
    }

    fn scan(&mut self, config: &ScanConfig) -> Result<ScanReport, ScanError> {
        self.preflight(config)?;

        let grid = config.grid()?;
        let integration = config.integration()?;
        let request = self.request.request_for(integration);
        let (nx, ny) = grid.shape();
        let mut matrix = ResultMatrix::new(&grid);
        let mut status = ScanStatus::Complete;
        let started = Instant::now();

        info!(
            "Starting raster scan: {}x{} points, {:.3} s integration",
            nx,
            ny,
            integration.as_secs_f64()
        );

        for point in grid.points() {
            if self.cancel.is_cancelled() {
                info!("Scan cancelled after {} points", matrix.filled());
                status = ScanStatus::Cancelled {
                    completed: matrix.filled(),
                };
                break;
            }

            let Coordinate { x, y } = point.coordinate;
            let drive = match self.codec.coordinate_drive(x, y, config.volts_per_micron) {
                Ok((vx, vy)) => self.mirror.drive(vx, vy).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = drive {
                warn!("Mirror drive failed at ({}, {}): {}", x, y, reason);
                status = ScanStatus::Aborted {
                    completed: matrix.filled(),
                    reason,
                };
                break;
            }

            let result = match self.counter.measure(&request, integration) {
                Ok(result) => result,
                Err(e) => {
                    warn!("Acquisition failed at ({}, {}): {}", x, y, e);
                    AcquisitionResult::invalid()
                }
            };
            debug!(
                "Point ({}, {}) -> {} (valid: {})",
                x, y, result.photon_count, result.valid
            );
            matrix.push(result);

            if point.j + 1 == ny {
                info!("Row {}/{} done (x = {})", point.i + 1, nx, x);
            }
        }

        let invalid_points = matrix.invalid_count();
        let elapsed_s = started.elapsed().as_secs_f64();
        info!(
            "Scan finished: {} of {} points, {} invalid, {:.1} s",
            matrix.filled(),
            grid.len(),
            invalid_points,
            elapsed_s
        );

        Ok(ScanReport {
            matrix,
            status,
            invalid_points,
            elapsed_s,
        })
    }
}
