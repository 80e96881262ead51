//! Voltage to PWM duty-cycle calibration table.
//!
//! The mirror controller does not accept voltages directly. It drives each
//! axis through a PWM stage followed by a low-pass filter and amplifier, so
//! the command it understands is a duty cycle in `[0, 1]`. The relation
//! between commanded duty cycle and the voltage that actually reaches the
//! mirror is measured per unit and stored as a two-column CSV file:
//!
//! ```text
//! Реальное напряжение,Коэффициент заполнения ШИМ
//! 8.60,0.412
//! 9.10,0.437
//! ...
//! ```
//!
//! The first column is the measured voltage, the second the duty cycle that
//! produced it. The table is loaded once and queried by linear
//! interpolation between the two bracketing samples. Queries outside the
//! sampled voltage domain are rejected, never extrapolated.

use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Header of the measured-voltage column.
pub const VOLTAGE_COLUMN: &str = "Реальное напряжение";

/// Header of the duty-cycle column.
pub const DUTY_CYCLE_COLUMN: &str = "Коэффициент заполнения ШИМ";

/// Number of decimal digits the controller firmware parses.
pub const DUTY_CYCLE_DECIMALS: usize = 3;

/// Errors raised while loading or querying a calibration table.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// The table is malformed or has too few samples.
    #[error("Calibration format error: {0}")]
    Format(String),

    /// Query voltage lies outside the sampled domain.
    #[error("Voltage {voltage:.4} V outside calibrated range [{min:.4}, {max:.4}] V")]
    OutOfRange {
        /// Requested voltage
        voltage: f64,
        /// Lowest calibrated voltage
        min: f64,
        /// Highest calibrated voltage
        max: f64,
    },

    /// Failed to open or read the calibration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV framing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type for calibration operations.
pub type CalibrationResult<T> = Result<T, CalibrationError>;

/// One measured calibration point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    /// Voltage measured at the mirror driver output
    pub voltage: f64,
    /// PWM duty cycle that produced it
    pub duty_cycle: f64,
}

/// In-memory voltage to duty-cycle mapping.
///
/// Samples are held sorted by strictly increasing voltage. The table is
/// immutable once loaded; share it with `Arc` and replace it wholesale to
/// pick up a new calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    samples: Vec<CalibrationSample>,
}

impl CalibrationTable {
    /// Build a table from raw samples.
    ///
    /// Samples may arrive in any row order and are sorted by voltage.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::Format`] if fewer than 2 samples are given,
    /// any value is not finite, or two samples share a voltage (the voltage
    /// column must be strictly monotonic).
    pub fn from_samples(mut samples: Vec<CalibrationSample>) -> CalibrationResult<Self> {
        if samples.len() < 2 {
            return Err(CalibrationError::Format(format!(
                "need at least 2 samples, got {}",
                samples.len()
            )));
        }

        if let Some(bad) = samples
            .iter()
            .find(|s| !s.voltage.is_finite() || !s.duty_cycle.is_finite())
        {
            return Err(CalibrationError::Format(format!(
                "non-finite sample: voltage={}, duty_cycle={}",
                bad.voltage, bad.duty_cycle
            )));
        }

        samples.sort_by(|a, b| a.voltage.total_cmp(&b.voltage));

        if let Some(pair) = samples.windows(2).find(|w| w[0].voltage >= w[1].voltage) {
            return Err(CalibrationError::Format(format!(
                "voltage column is not strictly monotonic at {} V",
                pair[1].voltage
            )));
        }

        Ok(Self { samples })
    }

    /// Parse a calibration table from CSV text.
    ///
    /// Columns are located by header name, so extra columns and column order
    /// do not matter.
    pub fn from_reader<R: Read>(reader: R) -> CalibrationResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}') == name)
                .ok_or_else(|| CalibrationError::Format(format!("missing column '{name}'")))
        };
        let voltage_idx = column(VOLTAGE_COLUMN)?;
        let duty_idx = column(DUTY_CYCLE_COLUMN)?;

        let mut samples = Vec::new();
        for (row, record) in csv.records().enumerate() {
            let record = record?;
            let field = |idx: usize, name: &str| -> CalibrationResult<f64> {
                let raw = record.get(idx).unwrap_or("");
                raw.parse().map_err(|_| {
                    CalibrationError::Format(format!(
                        "row {}: non-numeric {name} value '{raw}'",
                        row + 1
                    ))
                })
            };
            samples.push(CalibrationSample {
                voltage: field(voltage_idx, "voltage")?,
                duty_cycle: field(duty_idx, "duty cycle")?,
            });
        }

        Self::from_samples(samples)
    }

    /// Load a calibration table from a CSV file.
    pub fn from_path(path: &Path) -> CalibrationResult<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        let (min, max) = table.voltage_range();
        debug!(
            "Loaded {} calibration samples from {} ({min:.3}..{max:.3} V)",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Number of samples in the table.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a constructed table (at least 2 samples).
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in increasing voltage order.
    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    /// Calibrated voltage domain as `(min, max)`.
    pub fn voltage_range(&self) -> (f64, f64) {
        let first = self.samples[0].voltage;
        let last = self.samples[self.samples.len() - 1].voltage;
        (first, last)
    }

    /// Check that a voltage lies inside the calibrated domain.
    pub fn check(&self, voltage: f64) -> CalibrationResult<()> {
        let (min, max) = self.voltage_range();
        if voltage.is_finite() && voltage >= min && voltage <= max {
            Ok(())
        } else {
            Err(CalibrationError::OutOfRange { voltage, min, max })
        }
    }

    /// Interpolated duty cycle for a voltage, rounded to 3 decimals.
    ///
    /// The rounding is part of the controller protocol: the firmware parses
    /// exactly three fractional digits.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::OutOfRange`] if `voltage` is outside the
    /// sampled domain.
    pub fn duty_cycle_for(&self, voltage: f64) -> CalibrationResult<f64> {
        self.check(voltage)?;

        // Index of the first sample at or above the query voltage.
        let upper = self.samples.partition_point(|s| s.voltage < voltage);
        let duty = if upper == 0 {
            self.samples[0].duty_cycle
        } else {
            let lo = self.samples[upper - 1];
            let hi = self.samples[upper];
            let t = (voltage - lo.voltage) / (hi.voltage - lo.voltage);
            lo.duty_cycle + t * (hi.duty_cycle - lo.duty_cycle)
        };

        Ok(round_duty_cycle(duty))
    }
}

/// Round a duty cycle to the precision the controller parses.
pub fn round_duty_cycle(duty: f64) -> f64 {
    const SCALE: f64 = 1000.0;
    (duty * SCALE).round() / SCALE
}

/// Format a duty cycle the way the controller expects it on the wire.
pub fn format_duty_cycle(duty: f64) -> String {
    format!("{duty:.prec$}", prec = DUTY_CYCLE_DECIMALS)
}
