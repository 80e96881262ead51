//! Serial link to the galvo mirror controller.
//!
//! # Protocol
//!
//! The controller accepts one ASCII command per position:
//!
//! ```text
//! <duty_x>|<duty_y>F
//! ```
//!
//! Both duty cycles carry exactly three decimals and the frame ends with the
//! letter `F`, with no newline. The controller does not acknowledge
//! commands. It consumes one frame per write and starts slewing
//! immediately, so the caller is responsible for waiting until the mirror
//! has settled before measuring.
//!
//! # Lifecycle
//!
//! A [`MirrorLink`] is either open (owns the port) or closed. Closing is
//! idempotent and also happens on drop, so the port is released on every
//! exit path including panics and early returns. A write failure closes the
//! link because the mirror position is no longer known.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::calibration::{format_duty_cycle, CalibrationError, CalibrationTable};
use super::feedback::{feedback_voltage, quantum_level};

/// Default baud rate of the controller's USB-serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Frame terminator expected by the controller firmware.
pub const FRAME_TERMINATOR: char = 'F';

/// Per-read timeout on the serial port (only feedback reads block).
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors raised by the mirror link.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Serial port could not be opened.
    #[error("Serial device {port} unavailable: {reason}")]
    DeviceUnavailable {
        /// Port name that failed to open
        port: String,
        /// Underlying failure description
        reason: String,
    },

    /// Operation requires an open link.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Drive voltage could not be mapped to a duty cycle.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Serial write or read failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Byte stream the controller is reached through.
///
/// Implemented for the real serial port and for in-memory fakes.
pub trait MirrorPort: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> MirrorPort for T {}

/// Interface for two-axis mirror control
///
/// Abstracts the mirror hardware so scan orchestration can be tested
/// without a controller attached.
pub trait MirrorDriver {
    /// Verify a centred voltage pair can be driven, without moving.
    fn check(&self, x_volts: f64, y_volts: f64) -> MirrorResult<()>;

    /// Command both axes to a centred voltage pair.
    fn drive(&mut self, x_volts: f64, y_volts: f64) -> MirrorResult<()>;

    /// Release the underlying device.
    fn close(&mut self);
}

/// Format one controller frame from two duty cycles.
pub fn encode_command(duty_x: f64, duty_y: f64) -> String {
    format!(
        "{}|{}{FRAME_TERMINATOR}",
        format_duty_cycle(duty_x),
        format_duty_cycle(duty_y)
    )
}

/// Exclusive owner of the controller's serial port.
pub struct MirrorLink {
    port: Option<Box<dyn MirrorPort>>,
    name: String,
    calibration: Arc<CalibrationTable>,
}

impl MirrorLink {
    /// Open the controller's serial port.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::DeviceUnavailable`] if the port cannot be opened.
    pub fn connect(
        port_name: &str,
        baud_rate: u32,
        calibration: Arc<CalibrationTable>,
    ) -> MirrorResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| MirrorError::DeviceUnavailable {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        info!("Opened mirror controller on {port_name} at {baud_rate} bps");
        Ok(Self::from_port(port_name, Box::new(port), calibration))
    }

    /// Wrap an already-open port.
    pub fn from_port(
        name: &str,
        port: Box<dyn MirrorPort>,
        calibration: Arc<CalibrationTable>,
    ) -> Self {
        Self {
            port: Some(port),
            name: name.to_string(),
            calibration,
        }
    }

    /// Whether the link currently owns an open port.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Port name this link was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calibration table used for voltage to duty-cycle mapping.
    pub fn calibration(&self) -> &Arc<CalibrationTable> {
        &self.calibration
    }

    /// Replace the calibration table after an explicit reload.
    pub fn set_calibration(&mut self, calibration: Arc<CalibrationTable>) {
        self.calibration = calibration;
    }

    /// Read any pending raw feedback and decode it to a voltage.
    ///
    /// Returns `Ok(None)` if the controller sent nothing within the port
    /// timeout or the bytes contain no ADC reading.
    pub fn read_feedback(&mut self, gain: f64) -> MirrorResult<Option<f64>> {
        let port = self
            .port
            .as_mut()
            .ok_or(MirrorError::InvalidState("feedback read on closed link"))?;

        let mut buf = [0u8; 64];
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let raw = String::from_utf8_lossy(&buf[..n]);
        trace!("Mirror feedback raw: {:?}", raw);
        Ok(quantum_level(&raw).map(|level| feedback_voltage(level, gain)))
    }
}

impl MirrorDriver for MirrorLink {
    fn check(&self, x_volts: f64, y_volts: f64) -> MirrorResult<()> {
        self.calibration.check(x_volts)?;
        self.calibration.check(y_volts)?;
        Ok(())
    }

    fn drive(&mut self, x_volts: f64, y_volts: f64) -> MirrorResult<()> {
        if self.port.is_none() {
            return Err(MirrorError::InvalidState("drive on closed link"));
        }

        // Resolve both axes before touching the port so a bad voltage never
        // produces a half-written frame.
        let duty_x = self.calibration.duty_cycle_for(x_volts)?;
        let duty_y = self.calibration.duty_cycle_for(y_volts)?;

        let port = self
            .port
            .as_mut()
            .ok_or(MirrorError::InvalidState("drive on closed link"))?;

        let frame = encode_command(duty_x, duty_y);
        debug!("Mirror send: {frame} ({x_volts:.4} V, {y_volts:.4} V)");

        let written = port
            .write_all(frame.as_bytes())
            .and_then(|()| port.flush());
        if let Err(e) = written {
            warn!("Mirror write on {} failed, closing link: {e}", self.name);
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed mirror controller on {}", self.name);
        }
    }
}

impl Drop for MirrorLink {
    fn drop(&mut self) {
        self.close();
    }
}
