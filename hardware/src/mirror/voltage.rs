//! Scan coordinate to drive voltage conversion.
//!
//! The mirror amplifier is bipolar, but the PWM stage feeding it only
//! produces unsigned duty cycles. Every logical voltage is therefore shifted
//! by a fixed centre offset before it is looked up in the calibration table,
//! so that "mirror at rest" sits in the middle of the duty-cycle range.
//!
//! Two logical inputs are supported:
//!
//! - **Mechanical angle** (degrees), scaled by the galvo's volts-per-degree.
//! - **Sample coordinate** (microns), scaled by the optics' volts-per-micron.
//!
//! Neither conversion clamps. Range limits are checked explicitly with
//! [`VoltageCodec::check_range`] before anything is sent to the controller.

use serde::{Deserialize, Serialize};

/// Default shift that maps 0 V logical onto the middle of the PWM range.
pub const DEFAULT_CENTER_OFFSET_V: f64 = 10.0;

/// Default galvo scale in volts per degree of mechanical angle.
pub const DEFAULT_ANGLE_SCALE: f64 = 0.8;

/// Default optical limit on the logical drive voltage (±).
pub const DEFAULT_MAX_DRIVE_V: f64 = 1.2;

/// Convert a mechanical angle to a logical drive voltage.
pub fn angle_to_voltage(mechanical_angle: f64, scale: f64) -> f64 {
    mechanical_angle * scale
}

/// Convert a sample coordinate in microns to a logical drive voltage.
pub fn coordinate_to_voltage(micron_coordinate: f64, volts_per_micron: f64) -> f64 {
    micron_coordinate * volts_per_micron
}

/// Shift a logical voltage by the centre offset.
pub fn center(voltage: f64, offset: f64) -> f64 {
    voltage + offset
}

/// Undo [`center`].
pub fn uncenter(voltage: f64, offset: f64) -> f64 {
    voltage - offset
}

/// A logical drive voltage outside the optical limit.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("Drive voltage {voltage:.4} V exceeds ±{limit:.4} V")]
pub struct RangeError {
    /// Offending logical voltage
    pub voltage: f64,
    /// Configured absolute limit
    pub limit: f64,
}

/// Per-unit conversion constants.
///
/// The offset and scale differ between hardware builds, so they are carried
/// as configuration instead of being fixed in code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageCodec {
    /// Offset added to every logical voltage before calibration lookup
    pub center_offset_v: f64,
    /// Volts per degree of mechanical angle
    pub angle_scale: f64,
    /// Absolute limit on logical drive voltage
    pub max_drive_v: f64,
}

impl Default for VoltageCodec {
    fn default() -> Self {
        Self {
            center_offset_v: DEFAULT_CENTER_OFFSET_V,
            angle_scale: DEFAULT_ANGLE_SCALE,
            max_drive_v: DEFAULT_MAX_DRIVE_V,
        }
    }
}

impl VoltageCodec {
    /// Centre a logical voltage with this codec's offset.
    pub fn center(&self, voltage: f64) -> f64 {
        center(voltage, self.center_offset_v)
    }

    /// Reject logical voltages beyond the optical limit.
    pub fn check_range(&self, voltage: f64) -> Result<f64, RangeError> {
        if voltage.is_finite() && voltage.abs() <= self.max_drive_v {
            Ok(voltage)
        } else {
            Err(RangeError {
                voltage,
                limit: self.max_drive_v,
            })
        }
    }

    /// Centred drive pair for a sample coordinate, range-checked.
    pub fn coordinate_drive(
        &self,
        x_um: f64,
        y_um: f64,
        volts_per_micron: f64,
    ) -> Result<(f64, f64), RangeError> {
        let vx = self.check_range(coordinate_to_voltage(x_um, volts_per_micron))?;
        let vy = self.check_range(coordinate_to_voltage(y_um, volts_per_micron))?;
        Ok((self.center(vx), self.center(vy)))
    }

    /// Centred drive pair for a pair of mechanical angles.
    ///
    /// Angle pointing is a manual alignment aid and is not limited to the
    /// scan range; the calibration table still bounds what can be sent.
    pub fn angle_drive(&self, x_angle: f64, y_angle: f64) -> (f64, f64) {
        (
            self.center(angle_to_voltage(x_angle, self.angle_scale)),
            self.center(angle_to_voltage(y_angle, self.angle_scale)),
        )
    }
}
