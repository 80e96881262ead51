//! Two-axis galvo mirror controller
//!
//! This module converts logical scan targets into calibrated PWM duty
//! cycles and sends them to the controller over a serial link.

pub mod calibration;
pub mod feedback;
pub mod link;
pub mod voltage;

pub use calibration::{
    format_duty_cycle, round_duty_cycle, CalibrationError, CalibrationResult, CalibrationSample,
    CalibrationTable, DUTY_CYCLE_COLUMN, VOLTAGE_COLUMN,
};
pub use feedback::{feedback_voltage, quantum_level, DEFAULT_FEEDBACK_GAIN};
pub use link::{
    encode_command, MirrorDriver, MirrorError, MirrorLink, MirrorPort, MirrorResult,
    DEFAULT_BAUD_RATE,
};
pub use voltage::{
    angle_to_voltage, center, coordinate_to_voltage, uncenter, RangeError, VoltageCodec,
    DEFAULT_ANGLE_SCALE, DEFAULT_CENTER_OFFSET_V, DEFAULT_MAX_DRIVE_V,
};
