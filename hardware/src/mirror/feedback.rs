//! Decoding of the controller's raw position feedback.
//!
//! The controller may echo an ADC reading of the amplifier output after a
//! command. The reading arrives as loosely formatted ASCII (digits mixed
//! with labels and separators). It is only used when calibrating the PWM
//! stage by hand; scans never depend on it.

/// Full-scale count of the controller's 12-bit ADC.
pub const ADC_FULL_SCALE: f64 = 4096.0;

/// ADC reference voltage.
pub const ADC_REFERENCE_V: f64 = 3.3;

/// Default divider gain between amplifier output and ADC input.
pub const DEFAULT_FEEDBACK_GAIN: f64 = 11.48;

/// Extract the ADC quantisation level from a raw feedback string.
///
/// Every ASCII digit is kept in order and everything else is dropped, so
/// `"ADC: 2,048\r\n"` yields `2048`. Returns `None` when there are no
/// digits or the number does not fit.
pub fn quantum_level(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Convert an ADC level to the amplifier output voltage.
pub fn feedback_voltage(level: u32, gain: f64) -> f64 {
    ADC_REFERENCE_V / ADC_FULL_SCALE * level as f64 * gain
}
