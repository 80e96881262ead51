//! ODMR board wire messages.
//!
//! The board speaks protobuf over a plain TCP stream. Every exchange is one
//! serialized [`OdmrMsg`] from the client followed by one from the board;
//! there is no length prefix, each message is written with a single send and
//! read with a single receive.
//!
//! A message carries a read/write flag and a transmit-channel block. With
//! `rw = true` the block configures and starts an acquisition and the board
//! echoes it back. With `rw = false` the block is a poll: the board answers
//! with the same block, `photon_cnt_val` filled with the counts accumulated
//! since the last start.
//!
//! The `min_*`/`max_*` limit fields belong to the board's own limit
//! negotiation, which this client does not use. They are always sent as
//! zero.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default RF start frequency for photon counting (2.5 GHz).
pub const DEFAULT_START_HZ: u64 = 2_500_000_000;

/// Default sweep span above the start frequency.
pub const DEFAULT_SPAN_HZ: u64 = 1_000;

/// Default sweep step.
pub const DEFAULT_STEP_HZ: u64 = 100;

/// Transmit channel operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[derive(strum::Display, Serialize, Deserialize)]
#[repr(i32)]
pub enum AcquisitionMode {
    /// Dwell on the start frequency
    Single = 0,
    /// Sweep start..stop in steps
    Scan = 1,
}

/// Top-level message exchanged with the board.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OdmrMsg {
    /// `true` to configure/start, `false` to poll results
    #[prost(bool, tag = "1")]
    pub rw: bool,
    /// Transmit channel block
    #[prost(message, optional, tag = "2")]
    pub tx_ch: Option<TxChannel>,
}

/// Transmit channel configuration and photon-count payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TxChannel {
    /// [`AcquisitionMode`] as its wire value
    #[prost(enumeration = "AcquisitionMode", tag = "1")]
    pub mode: i32,
    /// Current frequency, reported by the board
    #[prost(uint64, tag = "2")]
    pub curr_hz: u64,
    /// First RF frequency
    #[prost(uint64, tag = "3")]
    pub start_hz: u64,
    /// Last RF frequency
    #[prost(uint64, tag = "4")]
    pub stop_hz: u64,
    /// Sweep step
    #[prost(uint64, tag = "5")]
    pub step_hz: u64,
    /// RF output gain
    #[prost(float, tag = "6")]
    pub gain_dbm: f32,
    /// Counting gate width
    #[prost(uint32, tag = "7")]
    pub pulse_width_us: u32,
    /// Enable the photon counter
    #[prost(bool, tag = "8")]
    pub photon_cnt_enable: bool,
    /// Board frequency lower limit (unused, zero)
    #[prost(uint64, tag = "9")]
    pub min_hz: u64,
    /// Board frequency upper limit (unused, zero)
    #[prost(uint64, tag = "10")]
    pub max_hz: u64,
    /// Smallest sweep step (unused, zero)
    #[prost(uint64, tag = "11")]
    pub min_step_hz: u64,
    /// Largest sweep step (unused, zero)
    #[prost(uint64, tag = "12")]
    pub max_step_hz: u64,
    /// Lowest gain (unused, zero)
    #[prost(float, tag = "13")]
    pub min_gain_dbm: f32,
    /// Highest gain (unused, zero)
    #[prost(float, tag = "14")]
    pub max_gain_dbm: f32,
    /// Shortest gate (unused, zero)
    #[prost(uint32, tag = "15")]
    pub min_pulse_width_us: u32,
    /// Longest gate (unused, zero)
    #[prost(uint32, tag = "16")]
    pub max_pulse_width_us: u32,
    /// Accumulated counts, first entry is the result
    #[prost(uint64, repeated, tag = "17")]
    pub photon_cnt_val: Vec<u64>,
    /// Number of counts the board filled in
    #[prost(uint32, tag = "18")]
    pub photon_cnt_len: u32,
}

/// One logical photon-counting job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Dwell or sweep
    pub mode: AcquisitionMode,
    /// First RF frequency
    pub start_frequency_hz: u64,
    /// Last RF frequency
    pub stop_frequency_hz: u64,
    /// Sweep step
    pub step_frequency_hz: u64,
    /// RF output gain
    pub gain_dbm: f32,
    /// Counting gate width, equal to the integration time
    pub pulse_width_us: u32,
    /// Enable the photon counter
    pub photon_count_enabled: bool,
}

impl AcquisitionRequest {
    /// Build the start message for this request.
    pub fn to_start_message(&self) -> OdmrMsg {
        OdmrMsg {
            rw: true,
            tx_ch: Some(TxChannel {
                mode: self.mode as i32,
                curr_hz: 0,
                start_hz: self.start_frequency_hz,
                stop_hz: self.stop_frequency_hz,
                step_hz: self.step_frequency_hz,
                gain_dbm: self.gain_dbm,
                pulse_width_us: self.pulse_width_us,
                photon_cnt_enable: self.photon_count_enabled,
                ..Default::default()
            }),
        }
    }
}

/// Build the message that asks the board for accumulated counts.
pub fn poll_message() -> OdmrMsg {
    OdmrMsg {
        rw: false,
        tx_ch: Some(TxChannel {
            curr_hz: 0,
            photon_cnt_val: vec![0],
            photon_cnt_len: 0,
            ..Default::default()
        }),
    }
}

/// Frequency and gain settings from which per-point requests are built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// RF start frequency
    pub start_frequency_hz: u64,
    /// Stop frequency offset above start
    pub span_hz: u64,
    /// Sweep step
    pub step_hz: u64,
    /// RF output gain
    pub gain_dbm: f32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            start_frequency_hz: DEFAULT_START_HZ,
            span_hz: DEFAULT_SPAN_HZ,
            step_hz: DEFAULT_STEP_HZ,
            gain_dbm: 0.0,
        }
    }
}

impl RequestSettings {
    /// Single-frequency photon-count request gated for `integration`.
    pub fn request_for(&self, integration: Duration) -> AcquisitionRequest {
        let pulse_width_us = integration.as_micros().min(u32::MAX as u128) as u32;
        AcquisitionRequest {
            mode: AcquisitionMode::Single,
            start_frequency_hz: self.start_frequency_hz,
            stop_frequency_hz: self.start_frequency_hz.saturating_add(self.span_hz),
            step_frequency_hz: self.step_hz,
            gain_dbm: self.gain_dbm,
            pulse_width_us,
            photon_count_enabled: true,
        }
    }
}

/// Photon count for one scan point.
///
/// `valid` is false when the board returned no samples or the exchange
/// failed; the count is then 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcquisitionResult {
    /// Accumulated photon count
    pub photon_count: u64,
    /// Whether the board actually reported a count
    pub valid: bool,
}

impl AcquisitionResult {
    /// A reported count.
    pub fn counted(photon_count: u64) -> Self {
        Self {
            photon_count,
            valid: true,
        }
    }

    /// A point with no usable count.
    pub fn invalid() -> Self {
        Self {
            photon_count: 0,
            valid: false,
        }
    }

    /// Extract the first photon count from a poll reply.
    pub fn from_reply(reply: &OdmrMsg) -> Self {
        reply
            .tx_ch
            .as_ref()
            .and_then(|ch| ch.photon_cnt_val.first().copied())
            .map_or_else(Self::invalid, Self::counted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_start_message_fields() {
        let req = RequestSettings::default().request_for(Duration::from_millis(250));
        let msg = req.to_start_message();
        assert!(msg.rw);

        let ch = msg.tx_ch.unwrap();
        assert_eq!(ch.mode(), AcquisitionMode::Single);
        assert_eq!(ch.curr_hz, 0);
        assert_eq!(ch.start_hz, 2_500_000_000);
        assert_eq!(ch.stop_hz, 2_500_001_000);
        assert_eq!(ch.step_hz, 100);
        assert_eq!(ch.pulse_width_us, 250_000);
        assert!(ch.photon_cnt_enable);
        assert_eq!(
            (ch.min_hz, ch.max_hz, ch.min_step_hz, ch.max_step_hz),
            (0, 0, 0, 0)
        );
        assert_eq!((ch.min_gain_dbm, ch.max_gain_dbm), (0.0, 0.0));
        assert_eq!((ch.min_pulse_width_us, ch.max_pulse_width_us), (0, 0));
    }

    #[test]
    fn test_poll_message_is_read() {
        let msg = poll_message();
        assert!(!msg.rw);
        let ch = msg.tx_ch.unwrap();
        assert_eq!(ch.photon_cnt_val, vec![0]);
        assert_eq!(ch.photon_cnt_len, 0);
    }

    #[test]
    fn test_wire_decode_of_start_message() {
        let msg = RequestSettings::default()
            .request_for(Duration::from_secs(1))
            .to_start_message();
        let bytes = msg.encode_to_vec();
        let decoded = OdmrMsg::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_result_from_reply() {
        let mut reply = poll_message();
        reply.tx_ch.as_mut().unwrap().photon_cnt_val = vec![1234, 99];
        assert_eq!(
            AcquisitionResult::from_reply(&reply),
            AcquisitionResult::counted(1234)
        );
    }

    #[test]
    fn test_empty_reply_is_invalid_zero() {
        let mut reply = poll_message();
        reply.tx_ch.as_mut().unwrap().photon_cnt_val.clear();
        let result = AcquisitionResult::from_reply(&reply);
        assert!(!result.valid);
        assert_eq!(result.photon_count, 0);

        let bare = OdmrMsg {
            rw: false,
            tx_ch: None,
        };
        assert_eq!(AcquisitionResult::from_reply(&bare), AcquisitionResult::invalid());
    }

    #[test]
    fn test_pulse_width_saturates() {
        let req = RequestSettings::default().request_for(Duration::from_secs(10_000));
        assert_eq!(req.pulse_width_us, u32::MAX);
    }
}
