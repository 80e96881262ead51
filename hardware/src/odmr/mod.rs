//! ODMR board photon counter
//!
//! This module provides the protobuf wire messages and a blocking TCP client
//! for the board's start, wait, poll counting cycle.

pub mod client;
pub mod messages;

pub use client::{
    AcquisitionClient, AcquisitionError, ClientSettings, OdmrResult, PhotonCounter, SessionState,
    DEFAULT_ODMR_ADDR,
};
pub use messages::{
    poll_message, AcquisitionMode, AcquisitionRequest, AcquisitionResult, OdmrMsg,
    RequestSettings, TxChannel, DEFAULT_SPAN_HZ, DEFAULT_START_HZ, DEFAULT_STEP_HZ,
};
