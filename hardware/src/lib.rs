//! Hardware drivers for the raster-scan bench.
//!
//! This crate provides drivers for the two instruments a photon-count map
//! is built from. Each driver is feature-gated for optional compilation.
//!
//! # Features
//!
//! ## Individual Drivers
//! - `mirror` - Two-axis galvo mirror controller (serial, PWM duty-cycle commands)
//! - `odmr` - ODMR board photon counter (TCP, protobuf request/poll protocol)
//!
//! ## Convenience Features
//! - `ci-testable` - Drivers with unit tests runnable in CI (no hardware needed)

#[cfg(feature = "mirror")]
pub mod mirror;

#[cfg(feature = "odmr")]
pub mod odmr;
