//! Configuration module for the driver binary.
//!
//! Provides CLI argument parsing and voice listing.

#[allow(clippy::module_inception)]
mod config;
mod voices;

pub use config::{DriverConfig, default_voice_dir};
