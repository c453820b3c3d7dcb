#![no_std]

// Build-time device configuration for echo-node

pub mod error;
pub mod types;

pub use error::ConfigError;
pub use types::{Addressing, DeviceConfig, StaticIp, MAX_SOCKETS};
