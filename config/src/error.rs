// Configuration validation errors

use network::NetError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Socket buffers: {0}")]
    BufferLayout(#[from] NetError),

    #[error("Socket slot {0} out of range")]
    InvalidSocket(u8),

    #[error("Port must be non-zero")]
    InvalidPort,

    #[error("Greeting must not be empty")]
    EmptyGreeting,

    #[error("Hardware address is multicast")]
    MulticastMac,

    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),
}

impl ConfigError {
    pub fn invalid_value(msg: &'static str) -> Self {
        ConfigError::InvalidValue(msg)
    }
}
