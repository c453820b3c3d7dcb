// Error types for network operations

use embedded_hal::{digital, spi};
use smoltcp::wire::Ipv4Address;
use thiserror::Error;

/// Network-related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("SPI transfer failed: {0:?}")]
    Bus(spi::ErrorKind),

    #[error("Chip select failed: {0:?}")]
    ChipSelect(digital::ErrorKind),

    #[error("Chip not found (version register reads {0:#04x})")]
    ChipNotFound(u8),

    #[error("Invalid socket buffer layout: {0}")]
    InvalidBufferLayout(&'static str),

    #[error("Invalid socket slot {0}")]
    InvalidSocket(u8),

    #[error("Socket in unexpected state {0:#04x}")]
    SocketState(u8),

    #[error("Socket closed")]
    SocketClosed,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Buffer too small")]
    BufferTooSmall,

    #[error("Invalid DHCP message: {0}")]
    InvalidDhcpMessage(&'static str),
}

/// Errors raised while bringing the Ethernet controller up.
///
/// Every variant is fatal: the device cannot proceed without a working chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("Chip initialization failed: {0}")]
    Initialize(NetError),

    #[error("Failed to program hardware address: {0}")]
    HardwareAddress(NetError),
}

/// Errors that end a DHCP lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// The offered address is already in use on the link.
    #[error("IP address conflict on {0}")]
    Conflict(Ipv4Address),
}
