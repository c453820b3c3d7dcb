//! Configuration types for echo-node
//!
//! Everything is fixed at build time. Addresses are raw byte arrays; socket
//! limits and the buffer layout rule come from the network crate.

use crate::error::ConfigError;
use network::drivers::BufferLayout;

/// Hardware socket slots on the Ethernet controller
pub use network::drivers::SOCKET_COUNT as MAX_SOCKETS;

/// Device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Hardware address, never changed at runtime
    pub mac: [u8; 6],
    /// TX buffer size per socket, in KiB
    pub tx_buffer_kb: [u8; MAX_SOCKETS],
    /// RX buffer size per socket, in KiB
    pub rx_buffer_kb: [u8; MAX_SOCKETS],
    /// Socket slot DHCP negotiates on
    pub dhcp_socket: u8,
    /// Socket slot the echo server uses
    pub echo_socket: u8,
    pub echo_port: u16,
    /// Sent to each client on connect
    pub greeting: &'static str,
    /// Use block transfers on the bus instead of one byte at a time
    pub burst_transfers: bool,
    /// Delay between status polls while waiting for a client
    pub listen_poll_ms: u32,
    /// Size of the DHCP message buffer
    pub dhcp_scratch_len: usize,
    pub addressing: Addressing,
}

/// Where the IPv4 parameters come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Dhcp,
    Static(StaticIp),
}

/// IP configuration (for static IP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIp {
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub dns: [u8; 4],
}

impl DeviceConfig {
    pub const DEFAULT: Self = Self {
        mac: [0x00, 0x08, 0xdc, 0x00, 0xab, 0xcd],
        tx_buffer_kb: [2; MAX_SOCKETS],
        rx_buffer_kb: [2; MAX_SOCKETS],
        dhcp_socket: 0,
        echo_socket: 0,
        echo_port: 3000,
        greeting: "Welcome to the echo chamber!\r\n",
        burst_transfers: true,
        listen_poll_ms: 100,
        dhcp_scratch_len: 2048,
        addressing: Addressing::Dhcp,
    };

    /// Socket buffer sizes as programmed into the controller
    pub fn buffer_layout(&self) -> BufferLayout {
        BufferLayout {
            tx_kb: self.tx_buffer_kb,
            rx_kb: self.rx_buffer_kb,
        }
    }

    /// Check every value against the controller's limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffer_layout().validate()?;

        for socket in [self.dhcp_socket, self.echo_socket] {
            if socket as usize >= MAX_SOCKETS {
                return Err(ConfigError::InvalidSocket(socket));
            }
        }
        if self.echo_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.greeting.is_empty() {
            return Err(ConfigError::EmptyGreeting);
        }
        if self.mac[0] & 0x01 != 0 {
            return Err(ConfigError::MulticastMac);
        }
        if self.dhcp_scratch_len < 576 {
            return Err(ConfigError::invalid_value("DHCP scratch buffer under 576 bytes"));
        }
        if let Addressing::Static(ip) = &self.addressing {
            ip.validate()?;
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl StaticIp {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip == [0; 4] {
            return Err(ConfigError::invalid_value("static IP is unspecified"));
        }
        let mask = u32::from_be_bytes(self.subnet_mask);
        // Contiguous masks have all their set bits at the top
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(ConfigError::invalid_value("subnet mask is not contiguous"));
        }
        Ok(())
    }
}
