//! Network identity of the device
//!
//! The hardware address is fixed at build time. The four IPv4 parameters are
//! filled in either from static configuration or by a completed DHCP lease
//! before any socket is opened.

use core::fmt;
use smoltcp::wire::{EthernetAddress, Ipv4Address};

/// How the IPv4 parameters were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Static,
    Dhcp,
}

/// Hardware address plus IPv4 configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub mac: EthernetAddress,
    pub ip: Ipv4Address,
    pub subnet: Ipv4Address,
    pub gateway: Ipv4Address,
    pub dns: Ipv4Address,
    pub mode: AddressMode,
}

impl NetworkIdentity {
    /// Whether an address has been assigned
    pub fn is_configured(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// Subnet mask as a CIDR prefix length
    pub fn prefix_len(&self) -> u8 {
        u32::from_be_bytes(self.subnet.0).count_ones() as u8
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            AddressMode::Static => "Static",
            AddressMode::Dhcp => "DHCP",
        };
        write!(
            f,
            "mode={} mac={} ip={}/{} gw={} dns={}",
            mode,
            self.mac,
            self.ip,
            self.prefix_len(),
            self.gateway,
            self.dns
        )
    }
}
