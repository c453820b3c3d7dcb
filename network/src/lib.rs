#![no_std]

// Ethernet stack for echo-node
// W5500 driver, link bring-up, DHCP lease acquisition and the echo server

pub mod dhcp;
pub mod drivers;
pub mod error;
pub mod identity;
pub mod link;
pub mod server;

// Re-export commonly used types
pub use dhcp::{
    Clock, DhcpClient, DhcpSession, Lease, LeaseEvents, LeaseManager, LeaseState,
    DHCP_SCRATCH_LEN,
};
pub use drivers::bus::{BusTransport, SpiTransport, TransferMode};
pub use drivers::w5500::W5500;
pub use drivers::{BufferLayout, ChipControl, Socket, SocketDriver, SocketStatus};
pub use error::{InitError, LeaseError, NetError};
pub use identity::{AddressMode, NetworkIdentity};
pub use link::{bring_up, Ready};
pub use server::{ConnectionState, EchoServer, EchoSink, SessionOutcome};
pub use smoltcp::wire::{EthernetAddress, Ipv4Address};
