// Network controller drivers

pub mod bus;
pub mod w5500;

use crate::error::NetError;
use crate::identity::NetworkIdentity;
use smoltcp::wire::{EthernetAddress, Ipv4Address};

/// Number of hardware socket slots on the controller
pub const SOCKET_COUNT: usize = 8;

/// Total buffer memory per direction, in KiB
pub const BUFFER_MEMORY_KB: u8 = 16;

/// A hardware-backed socket slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket(u8);

impl Socket {
    /// Slot `index`, if the controller has one
    pub const fn new(index: u8) -> Result<Self, NetError> {
        if (index as usize) < SOCKET_COUNT {
            Ok(Self(index))
        } else {
            Err(NetError::InvalidSocket(index))
        }
    }

    pub const fn index(&self) -> u8 {
        self.0
    }
}

/// Transport protocol a socket is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Extra socket mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketFlags(u8);

impl SocketFlags {
    pub const NONE: Self = Self(0);

    pub const fn bits(&self) -> u8 {
        self.0
    }
}

/// Socket status as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Init,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    MacRaw,
    Unknown(u8),
}

/// Physical link speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    Mbps10,
    Mbps100,
}

/// Physical link duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Half,
    Full,
}

/// Physical link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyLink {
    Down,
    Up { speed: LinkSpeed, duplex: Duplex },
}

/// Per-socket TX/RX buffer sizes in KiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub tx_kb: [u8; SOCKET_COUNT],
    pub rx_kb: [u8; SOCKET_COUNT],
}

impl BufferLayout {
    /// The same size for every socket in both directions
    pub const fn uniform(kb: u8) -> Self {
        Self {
            tx_kb: [kb; SOCKET_COUNT],
            rx_kb: [kb; SOCKET_COUNT],
        }
    }

    /// Check the layout fits the controller's buffer memory
    pub fn validate(&self) -> Result<(), NetError> {
        for sizes in [&self.tx_kb, &self.rx_kb] {
            let mut total: u16 = 0;
            for &kb in sizes.iter() {
                if !matches!(kb, 0 | 1 | 2 | 4 | 8 | 16) {
                    return Err(NetError::InvalidBufferLayout("size must be 0, 1, 2, 4, 8 or 16 KiB"));
                }
                total += kb as u16;
            }
            if total > BUFFER_MEMORY_KB as u16 {
                return Err(NetError::InvalidBufferLayout("total exceeds 16 KiB"));
            }
        }
        Ok(())
    }
}

/// Chip-wide control operations.
pub trait ChipControl {
    /// Reset the chip and program the socket buffer layout
    fn initialize(&mut self, layout: &BufferLayout) -> Result<(), NetError>;

    /// Current physical link state
    fn phy_link(&mut self) -> Result<PhyLink, NetError>;

    /// Chip identity string
    fn chip_id(&mut self) -> Result<&'static str, NetError>;

    /// Program the source hardware address
    fn set_hardware_address(&mut self, mac: EthernetAddress) -> Result<(), NetError>;

    /// Apply a full network identity
    fn set_network_info(&mut self, identity: &NetworkIdentity) -> Result<(), NetError>;

    /// Read back the applied network identity
    fn network_info(&mut self) -> Result<NetworkIdentity, NetError>;
}

/// Socket operations on the controller's hardware slots.
///
/// All calls are non-blocking apart from the short waits the chip needs to
/// acknowledge a command or finish a transmission.
pub trait SocketDriver {
    /// Open `socket` bound to local `port`, closing it first if needed
    fn open(
        &mut self,
        socket: Socket,
        protocol: Protocol,
        port: u16,
        flags: SocketFlags,
    ) -> Result<(), NetError>;

    /// Put an opened TCP socket into LISTEN
    fn listen(&mut self, socket: Socket) -> Result<(), NetError>;

    /// Current socket status
    fn status(&mut self, socket: Socket) -> Result<SocketStatus, NetError>;

    /// Send on a connected TCP socket, returning the bytes sent
    fn send(&mut self, socket: Socket, data: &[u8]) -> Result<usize, NetError>;

    /// Read whatever is buffered, returning 0 when nothing has arrived
    fn recv(&mut self, socket: Socket, buf: &mut [u8]) -> Result<usize, NetError>;

    /// Send a datagram from a UDP socket
    fn send_to(
        &mut self,
        socket: Socket,
        data: &[u8],
        addr: Ipv4Address,
        port: u16,
    ) -> Result<usize, NetError>;

    /// Receive one datagram, if any, as `(len, source address, source port)`
    fn recv_from(
        &mut self,
        socket: Socket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, Ipv4Address, u16)>, NetError>;

    /// Start a graceful TCP disconnect
    fn disconnect(&mut self, socket: Socket) -> Result<(), NetError>;

    /// Release the socket slot
    fn close(&mut self, socket: Socket) -> Result<(), NetError>;
}
