// W5500 Ethernet controller driver
// Register-level access to the chip's common block and hardware sockets over SPI

use super::bus::{BusTransport, TransferMode};
use super::{
    BufferLayout, ChipControl, Duplex, LinkSpeed, PhyLink, Protocol, Socket, SocketDriver,
    SocketFlags, SocketStatus, SOCKET_COUNT,
};
use crate::error::NetError;
use crate::identity::{AddressMode, NetworkIdentity};
use log::{debug, trace};
use smoltcp::wire::{EthernetAddress, Ipv4Address};

/// Value of the version register on a W5500
pub const W5500_VERSION: u8 = 0x04;

/// Identity string reported by [`ChipControl::chip_id`]
pub const CHIP_ID: &str = "W5500";

/// Polls allowed for the chip to acknowledge a reset or command
const COMMAND_POLL_LIMIT: u32 = 10_000;

/// Length of the header the chip prepends to each received UDP datagram
const UDP_HEADER_LEN: usize = 8;

/// Register map
mod regs {
    // Common block
    pub const MR: u16 = 0x0000;
    pub const GAR: u16 = 0x0001;
    pub const SUBR: u16 = 0x0005;
    pub const SHAR: u16 = 0x0009;
    pub const SIPR: u16 = 0x000F;
    pub const PHYCFGR: u16 = 0x002E;
    pub const VERSIONR: u16 = 0x0039;

    pub const MR_RST: u8 = 0x80;
    pub const PHYCFGR_LNK: u8 = 0x01;
    pub const PHYCFGR_SPD: u8 = 0x02;
    pub const PHYCFGR_DPX: u8 = 0x04;

    // Socket block
    pub const SN_MR: u16 = 0x0000;
    pub const SN_CR: u16 = 0x0001;
    pub const SN_IR: u16 = 0x0002;
    pub const SN_SR: u16 = 0x0003;
    pub const SN_PORT: u16 = 0x0004;
    pub const SN_DIPR: u16 = 0x000C;
    pub const SN_DPORT: u16 = 0x0010;
    pub const SN_RXBUF_SIZE: u16 = 0x001E;
    pub const SN_TXBUF_SIZE: u16 = 0x001F;
    pub const SN_TX_FSR: u16 = 0x0020;
    pub const SN_TX_WR: u16 = 0x0024;
    pub const SN_RX_RSR: u16 = 0x0026;
    pub const SN_RX_RD: u16 = 0x0028;

    pub const SN_MR_TCP: u8 = 0x01;
    pub const SN_MR_UDP: u8 = 0x02;

    pub const SN_CR_OPEN: u8 = 0x01;
    pub const SN_CR_LISTEN: u8 = 0x02;
    pub const SN_CR_DISCON: u8 = 0x08;
    pub const SN_CR_CLOSE: u8 = 0x10;
    pub const SN_CR_SEND: u8 = 0x20;
    pub const SN_CR_RECV: u8 = 0x40;

    pub const SN_IR_SENDOK: u8 = 0x10;
    pub const SN_IR_TIMEOUT: u8 = 0x08;
    pub const SN_IR_ALL: u8 = 0x1F;

    // Control byte
    pub const BLOCK_COMMON: u8 = 0x00;
    pub const RWB_WRITE: u8 = 0x04;

    pub const fn socket_block(socket: u8) -> u8 {
        socket * 4 + 1
    }

    pub const fn tx_block(socket: u8) -> u8 {
        socket * 4 + 2
    }

    pub const fn rx_block(socket: u8) -> u8 {
        socket * 4 + 3
    }
}

impl From<u8> for SocketStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => SocketStatus::Closed,
            0x13 => SocketStatus::Init,
            0x14 => SocketStatus::Listen,
            0x15 => SocketStatus::SynSent,
            0x16 => SocketStatus::SynReceived,
            0x17 => SocketStatus::Established,
            0x18 => SocketStatus::FinWait,
            0x1A => SocketStatus::Closing,
            0x1B => SocketStatus::TimeWait,
            0x1C => SocketStatus::CloseWait,
            0x1D => SocketStatus::LastAck,
            0x22 => SocketStatus::Udp,
            0x42 => SocketStatus::MacRaw,
            other => SocketStatus::Unknown(other),
        }
    }
}

/// W5500 driver
///
/// Owns the bus transport for its whole lifetime. DNS server and address
/// mode have no chip registers, so they are kept here.
pub struct W5500<B> {
    bus: B,
    mode: TransferMode,
    dns: Ipv4Address,
    address_mode: AddressMode,
}

impl<B: BusTransport> W5500<B> {
    pub fn new(bus: B, mode: TransferMode) -> Self {
        Self {
            bus,
            mode,
            dns: Ipv4Address::UNSPECIFIED,
            address_mode: AddressMode::Static,
        }
    }

    /// Give the bus transport back
    pub fn release(self) -> B {
        self.bus
    }

    #[cfg(test)]
    pub(crate) fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), NetError> {
        match self.mode {
            TransferMode::Burst => self.bus.write_burst(data),
            TransferMode::Byte => data.iter().try_for_each(|&b| self.bus.write_byte(b)),
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        match self.mode {
            TransferMode::Burst => self.bus.read_burst(buf),
            TransferMode::Byte => {
                for byte in buf.iter_mut() {
                    *byte = self.bus.read_byte()?;
                }
                Ok(())
            }
        }
    }

    fn header(block: u8, addr: u16, write: bool) -> [u8; 3] {
        let rwb = if write { regs::RWB_WRITE } else { 0 };
        let [hi, lo] = addr.to_be_bytes();
        [hi, lo, (block << 3) | rwb]
    }

    fn read(&mut self, block: u8, addr: u16, buf: &mut [u8]) -> Result<(), NetError> {
        self.bus.select()?;
        let result = self
            .write_bytes(&Self::header(block, addr, false))
            .and_then(|_| self.read_bytes(buf));
        let released = self.bus.deselect();
        result.and(released)
    }

    fn write(&mut self, block: u8, addr: u16, data: &[u8]) -> Result<(), NetError> {
        self.bus.select()?;
        let result = self
            .write_bytes(&Self::header(block, addr, true))
            .and_then(|_| self.write_bytes(data));
        let released = self.bus.deselect();
        result.and(released)
    }

    fn read_u8(&mut self, block: u8, addr: u16) -> Result<u8, NetError> {
        let mut buf = [0u8; 1];
        self.read(block, addr, &mut buf)?;
        Ok(buf[0])
    }

    fn write_u8(&mut self, block: u8, addr: u16, value: u8) -> Result<(), NetError> {
        self.write(block, addr, &[value])
    }

    fn read_u16(&mut self, block: u8, addr: u16) -> Result<u16, NetError> {
        let mut buf = [0u8; 2];
        self.read(block, addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn write_u16(&mut self, block: u8, addr: u16, value: u16) -> Result<(), NetError> {
        self.write(block, addr, &value.to_be_bytes())
    }

    // Free-size and received-size registers change under our feet; read
    // until two consecutive values agree.
    fn read_u16_stable(&mut self, block: u8, addr: u16) -> Result<u16, NetError> {
        let mut previous = self.read_u16(block, addr)?;
        loop {
            let current = self.read_u16(block, addr)?;
            if current == previous {
                return Ok(current);
            }
            previous = current;
        }
    }

    fn read_ip(&mut self, addr: u16) -> Result<Ipv4Address, NetError> {
        let mut buf = [0u8; 4];
        self.read(regs::BLOCK_COMMON, addr, &mut buf)?;
        Ok(Ipv4Address(buf))
    }

    fn command(&mut self, socket: Socket, command: u8) -> Result<(), NetError> {
        let block = regs::socket_block(socket.index());
        self.write_u8(block, regs::SN_CR, command)?;
        for _ in 0..COMMAND_POLL_LIMIT {
            if self.read_u8(block, regs::SN_CR)? == 0 {
                return Ok(());
            }
        }
        Err(NetError::Timeout)
    }

    fn raw_status(&mut self, socket: Socket) -> Result<u8, NetError> {
        self.read_u8(regs::socket_block(socket.index()), regs::SN_SR)
    }

    fn clear_interrupts(&mut self, socket: Socket, mask: u8) -> Result<(), NetError> {
        self.write_u8(regs::socket_block(socket.index()), regs::SN_IR, mask)
    }

    /// Copy `data` into the socket's TX buffer and advance the write pointer
    fn write_tx(&mut self, socket: Socket, data: &[u8]) -> Result<(), NetError> {
        let block = regs::socket_block(socket.index());
        let ptr = self.read_u16(block, regs::SN_TX_WR)?;
        // The chip wraps the pointer within the socket's buffer
        self.write(regs::tx_block(socket.index()), ptr, data)?;
        self.write_u16(block, regs::SN_TX_WR, ptr.wrapping_add(data.len() as u16))
    }

    /// Read from the socket's RX buffer at `offset` past the read pointer
    fn read_rx(&mut self, socket: Socket, offset: u16, buf: &mut [u8]) -> Result<(), NetError> {
        let ptr = self.read_u16(regs::socket_block(socket.index()), regs::SN_RX_RD)?;
        self.read(regs::rx_block(socket.index()), ptr.wrapping_add(offset), buf)
    }

    fn consume_rx(&mut self, socket: Socket, len: u16) -> Result<(), NetError> {
        let block = regs::socket_block(socket.index());
        let ptr = self.read_u16(block, regs::SN_RX_RD)?;
        self.write_u16(block, regs::SN_RX_RD, ptr.wrapping_add(len))?;
        self.command(socket, regs::SN_CR_RECV)
    }

    fn tx_capacity(&mut self, socket: Socket) -> Result<usize, NetError> {
        let kb = self.read_u8(regs::socket_block(socket.index()), regs::SN_TXBUF_SIZE)?;
        Ok(kb as usize * 1024)
    }

    /// Issue SEND and wait for the chip to report completion or timeout
    fn transmit(&mut self, socket: Socket) -> Result<(), NetError> {
        let block = regs::socket_block(socket.index());
        self.command(socket, regs::SN_CR_SEND)?;
        loop {
            let ir = self.read_u8(block, regs::SN_IR)?;
            if ir & regs::SN_IR_SENDOK != 0 {
                return self.clear_interrupts(socket, regs::SN_IR_SENDOK);
            }
            if ir & regs::SN_IR_TIMEOUT != 0 {
                self.clear_interrupts(socket, regs::SN_IR_SENDOK | regs::SN_IR_TIMEOUT)?;
                return Err(NetError::Timeout);
            }
            if self.raw_status(socket)? == 0x00 {
                return Err(NetError::SocketClosed);
            }
        }
    }
}

impl<B: BusTransport> ChipControl for W5500<B> {
    fn initialize(&mut self, layout: &BufferLayout) -> Result<(), NetError> {
        let version = self.read_u8(regs::BLOCK_COMMON, regs::VERSIONR)?;
        if version != W5500_VERSION {
            return Err(NetError::ChipNotFound(version));
        }
        layout.validate()?;

        self.write_u8(regs::BLOCK_COMMON, regs::MR, regs::MR_RST)?;
        let mut reset_done = false;
        for _ in 0..COMMAND_POLL_LIMIT {
            if self.read_u8(regs::BLOCK_COMMON, regs::MR)? & regs::MR_RST == 0 {
                reset_done = true;
                break;
            }
        }
        if !reset_done {
            return Err(NetError::Timeout);
        }

        for index in 0..SOCKET_COUNT {
            let block = regs::socket_block(index as u8);
            self.write_u8(block, regs::SN_TXBUF_SIZE, layout.tx_kb[index])?;
            self.write_u8(block, regs::SN_RXBUF_SIZE, layout.rx_kb[index])?;
        }

        self.dns = Ipv4Address::UNSPECIFIED;
        self.address_mode = AddressMode::Static;
        debug!("W5500 reset, buffers tx={:?} rx={:?}", layout.tx_kb, layout.rx_kb);
        Ok(())
    }

    fn phy_link(&mut self) -> Result<PhyLink, NetError> {
        let phy = self.read_u8(regs::BLOCK_COMMON, regs::PHYCFGR)?;
        if phy & regs::PHYCFGR_LNK == 0 {
            return Ok(PhyLink::Down);
        }
        let speed = if phy & regs::PHYCFGR_SPD != 0 {
            LinkSpeed::Mbps100
        } else {
            LinkSpeed::Mbps10
        };
        let duplex = if phy & regs::PHYCFGR_DPX != 0 {
            Duplex::Full
        } else {
            Duplex::Half
        };
        Ok(PhyLink::Up { speed, duplex })
    }

    fn chip_id(&mut self) -> Result<&'static str, NetError> {
        Ok(CHIP_ID)
    }

    fn set_hardware_address(&mut self, mac: EthernetAddress) -> Result<(), NetError> {
        self.write(regs::BLOCK_COMMON, regs::SHAR, mac.as_bytes())
    }

    fn set_network_info(&mut self, identity: &NetworkIdentity) -> Result<(), NetError> {
        self.write(regs::BLOCK_COMMON, regs::SHAR, identity.mac.as_bytes())?;
        self.write(regs::BLOCK_COMMON, regs::GAR, identity.gateway.as_bytes())?;
        self.write(regs::BLOCK_COMMON, regs::SUBR, identity.subnet.as_bytes())?;
        self.write(regs::BLOCK_COMMON, regs::SIPR, identity.ip.as_bytes())?;
        self.dns = identity.dns;
        self.address_mode = identity.mode;
        Ok(())
    }

    fn network_info(&mut self) -> Result<NetworkIdentity, NetError> {
        let mut mac = [0u8; 6];
        self.read(regs::BLOCK_COMMON, regs::SHAR, &mut mac)?;
        Ok(NetworkIdentity {
            mac: EthernetAddress(mac),
            ip: self.read_ip(regs::SIPR)?,
            subnet: self.read_ip(regs::SUBR)?,
            gateway: self.read_ip(regs::GAR)?,
            dns: self.dns,
            mode: self.address_mode,
        })
    }
}

impl<B: BusTransport> SocketDriver for W5500<B> {
    fn open(
        &mut self,
        socket: Socket,
        protocol: Protocol,
        port: u16,
        flags: SocketFlags,
    ) -> Result<(), NetError> {
        self.close(socket)?;

        let block = regs::socket_block(socket.index());
        let (mode, expected) = match protocol {
            Protocol::Tcp => (regs::SN_MR_TCP, SocketStatus::Init),
            Protocol::Udp => (regs::SN_MR_UDP, SocketStatus::Udp),
        };
        self.write_u8(block, regs::SN_MR, mode | flags.bits())?;
        self.write_u16(block, regs::SN_PORT, port)?;
        self.command(socket, regs::SN_CR_OPEN)?;

        let raw = self.raw_status(socket)?;
        if SocketStatus::from(raw) != expected {
            return Err(NetError::SocketState(raw));
        }
        trace!("socket {} opened ({:?}) on port {}", socket.index(), protocol, port);
        Ok(())
    }

    fn listen(&mut self, socket: Socket) -> Result<(), NetError> {
        let raw = self.raw_status(socket)?;
        if SocketStatus::from(raw) != SocketStatus::Init {
            return Err(NetError::SocketState(raw));
        }
        self.command(socket, regs::SN_CR_LISTEN)?;

        let raw = self.raw_status(socket)?;
        if SocketStatus::from(raw) != SocketStatus::Listen {
            self.close(socket)?;
            return Err(NetError::SocketState(raw));
        }
        Ok(())
    }

    fn status(&mut self, socket: Socket) -> Result<SocketStatus, NetError> {
        self.raw_status(socket).map(SocketStatus::from)
    }

    fn send(&mut self, socket: Socket, data: &[u8]) -> Result<usize, NetError> {
        let len = data.len().min(self.tx_capacity(socket)?);
        if len == 0 {
            return Ok(0);
        }

        let block = regs::socket_block(socket.index());
        loop {
            let raw = self.raw_status(socket)?;
            if !matches!(
                SocketStatus::from(raw),
                SocketStatus::Established | SocketStatus::CloseWait
            ) {
                return Err(NetError::SocketClosed);
            }
            if self.read_u16_stable(block, regs::SN_TX_FSR)? as usize >= len {
                break;
            }
        }

        self.write_tx(socket, &data[..len])?;
        self.transmit(socket)?;
        Ok(len)
    }

    fn recv(&mut self, socket: Socket, buf: &mut [u8]) -> Result<usize, NetError> {
        let block = regs::socket_block(socket.index());
        let available = self.read_u16_stable(block, regs::SN_RX_RSR)? as usize;
        let len = available.min(buf.len());
        if len == 0 {
            return Ok(0);
        }

        self.read_rx(socket, 0, &mut buf[..len])?;
        self.consume_rx(socket, len as u16)?;
        Ok(len)
    }

    fn send_to(
        &mut self,
        socket: Socket,
        data: &[u8],
        addr: Ipv4Address,
        port: u16,
    ) -> Result<usize, NetError> {
        if data.len() > self.tx_capacity(socket)? {
            return Err(NetError::BufferTooSmall);
        }

        let block = regs::socket_block(socket.index());
        self.write(block, regs::SN_DIPR, addr.as_bytes())?;
        self.write_u16(block, regs::SN_DPORT, port)?;
        while (self.read_u16_stable(block, regs::SN_TX_FSR)? as usize) < data.len() {
            if self.raw_status(socket)? == 0x00 {
                return Err(NetError::SocketClosed);
            }
        }

        self.write_tx(socket, data)?;
        self.transmit(socket)?;
        Ok(data.len())
    }

    fn recv_from(
        &mut self,
        socket: Socket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, Ipv4Address, u16)>, NetError> {
        let block = regs::socket_block(socket.index());
        let available = self.read_u16_stable(block, regs::SN_RX_RSR)? as usize;
        if available < UDP_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; UDP_HEADER_LEN];
        self.read_rx(socket, 0, &mut header)?;
        let addr = Ipv4Address::from_bytes(&header[0..4]);
        let port = u16::from_be_bytes([header[4], header[5]]);
        let datagram_len = u16::from_be_bytes([header[6], header[7]]) as usize;

        // Anything past the caller's buffer is dropped with the datagram
        let len = datagram_len.min(buf.len());
        self.read_rx(socket, UDP_HEADER_LEN as u16, &mut buf[..len])?;
        self.consume_rx(socket, (UDP_HEADER_LEN + datagram_len) as u16)?;
        Ok(Some((len, addr, port)))
    }

    fn disconnect(&mut self, socket: Socket) -> Result<(), NetError> {
        if self.raw_status(socket)? == 0x00 {
            return Ok(());
        }
        self.command(socket, regs::SN_CR_DISCON)
    }

    fn close(&mut self, socket: Socket) -> Result<(), NetError> {
        self.command(socket, regs::SN_CR_CLOSE)?;
        self.clear_interrupts(socket, regs::SN_IR_ALL)
    }
}
