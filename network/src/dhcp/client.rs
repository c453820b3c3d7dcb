//! DHCP client session over a hardware UDP socket
//!
//! Implements the DISCOVER -> OFFER -> REQUEST -> ACK exchange one
//! non-blocking step at a time. Messages are encoded and parsed with
//! smoltcp's DHCPv4 wire types inside the caller's scratch buffer.
//!
//! Once the server acknowledges, the offered address is checked: a datagram
//! is sent to it, which makes the chip resolve it over ARP. If the ARP
//! request times out the address is free; if it gets an answer another host
//! holds it and the lease is declined.

use super::{DhcpSession, Lease, LeaseState};
use crate::drivers::{Protocol, Socket, SocketDriver, SocketFlags};
use crate::error::NetError;
use heapless::Vec;
use log::{debug, trace, warn};
use smoltcp::wire::{
    DhcpMessageType, DhcpPacket, DhcpRepr, EthernetAddress, Ipv4Address, DHCP_CLIENT_PORT,
    DHCP_MAX_DNS_SERVER_COUNT, DHCP_SERVER_PORT,
};

/// How long to wait for a reply before retransmitting
const WAIT_TIME_MS: u64 = 10_000;

/// Retransmissions before the session reports failure
const MAX_RETRY: u8 = 2;

/// Destination port of the address check; nothing needs to listen on it
const CONFLICT_CHECK_PORT: u16 = 5000;

const CONFLICT_CHECK_PAYLOAD: &[u8] = b"CHECK_IP_CONFLICT";

/// Largest message a client must be prepared to accept
const MIN_MESSAGE_LEN: usize = 576;

/// Subnet mask, router, DNS server, lease time, renewal and rebinding times
const PARAMETER_REQUEST_LIST: &[u8] = &[1, 3, 6, 51, 58, 59];

/// Monotonic millisecond time source
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<F: Fn() -> u64> Clock for F {
    fn now_ms(&self) -> u64 {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Opened, nothing sent yet
    Idle,
    /// DISCOVER sent, waiting for an OFFER
    Discovering,
    /// REQUEST sent, waiting for ACK or NAK
    Requesting,
    /// ACK received, address not checked yet
    Checking,
    /// Lease confirmed
    Bound,
}

/// Fields of a server reply that outlive the scratch buffer
struct Reply {
    message_type: DhcpMessageType,
    your_ip: Ipv4Address,
    server: Ipv4Address,
    subnet: Option<Ipv4Address>,
    router: Option<Ipv4Address>,
    dns: Option<Vec<Ipv4Address, DHCP_MAX_DNS_SERVER_COUNT>>,
    lease_secs: Option<u32>,
}

/// DHCP client session bound to one socket slot
pub struct DhcpClient<C> {
    clock: C,
    mac: EthernetAddress,
    socket: Option<Socket>,
    phase: Phase,
    transaction_id: u32,
    sessions: u32,
    retries: u8,
    sent_at: u64,
    server: Ipv4Address,
    offered: Ipv4Address,
    lease: Option<Lease>,
}

impl<C: Clock> DhcpClient<C> {
    pub fn new(mac: EthernetAddress, clock: C) -> Self {
        Self {
            clock,
            mac,
            socket: None,
            phase: Phase::Idle,
            transaction_id: 0,
            sessions: 0,
            retries: 0,
            sent_at: 0,
            server: Ipv4Address::UNSPECIFIED,
            offered: Ipv4Address::UNSPECIFIED,
            lease: None,
        }
    }

    /// Transaction id of the exchange in progress
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    fn next_transaction_id(&self) -> u32 {
        let mac = self.mac.as_bytes();
        let base = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
        base ^ self.sessions.wrapping_mul(0x9E37_79B9) ^ (self.clock.now_ms() as u32)
    }

    fn restart(&mut self) {
        self.phase = Phase::Idle;
        self.retries = 0;
        self.server = Ipv4Address::UNSPECIFIED;
        self.offered = Ipv4Address::UNSPECIFIED;
        self.lease = None;
    }

    /// Encode a client message into `scratch`, returning its length
    fn encode(
        &self,
        scratch: &mut [u8],
        message_type: DhcpMessageType,
        requested_ip: Option<Ipv4Address>,
        server_identifier: Option<Ipv4Address>,
    ) -> Result<usize, NetError> {
        let repr = DhcpRepr {
            message_type,
            transaction_id: self.transaction_id,
            secs: 0,
            client_hardware_address: self.mac,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: Ipv4Address::UNSPECIFIED,
            server_ip: Ipv4Address::UNSPECIFIED,
            router: None,
            subnet_mask: None,
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip,
            client_identifier: Some(self.mac),
            server_identifier,
            parameter_request_list: Some(PARAMETER_REQUEST_LIST),
            dns_servers: None,
            max_size: None,
            lease_duration: None,
            renew_duration: None,
            rebind_duration: None,
            additional_options: &[],
        };

        let len = repr.buffer_len();
        if len > scratch.len() {
            return Err(NetError::BufferTooSmall);
        }
        let buf = &mut scratch[..len];
        buf.fill(0);
        repr.emit(&mut DhcpPacket::new_unchecked(buf))
            .map_err(|_| NetError::InvalidDhcpMessage("encode failed"))?;
        Ok(len)
    }

    fn send<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
        message_type: DhcpMessageType,
    ) -> Result<(), NetError> {
        let (requested_ip, server_identifier) = match message_type {
            DhcpMessageType::Discover => (None, None),
            _ => (Some(self.offered), Some(self.server)),
        };
        let len = self.encode(scratch, message_type, requested_ip, server_identifier)?;
        driver.send_to(socket, &scratch[..len], Ipv4Address::BROADCAST, DHCP_SERVER_PORT)?;
        self.sent_at = self.clock.now_ms();
        trace!("DHCP {:?} sent (xid {:#010x})", message_type, self.transaction_id);
        Ok(())
    }

    /// Drain datagrams until one answers our transaction
    fn receive<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> Option<Reply> {
        loop {
            let (len, from, port) = match driver.recv_from(socket, scratch) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => return None,
                Err(e) => {
                    debug!("DHCP receive failed: {}", e);
                    return None;
                }
            };
            if port != DHCP_SERVER_PORT {
                continue;
            }
            match self.parse(&scratch[..len], from) {
                Ok(Some(reply)) => return Some(reply),
                Ok(None) => {}
                Err(e) => debug!("dropping DHCP message from {}: {}", from, e),
            }
        }
    }

    fn parse(&self, data: &[u8], from: Ipv4Address) -> Result<Option<Reply>, NetError> {
        let packet = DhcpPacket::new_checked(data)
            .map_err(|_| NetError::InvalidDhcpMessage("truncated"))?;
        let repr = DhcpRepr::parse(&packet)
            .map_err(|_| NetError::InvalidDhcpMessage("malformed"))?;

        if repr.transaction_id != self.transaction_id
            || repr.client_hardware_address != self.mac
        {
            return Ok(None);
        }

        Ok(Some(Reply {
            message_type: repr.message_type,
            your_ip: repr.your_ip,
            server: repr.server_identifier.unwrap_or(from),
            subnet: repr.subnet_mask,
            router: repr.router,
            dns: repr.dns_servers,
            lease_secs: repr.lease_duration,
        }))
    }

    /// Retransmit on timeout; report failure once retries are spent
    fn on_silence<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> LeaseState {
        if self.clock.now_ms().saturating_sub(self.sent_at) < WAIT_TIME_MS {
            return LeaseState::Requesting;
        }
        if self.retries >= MAX_RETRY {
            warn!("DHCP: no answer after {} retries", self.retries);
            self.restart();
            return LeaseState::Failed;
        }

        self.retries += 1;
        let message_type = match self.phase {
            Phase::Requesting => DhcpMessageType::Request,
            _ => DhcpMessageType::Discover,
        };
        debug!("DHCP: retransmitting {:?} ({}/{})", message_type, self.retries, MAX_RETRY);
        match self.send(driver, socket, scratch, message_type) {
            Ok(()) => LeaseState::Requesting,
            Err(e) => {
                warn!("DHCP: retransmit failed: {}", e);
                self.restart();
                LeaseState::Failed
            }
        }
    }

    fn discover<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> LeaseState {
        self.restart();
        self.transaction_id = self.next_transaction_id();
        match self.send(driver, socket, scratch, DhcpMessageType::Discover) {
            Ok(()) => {
                self.phase = Phase::Discovering;
                LeaseState::Requesting
            }
            Err(e) => {
                warn!("DHCP: DISCOVER failed: {}", e);
                LeaseState::Failed
            }
        }
    }

    fn on_offer<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
        reply: Reply,
    ) -> LeaseState {
        debug!("DHCP: offer of {} from {}", reply.your_ip, reply.server);
        self.offered = reply.your_ip;
        self.server = reply.server;
        self.retries = 0;
        match self.send(driver, socket, scratch, DhcpMessageType::Request) {
            Ok(()) => {
                self.phase = Phase::Requesting;
                LeaseState::Requesting
            }
            Err(e) => {
                warn!("DHCP: REQUEST failed: {}", e);
                self.restart();
                LeaseState::Failed
            }
        }
    }

    fn on_ack(&mut self, reply: Reply) -> LeaseState {
        let mut lease = Lease::new(
            reply.your_ip,
            reply.subnet.unwrap_or(Ipv4Address::UNSPECIFIED),
        );
        lease.gateway = reply.router;
        if let Some(dns) = reply.dns {
            for server in dns {
                lease.add_dns(server);
            }
        }
        lease.lease_secs = reply.lease_secs;

        debug!("DHCP: {} acknowledged by {}", lease.ip, reply.server);
        self.lease = Some(lease);
        self.phase = Phase::Checking;
        LeaseState::Assigned
    }

    /// Check nobody else answers for the leased address
    fn check_address<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> LeaseState {
        match driver.send_to(socket, CONFLICT_CHECK_PAYLOAD, self.offered, CONFLICT_CHECK_PORT) {
            Err(NetError::Timeout) => {
                self.phase = Phase::Bound;
                LeaseState::Leased
            }
            Err(e) => {
                warn!("DHCP: address check failed ({}), assuming {} is free", e, self.offered);
                self.phase = Phase::Bound;
                LeaseState::Leased
            }
            Ok(_) => {
                if let Err(e) = self.send(driver, socket, scratch, DhcpMessageType::Decline) {
                    warn!("DHCP: DECLINE failed: {}", e);
                }
                self.phase = Phase::Idle;
                LeaseState::Conflict
            }
        }
    }
}

impl<C: Clock> DhcpSession for DhcpClient<C> {
    fn init_session<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> Result<(), NetError> {
        if scratch.len() < MIN_MESSAGE_LEN {
            return Err(NetError::BufferTooSmall);
        }
        driver.open(socket, Protocol::Udp, DHCP_CLIENT_PORT, SocketFlags::NONE)?;
        self.socket = Some(socket);
        self.sessions = self.sessions.wrapping_add(1);
        self.restart();
        Ok(())
    }

    fn step<D: SocketDriver>(&mut self, driver: &mut D, scratch: &mut [u8]) -> LeaseState {
        let Some(socket) = self.socket else {
            return LeaseState::Init;
        };

        match self.phase {
            Phase::Idle => self.discover(driver, socket, scratch),
            Phase::Discovering => match self.receive(driver, socket, scratch) {
                Some(reply) if reply.message_type == DhcpMessageType::Offer => {
                    self.on_offer(driver, socket, scratch, reply)
                }
                Some(_) => LeaseState::Requesting,
                None => self.on_silence(driver, socket, scratch),
            },
            Phase::Requesting => match self.receive(driver, socket, scratch) {
                Some(reply) if reply.message_type == DhcpMessageType::Ack => self.on_ack(reply),
                Some(reply) if reply.message_type == DhcpMessageType::Nak => {
                    warn!("DHCP: request for {} refused", self.offered);
                    self.restart();
                    LeaseState::Requesting
                }
                Some(_) => LeaseState::Requesting,
                None => self.on_silence(driver, socket, scratch),
            },
            Phase::Checking => self.check_address(driver, socket, scratch),
            Phase::Bound => LeaseState::Leased,
        }
    }

    fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::drivers::bus::TransferMode;
    use crate::drivers::w5500::{tests::FakeChip, W5500};
    use crate::drivers::SocketStatus;
    use core::cell::Cell;
    use std::rc::Rc;
    use std::vec;

    const MAC: EthernetAddress = EthernetAddress([0x00, 0x08, 0xdc, 0x00, 0xab, 0xcd]);
    const SERVER: Ipv4Address = Ipv4Address::new(192, 168, 1, 1);
    const OFFERED: Ipv4Address = Ipv4Address::new(192, 168, 1, 123);

    struct Harness {
        chip: W5500<FakeChip>,
        client: DhcpClient<std::boxed::Box<dyn Fn() -> u64>>,
        now: Rc<Cell<u64>>,
        scratch: std::vec::Vec<u8>,
        socket: Socket,
    }

    impl Harness {
        fn new() -> Self {
            let now = Rc::new(Cell::new(0u64));
            let clock_now = now.clone();
            let clock: std::boxed::Box<dyn Fn() -> u64> = std::boxed::Box::new(move || clock_now.get());
            let mut harness = Self {
                chip: W5500::new(FakeChip::new(), TransferMode::Burst),
                client: DhcpClient::new(MAC, clock),
                now,
                scratch: vec![0u8; super::super::DHCP_SCRATCH_LEN],
                socket: Socket::new(0).unwrap(),
            };
            harness
                .client
                .init_session(&mut harness.chip, harness.socket, &mut harness.scratch)
                .unwrap();
            harness
        }

        fn step(&mut self) -> LeaseState {
            self.client.step(&mut self.chip, &mut self.scratch)
        }

        /// Messages the client sent since the last call
        fn take_sent(&mut self) -> std::vec::Vec<u8> {
            self.chip.bus_mut().sent.remove(&0).unwrap_or_default()
        }

        fn reply(&mut self, message_type: DhcpMessageType) {
            let dns: Vec<Ipv4Address, DHCP_MAX_DNS_SERVER_COUNT> =
                Vec::from_slice(&[Ipv4Address::new(8, 8, 8, 8)]).unwrap();
            let repr = DhcpRepr {
                message_type,
                transaction_id: self.client.transaction_id(),
                secs: 0,
                client_hardware_address: MAC,
                client_ip: Ipv4Address::UNSPECIFIED,
                your_ip: OFFERED,
                server_ip: SERVER,
                router: Some(SERVER),
                subnet_mask: Some(Ipv4Address::new(255, 255, 255, 0)),
                relay_agent_ip: Ipv4Address::UNSPECIFIED,
                broadcast: false,
                requested_ip: None,
                client_identifier: None,
                server_identifier: Some(SERVER),
                parameter_request_list: None,
                dns_servers: Some(dns),
                max_size: None,
                lease_duration: Some(3600),
                renew_duration: None,
                rebind_duration: None,
                additional_options: &[],
            };
            let mut bytes = vec![0u8; repr.buffer_len()];
            repr.emit(&mut DhcpPacket::new_unchecked(&mut bytes[..])).unwrap();
            self.chip
                .bus_mut()
                .inject_datagram(0, SERVER, DHCP_SERVER_PORT, &bytes);
        }

        fn sent_message_type(bytes: &[u8]) -> DhcpMessageType {
            let packet = DhcpPacket::new_checked(bytes).unwrap();
            DhcpRepr::parse(&packet).unwrap().message_type
        }
    }

    #[test]
    fn test_session_opens_udp_socket() {
        let mut harness = Harness::new();
        assert_eq!(harness.chip.status(harness.socket), Ok(SocketStatus::Udp));
    }

    #[test]
    fn test_full_exchange_without_conflict() {
        let mut harness = Harness::new();
        harness.chip.bus_mut().unanswered.push(OFFERED);

        assert_eq!(harness.step(), LeaseState::Requesting);
        let discover = harness.take_sent();
        assert_eq!(Harness::sent_message_type(&discover), DhcpMessageType::Discover);
        assert_eq!(
            harness.chip.bus_mut().sent_to[&0],
            (Ipv4Address::BROADCAST, DHCP_SERVER_PORT)
        );

        // Nothing yet
        assert_eq!(harness.step(), LeaseState::Requesting);

        harness.reply(DhcpMessageType::Offer);
        assert_eq!(harness.step(), LeaseState::Requesting);
        let request = harness.take_sent();
        assert_eq!(Harness::sent_message_type(&request), DhcpMessageType::Request);

        harness.reply(DhcpMessageType::Ack);
        assert_eq!(harness.step(), LeaseState::Assigned);

        let lease = harness.client.lease().unwrap().clone();
        assert_eq!(lease.ip, OFFERED);
        assert_eq!(lease.gateway, Some(SERVER));
        assert_eq!(lease.subnet, Ipv4Address::new(255, 255, 255, 0));
        assert_eq!(lease.dns.as_slice(), &[Ipv4Address::new(8, 8, 8, 8)]);
        assert_eq!(lease.lease_secs, Some(3600));

        assert_eq!(harness.step(), LeaseState::Leased);
        assert_eq!(harness.step(), LeaseState::Leased);
    }

    #[test]
    fn test_answered_address_check_declines_lease() {
        let mut harness = Harness::new();

        harness.step();
        harness.reply(DhcpMessageType::Offer);
        harness.step();
        harness.reply(DhcpMessageType::Ack);
        assert_eq!(harness.step(), LeaseState::Assigned);
        harness.take_sent();

        assert_eq!(harness.step(), LeaseState::Conflict);

        let sent = harness.take_sent();
        let decline = &sent[CONFLICT_CHECK_PAYLOAD.len()..];
        assert_eq!(Harness::sent_message_type(decline), DhcpMessageType::Decline);
    }

    #[test]
    fn test_nak_restarts_discovery() {
        let mut harness = Harness::new();

        harness.step();
        harness.reply(DhcpMessageType::Offer);
        harness.step();
        harness.take_sent();

        harness.reply(DhcpMessageType::Nak);
        assert_eq!(harness.step(), LeaseState::Requesting);
        assert!(harness.client.lease().is_none());

        assert_eq!(harness.step(), LeaseState::Requesting);
        let discover = harness.take_sent();
        assert_eq!(Harness::sent_message_type(&discover), DhcpMessageType::Discover);
    }

    #[test]
    fn test_silence_exhausts_retries() {
        let mut harness = Harness::new();

        assert_eq!(harness.step(), LeaseState::Requesting);
        harness.take_sent();

        for retry in 1..=MAX_RETRY as u64 {
            harness.now.set(retry * WAIT_TIME_MS);
            assert_eq!(harness.step(), LeaseState::Requesting);
            let resent = harness.take_sent();
            assert_eq!(Harness::sent_message_type(&resent), DhcpMessageType::Discover);
        }

        harness.now.set((MAX_RETRY as u64 + 1) * WAIT_TIME_MS);
        assert_eq!(harness.step(), LeaseState::Failed);

        // The next step starts over
        assert_eq!(harness.step(), LeaseState::Requesting);
    }

    #[test]
    fn test_foreign_transaction_is_ignored() {
        let mut harness = Harness::new();
        harness.step();
        harness.take_sent();

        harness.reply(DhcpMessageType::Offer);
        harness.client.transaction_id ^= 1;
        assert_eq!(harness.step(), LeaseState::Requesting);
        assert!(harness.take_sent().is_empty());
    }

    #[test]
    fn test_step_before_init() {
        let mut chip = W5500::new(FakeChip::new(), TransferMode::Burst);
        let mut client = DhcpClient::new(MAC, || 0u64);
        let mut scratch = [0u8; 600];
        assert_eq!(client.step(&mut chip, &mut scratch), LeaseState::Init);
    }
}
