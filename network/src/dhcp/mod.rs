//! DHCP lease acquisition
//!
//! The [`LeaseManager`] drives a non-blocking [`DhcpSession`] to completion:
//! it calls [`DhcpSession::step`] repeatedly and reacts to the returned
//! [`LeaseState`].
//!
//! - `Assigned`: the negotiated parameters are applied to the chip
//! - `Leased` after `Assigned`: acquisition is complete
//! - `Failed`: the whole session is restarted, forever if need be
//! - `Conflict` after `Assigned`: acquisition ends with
//!   [`LeaseError::Conflict`], which the caller must treat as fatal
//! - `Conflict` or `Leased` before `Assigned`: treated like `Failed`
//!
//! Retransmission timing lives entirely inside the session.

pub mod client;

pub use client::{Clock, DhcpClient};

use crate::drivers::{ChipControl, Socket, SocketDriver};
use crate::error::{LeaseError, NetError};
use crate::identity::{AddressMode, NetworkIdentity};
use heapless::Vec;
use log::{debug, error, info, warn};
use smoltcp::wire::{EthernetAddress, Ipv4Address, DHCP_MAX_DNS_SERVER_COUNT};

/// Size of the scratch buffer DHCP messages are built and parsed in
pub const DHCP_SCRATCH_LEN: usize = 2048;

/// DHCP protocol progress as reported by a session step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Session not opened yet
    Init,
    /// DISCOVER or REQUEST outstanding
    Requesting,
    /// Server acknowledged an address
    Assigned,
    /// Address confirmed usable
    Leased,
    /// Negotiation did not complete
    Failed,
    /// Address already in use on the link
    Conflict,
}

impl core::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LeaseState::Init => write!(f, "Init"),
            LeaseState::Requesting => write!(f, "Requesting"),
            LeaseState::Assigned => write!(f, "Assigned"),
            LeaseState::Leased => write!(f, "Leased"),
            LeaseState::Failed => write!(f, "Failed"),
            LeaseState::Conflict => write!(f, "Conflict"),
        }
    }
}

/// IP configuration obtained from a DHCP server
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Assigned IP address
    pub ip: Ipv4Address,
    /// Subnet mask
    pub subnet: Ipv4Address,
    /// Gateway/router IP address
    pub gateway: Option<Ipv4Address>,
    /// DNS server addresses
    pub dns: Vec<Ipv4Address, DHCP_MAX_DNS_SERVER_COUNT>,
    /// Lease duration in seconds, if the server sent one
    pub lease_secs: Option<u32>,
}

impl Lease {
    /// Create a new Lease with the given IP address and subnet mask
    pub fn new(ip: Ipv4Address, subnet: Ipv4Address) -> Self {
        Self {
            ip,
            subnet,
            gateway: None,
            dns: Vec::new(),
            lease_secs: None,
        }
    }

    /// Set the gateway address
    pub fn with_gateway(mut self, gateway: Ipv4Address) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Add a DNS server address; servers beyond the first three are ignored
    pub fn add_dns(&mut self, dns: Ipv4Address) {
        let _ = self.dns.push(dns);
    }

    /// Network identity for this lease on the interface `mac`
    pub fn identity(&self, mac: EthernetAddress) -> NetworkIdentity {
        NetworkIdentity {
            mac,
            ip: self.ip,
            subnet: self.subnet,
            gateway: self.gateway.unwrap_or(Ipv4Address::UNSPECIFIED),
            dns: self.dns.first().copied().unwrap_or(Ipv4Address::UNSPECIFIED),
            mode: AddressMode::Dhcp,
        }
    }
}

/// A non-blocking DHCP negotiation.
///
/// Implementations own all protocol timers and retransmission counters.
pub trait DhcpSession {
    /// Open the session on `socket`, discarding any previous progress
    fn init_session<D: SocketDriver>(
        &mut self,
        driver: &mut D,
        socket: Socket,
        scratch: &mut [u8],
    ) -> Result<(), NetError>;

    /// Advance the negotiation by one step and report where it stands
    fn step<D: SocketDriver>(&mut self, driver: &mut D, scratch: &mut [u8]) -> LeaseState;

    /// Parameters negotiated so far
    fn lease(&self) -> Option<&Lease>;
}

/// Hooks invoked as a lease is acquired
pub trait LeaseEvents {
    /// Parameters were negotiated and applied to the chip
    fn on_assign(&mut self, _identity: &NetworkIdentity) {}

    /// The lease is confirmed stable
    fn on_lease_confirmed(&mut self, _identity: &NetworkIdentity) {}

    /// The negotiated address collides with another host
    fn on_conflict(&mut self, _ip: Ipv4Address) {}
}

impl LeaseEvents for () {}

/// Drives DHCP sessions until a lease is confirmed
pub struct LeaseManager<'buf> {
    socket: Socket,
    scratch: &'buf mut [u8],
    mac: EthernetAddress,
    state: LeaseState,
    cycles: u32,
}

impl<'buf> LeaseManager<'buf> {
    /// Create a manager that negotiates on `socket` using `scratch` for
    /// message construction
    pub fn new(socket: Socket, scratch: &'buf mut [u8], mac: EthernetAddress) -> Self {
        Self {
            socket,
            scratch,
            mac,
            state: LeaseState::Init,
            cycles: 0,
        }
    }

    /// Last state observed
    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Number of sessions opened so far
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Run sessions until a lease is confirmed.
    ///
    /// Failed sessions are restarted without limit. Returns only once an
    /// address has been assigned, applied and confirmed, or on conflict.
    pub fn acquire_lease<D, S, E>(
        &mut self,
        driver: &mut D,
        session: &mut S,
        events: &mut E,
    ) -> Result<NetworkIdentity, LeaseError>
    where
        D: ChipControl + SocketDriver,
        S: DhcpSession,
        E: LeaseEvents,
    {
        loop {
            self.cycles += 1;
            self.state = LeaseState::Init;

            if let Err(e) = session.init_session(driver, self.socket, self.scratch) {
                warn!("DHCP session could not start: {}", e);
                self.state = LeaseState::Failed;
                continue;
            }
            self.state = LeaseState::Requesting;

            if let Some(outcome) = self.run_session(driver, session, events) {
                return outcome;
            }
        }
    }

    /// Step one session. `None` means the session must be restarted.
    fn run_session<D, S, E>(
        &mut self,
        driver: &mut D,
        session: &mut S,
        events: &mut E,
    ) -> Option<Result<NetworkIdentity, LeaseError>>
    where
        D: ChipControl + SocketDriver,
        S: DhcpSession,
        E: LeaseEvents,
    {
        let mut assigned: Option<NetworkIdentity> = None;

        loop {
            let state = session.step(driver, self.scratch);
            let previous = core::mem::replace(&mut self.state, state);

            match state {
                LeaseState::Init | LeaseState::Requesting => {}
                LeaseState::Assigned => {
                    if previous == LeaseState::Assigned {
                        continue;
                    }
                    debug!("DHCP: {}", state);
                    match self.apply(driver, session) {
                        Ok(identity) => {
                            events.on_assign(&identity);
                            assigned = Some(identity);
                        }
                        Err(e) => {
                            warn!("DHCP: could not apply lease: {}", e);
                            self.state = LeaseState::Failed;
                            return None;
                        }
                    }
                }
                LeaseState::Leased => match assigned {
                    Some(identity) => {
                        info!("DHCP: {} {}", state, identity.ip);
                        events.on_lease_confirmed(&identity);
                        if let Err(e) = driver.close(self.socket) {
                            warn!("DHCP: could not release socket: {}", e);
                        }
                        return Some(Ok(identity));
                    }
                    None => {
                        warn!("DHCP: lease confirmed before assignment, restarting");
                        self.state = LeaseState::Failed;
                        return None;
                    }
                },
                LeaseState::Failed => {
                    warn!("DHCP: {}", state);
                    return None;
                }
                LeaseState::Conflict => match assigned {
                    Some(identity) => {
                        error!("DHCP: IP conflict on {}", identity.ip);
                        events.on_conflict(identity.ip);
                        return Some(Err(LeaseError::Conflict(identity.ip)));
                    }
                    None => {
                        warn!("DHCP: conflict reported before assignment, restarting");
                        self.state = LeaseState::Failed;
                        return None;
                    }
                },
            }
        }
    }

    fn apply<D, S>(&mut self, driver: &mut D, session: &S) -> Result<NetworkIdentity, NetError>
    where
        D: ChipControl,
        S: DhcpSession,
    {
        let lease = session
            .lease()
            .ok_or(NetError::InvalidDhcpMessage("assignment without lease"))?;
        let identity = lease.identity(self.mac);
        if !identity.is_configured() {
            return Err(NetError::InvalidDhcpMessage("lease without address"));
        }
        driver.set_network_info(&identity)?;

        if let Ok(applied) = driver.network_info() {
            let chip = driver.chip_id().unwrap_or("?");
            info!("{} NET CONF: {}", chip, applied);
        }
        Ok(identity)
    }
}
