//! Lease manager tests
//!
//! Drive the lease manager with scripted DHCP sessions and a recording chip
//! to check the restart, assignment and conflict behavior.

use network::drivers::{BufferLayout, PhyLink, Protocol, SocketFlags};
use network::{
    AddressMode, ChipControl, DhcpSession, EthernetAddress, Ipv4Address, Lease, LeaseError,
    LeaseEvents, LeaseManager, LeaseState, NetError, NetworkIdentity, Socket, SocketDriver,
    SocketStatus,
};
use std::collections::VecDeque;

const MAC: EthernetAddress = EthernetAddress([0x00, 0x08, 0xdc, 0x00, 0xab, 0xcd]);
const LEASED_IP: Ipv4Address = Ipv4Address::new(192, 168, 1, 123);

/// Chip that records applied identities and socket teardown
#[derive(Default)]
struct RecordingChip {
    applied: Vec<NetworkIdentity>,
    closed: usize,
}

impl ChipControl for RecordingChip {
    fn initialize(&mut self, _layout: &BufferLayout) -> Result<(), NetError> {
        Ok(())
    }

    fn phy_link(&mut self) -> Result<PhyLink, NetError> {
        Ok(PhyLink::Down)
    }

    fn chip_id(&mut self) -> Result<&'static str, NetError> {
        Ok("scripted")
    }

    fn set_hardware_address(&mut self, _mac: EthernetAddress) -> Result<(), NetError> {
        Ok(())
    }

    fn set_network_info(&mut self, identity: &NetworkIdentity) -> Result<(), NetError> {
        self.applied.push(*identity);
        Ok(())
    }

    fn network_info(&mut self) -> Result<NetworkIdentity, NetError> {
        self.applied.last().copied().ok_or(NetError::Timeout)
    }
}

impl SocketDriver for RecordingChip {
    fn open(&mut self, _: Socket, _: Protocol, _: u16, _: SocketFlags) -> Result<(), NetError> {
        Ok(())
    }

    fn listen(&mut self, _: Socket) -> Result<(), NetError> {
        Ok(())
    }

    fn status(&mut self, _: Socket) -> Result<SocketStatus, NetError> {
        Ok(SocketStatus::Udp)
    }

    fn send(&mut self, _: Socket, data: &[u8]) -> Result<usize, NetError> {
        Ok(data.len())
    }

    fn recv(&mut self, _: Socket, _: &mut [u8]) -> Result<usize, NetError> {
        Ok(0)
    }

    fn send_to(&mut self, _: Socket, data: &[u8], _: Ipv4Address, _: u16) -> Result<usize, NetError> {
        Ok(data.len())
    }

    fn recv_from(
        &mut self,
        _: Socket,
        _: &mut [u8],
    ) -> Result<Option<(usize, Ipv4Address, u16)>, NetError> {
        Ok(None)
    }

    fn disconnect(&mut self, _: Socket) -> Result<(), NetError> {
        Ok(())
    }

    fn close(&mut self, _: Socket) -> Result<(), NetError> {
        self.closed += 1;
        Ok(())
    }
}

/// Session that replays one list of step outcomes per init cycle
struct ScriptedSession {
    cycles: VecDeque<Result<VecDeque<LeaseState>, NetError>>,
    steps: VecDeque<LeaseState>,
    inits: usize,
    lease: Lease,
    /// Leading cycles whose lease carries no address
    unaddressed: usize,
    current: Lease,
    assigned: bool,
}

impl ScriptedSession {
    fn new(cycles: Vec<Result<Vec<LeaseState>, NetError>>) -> Self {
        let mut lease = Lease::new(LEASED_IP, Ipv4Address::new(255, 255, 255, 0))
            .with_gateway(Ipv4Address::new(192, 168, 1, 1));
        lease.add_dns(Ipv4Address::new(8, 8, 8, 8));
        Self {
            cycles: cycles
                .into_iter()
                .map(|cycle| cycle.map(VecDeque::from))
                .collect(),
            steps: VecDeque::new(),
            inits: 0,
            current: lease.clone(),
            lease,
            unaddressed: 0,
            assigned: false,
        }
    }
}

impl DhcpSession for ScriptedSession {
    fn init_session<D: SocketDriver>(
        &mut self,
        _driver: &mut D,
        _socket: Socket,
        _scratch: &mut [u8],
    ) -> Result<(), NetError> {
        self.inits += 1;
        self.assigned = false;
        self.current = if self.unaddressed > 0 {
            self.unaddressed -= 1;
            Lease::new(Ipv4Address::UNSPECIFIED, Ipv4Address::new(255, 255, 255, 0))
        } else {
            self.lease.clone()
        };
        let cycle = self.cycles.pop_front().expect("script exhausted");
        self.steps = cycle?;
        Ok(())
    }

    fn step<D: SocketDriver>(&mut self, _driver: &mut D, _scratch: &mut [u8]) -> LeaseState {
        let state = self.steps.pop_front().expect("cycle exhausted");
        if state == LeaseState::Assigned {
            self.assigned = true;
        }
        state
    }

    fn lease(&self) -> Option<&Lease> {
        self.assigned.then_some(&self.current)
    }
}

#[derive(Default)]
struct Events {
    log: Vec<&'static str>,
    conflicts: Vec<Ipv4Address>,
}

impl LeaseEvents for Events {
    fn on_assign(&mut self, _identity: &NetworkIdentity) {
        self.log.push("assign");
    }

    fn on_lease_confirmed(&mut self, _identity: &NetworkIdentity) {
        self.log.push("confirmed");
    }

    fn on_conflict(&mut self, ip: Ipv4Address) {
        self.log.push("conflict");
        self.conflicts.push(ip);
    }
}

fn acquire(
    session: &mut ScriptedSession,
    chip: &mut RecordingChip,
    events: &mut Events,
) -> (Result<NetworkIdentity, LeaseError>, u32) {
    let mut scratch = [0u8; 64];
    let mut manager = LeaseManager::new(Socket::new(0).unwrap(), &mut scratch, MAC);
    let result = manager.acquire_lease(chip, session, events);
    (result, manager.cycles())
}

#[test]
fn test_failures_restart_whole_session() {
    for failures in 0..4 {
        let mut cycles: Vec<Result<Vec<LeaseState>, NetError>> = (0..failures)
            .map(|_| Ok(vec![LeaseState::Requesting, LeaseState::Failed]))
            .collect();
        cycles.push(Ok(vec![
            LeaseState::Requesting,
            LeaseState::Requesting,
            LeaseState::Assigned,
            LeaseState::Assigned,
            LeaseState::Leased,
        ]));
        let mut session = ScriptedSession::new(cycles);
        let mut chip = RecordingChip::default();
        let mut events = Events::default();

        let (result, cycles) = acquire(&mut session, &mut chip, &mut events);
        let identity = result.unwrap();

        assert_eq!(cycles, failures + 1, "session cycles after {} failures", failures);
        assert_eq!(session.inits, failures as usize + 1);
        assert_eq!(identity.ip, LEASED_IP);
        assert_eq!(identity.mac, MAC);
        assert_eq!(identity.mode, AddressMode::Dhcp);
        assert_eq!(events.log, ["assign", "confirmed"]);
    }
}

#[test]
fn test_assignment_is_applied_to_chip() {
    let mut session = ScriptedSession::new(vec![Ok(vec![LeaseState::Assigned, LeaseState::Leased])]);
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, _) = acquire(&mut session, &mut chip, &mut events);
    let identity = result.unwrap();

    assert_eq!(chip.applied, [identity]);
    assert_eq!(identity.gateway, Ipv4Address::new(192, 168, 1, 1));
    assert_eq!(identity.subnet, Ipv4Address::new(255, 255, 255, 0));
    assert_eq!(identity.dns, Ipv4Address::new(8, 8, 8, 8));
    // The DHCP socket is released once the lease is confirmed
    assert_eq!(chip.closed, 1);
}

#[test]
fn test_conflict_is_reported_once() {
    let mut session = ScriptedSession::new(vec![Ok(vec![
        LeaseState::Requesting,
        LeaseState::Assigned,
        LeaseState::Conflict,
    ])]);
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, cycles) = acquire(&mut session, &mut chip, &mut events);

    assert_eq!(result, Err(LeaseError::Conflict(LEASED_IP)));
    assert_eq!(cycles, 1);
    assert_eq!(events.conflicts, [LEASED_IP]);
    assert_eq!(events.log, ["assign", "conflict"]);
}

#[test]
fn test_leased_without_assignment_restarts() {
    let mut session = ScriptedSession::new(vec![
        Ok(vec![LeaseState::Requesting, LeaseState::Leased]),
        Ok(vec![LeaseState::Assigned, LeaseState::Leased]),
    ]);
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, cycles) = acquire(&mut session, &mut chip, &mut events);

    assert!(result.is_ok());
    assert_eq!(cycles, 2);
    assert_eq!(events.log, ["assign", "confirmed"]);
    assert_eq!(chip.applied.len(), 1);
}

#[test]
fn test_init_failure_counts_as_cycle() {
    let mut session = ScriptedSession::new(vec![
        Err(NetError::SocketState(0x00)),
        Ok(vec![LeaseState::Assigned, LeaseState::Leased]),
    ]);
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, cycles) = acquire(&mut session, &mut chip, &mut events);

    assert!(result.is_ok());
    assert_eq!(cycles, 2);
}

#[test]
fn test_conflict_before_assignment_restarts() {
    let mut session = ScriptedSession::new(vec![
        Ok(vec![LeaseState::Requesting, LeaseState::Conflict]),
        Ok(vec![LeaseState::Assigned, LeaseState::Leased]),
    ]);
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, cycles) = acquire(&mut session, &mut chip, &mut events);

    assert_eq!(result.map(|identity| identity.ip), Ok(LEASED_IP));
    assert_eq!(cycles, 2);
    assert!(events.conflicts.is_empty());
    assert_eq!(events.log, ["assign", "confirmed"]);
}

#[test]
fn test_lease_without_address_is_not_applied() {
    let mut session = ScriptedSession::new(vec![
        Ok(vec![LeaseState::Assigned]),
        Ok(vec![LeaseState::Assigned, LeaseState::Leased]),
    ]);
    session.unaddressed = 1;
    let mut chip = RecordingChip::default();
    let mut events = Events::default();

    let (result, cycles) = acquire(&mut session, &mut chip, &mut events);

    assert_eq!(result.map(|identity| identity.ip), Ok(LEASED_IP));
    assert_eq!(cycles, 2);
    assert_eq!(chip.applied.len(), 1);
    assert_eq!(chip.applied[0].ip, LEASED_IP);
    assert_eq!(events.log, ["assign", "confirmed"]);
}
