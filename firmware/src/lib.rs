#![no_std]

//! echo-node firmware
//!
//! Board-agnostic application entry. The board crate sets up clocks and
//! peripherals, then hands the SPI bus, chip-select pin, a delay, a
//! millisecond clock and a console to [`run`], which never returns.
//!
//! Start-up order:
//! 1. Validate the build-time configuration
//! 2. Bring the W5500 up and wait for link
//! 3. Obtain an address from DHCP, or apply the static one
//! 4. Serve echo clients forever
//!
//! Configuration, chip and DHCP conflict failures end in [`halt`].

pub mod console;

use config::{Addressing, ConfigError, DeviceConfig, StaticIp};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::{error, info, warn, LevelFilter};
use network::{
    bring_up, AddressMode, ChipControl, Clock, DhcpClient, DhcpSession, EchoServer,
    EthernetAddress, InitError, Ipv4Address, LeaseError, LeaseEvents, LeaseManager, NetError,
    NetworkIdentity, Socket, SocketDriver, SpiTransport, TransferMode, DHCP_SCRATCH_LEN, W5500,
};
use thiserror::Error;

pub use console::{ConsoleLogger, ConsoleSink, ConsoleWrite};

/// Conditions the device cannot recover from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Init(#[from] InitError),

    #[error("{0}")]
    Lease(#[from] LeaseError),

    #[error("network setup failed: {0}")]
    Network(#[from] NetError),
}

/// Logs lease progress the way the status console reports it
#[derive(Debug, Default)]
pub struct LeaseLog;

impl LeaseEvents for LeaseLog {
    fn on_assign(&mut self, identity: &NetworkIdentity) {
        info!("DHCP IP assigned: {}", identity.ip);
    }

    fn on_lease_confirmed(&mut self, identity: &NetworkIdentity) {
        info!("DHCP lease confirmed: {}", identity);
    }

    fn on_conflict(&mut self, ip: Ipv4Address) {
        error!("CONFLICT IP from DHCP: {}", ip);
    }
}

/// Run the firmware
pub fn run<SPI, CS, D, C>(
    spi: SPI,
    cs: CS,
    delay: D,
    clock: C,
    console: console::Console,
    config: &DeviceConfig,
) -> !
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    D: DelayNs,
    C: Clock,
{
    console::init(console, LevelFilter::Info);
    info!("Started....");

    if let Err(e) = config.validate() {
        halt(e.into());
    }

    let mode = if config.burst_transfers {
        TransferMode::Burst
    } else {
        TransferMode::Byte
    };
    let mut chip = W5500::new(SpiTransport::new(spi, cs), mode);

    let layout = config.buffer_layout();
    let mac = EthernetAddress(config.mac);
    if let Err(e) = bring_up(&mut chip, &layout, mac) {
        halt(e.into());
    }

    let mut session = DhcpClient::new(mac, clock);
    let identity = match configure(&mut chip, &mut session, config, &mut LeaseLog) {
        Ok(identity) => identity,
        Err(e) => halt(e),
    };
    info!("ready with ip: {}", identity.ip);

    let socket = match Socket::new(config.echo_socket) {
        Ok(socket) => socket,
        Err(e) => halt(e.into()),
    };
    let mut server = EchoServer::new(
        &mut chip,
        delay,
        socket,
        config.echo_port,
        config.greeting.as_bytes(),
        config.listen_poll_ms,
    );
    server.serve(&mut ConsoleSink)
}

/// Give the chip its IPv4 configuration.
///
/// With DHCP addressing this blocks until a lease is confirmed; failed
/// negotiations are retried without limit.
pub fn configure<D, S, E>(
    chip: &mut D,
    session: &mut S,
    config: &DeviceConfig,
    events: &mut E,
) -> Result<NetworkIdentity, Fatal>
where
    D: ChipControl + SocketDriver,
    S: DhcpSession,
    E: LeaseEvents,
{
    let mac = EthernetAddress(config.mac);
    match config.addressing {
        Addressing::Static(ref ip) => {
            let identity = static_identity(mac, ip);
            chip.set_network_info(&identity)?;
            info!("static NET CONF: {}", identity);
            Ok(identity)
        }
        Addressing::Dhcp => {
            let socket = Socket::new(config.dhcp_socket)?;
            let mut scratch = [0u8; DHCP_SCRATCH_LEN];
            let len = config.dhcp_scratch_len.min(DHCP_SCRATCH_LEN);
            let mut manager = LeaseManager::new(socket, &mut scratch[..len], mac);
            let identity = manager.acquire_lease(chip, session, events)?;
            if manager.cycles() > 1 {
                warn!("DHCP needed {} sessions", manager.cycles());
            }
            Ok(identity)
        }
    }
}

/// Identity for a statically addressed device
pub fn static_identity(mac: EthernetAddress, ip: &StaticIp) -> NetworkIdentity {
    NetworkIdentity {
        mac,
        ip: Ipv4Address(ip.ip),
        subnet: Ipv4Address(ip.subnet_mask),
        gateway: Ipv4Address(ip.gateway),
        dns: Ipv4Address(ip.dns),
        mode: AddressMode::Static,
    }
}

/// Stop the device for good
pub fn halt(reason: Fatal) -> ! {
    error!("halted: {}", reason);
    loop {
        core::hint::spin_loop();
    }
}
