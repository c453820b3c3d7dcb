//! Link bring-up
//!
//! Sequences chip initialization, waits for the physical link and programs
//! the hardware address. Nothing else can run before the cable is present,
//! so the link wait has no timeout.

use crate::drivers::{BufferLayout, ChipControl, PhyLink};
use crate::error::InitError;
use log::{info, warn};
use smoltcp::wire::EthernetAddress;

/// Proof that the chip is initialized, linked and addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub chip_id: &'static str,
    pub link: PhyLink,
    pub mac: EthernetAddress,
}

/// Bring the controller up.
///
/// # Arguments
/// * `chip` - Chip driver, already bound to its bus transport
/// * `layout` - Per-socket TX/RX buffer sizes
/// * `mac` - Build-time hardware address
///
/// # Returns
/// * `Ok(Ready)` - Chip initialized and link up
/// * `Err(InitError)` - Fatal; the device cannot continue
pub fn bring_up<C: ChipControl>(
    chip: &mut C,
    layout: &BufferLayout,
    mac: EthernetAddress,
) -> Result<Ready, InitError> {
    chip.initialize(layout).map_err(InitError::Initialize)?;
    let chip_id = chip.chip_id().map_err(InitError::Initialize)?;

    let link = wait_for_link(chip);
    info!("{} link up: {:?}", chip_id, link);

    chip.set_hardware_address(mac)
        .map_err(InitError::HardwareAddress)?;

    Ok(Ready { chip_id, link, mac })
}

/// Spin until the PHY reports a link
fn wait_for_link<C: ChipControl>(chip: &mut C) -> PhyLink {
    let mut reported = false;
    loop {
        match chip.phy_link() {
            Ok(PhyLink::Down) => {
                if !reported {
                    info!("waiting for Ethernet link");
                    reported = true;
                }
            }
            Ok(link) => return link,
            Err(e) => warn!("unknown PHY link status: {}", e),
        }
    }
}
