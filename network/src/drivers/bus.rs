// Serial bus transport for the Ethernet controller
// Byte and burst transfers bracketed by chip-select

use crate::error::NetError;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};

/// Which primitives the chip driver uses for multi-byte transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One bus transaction per byte
    Byte,
    /// Whole blocks in a single transaction
    Burst,
}

/// Raw bus access used by the chip driver.
///
/// Implementations carry their own context (bus handle, chip-select line),
/// so the driver never needs global state to reach the hardware.
pub trait BusTransport {
    /// Assert chip-select
    fn select(&mut self) -> Result<(), NetError>;

    /// De-assert chip-select
    fn deselect(&mut self) -> Result<(), NetError>;

    /// Clock a single byte in
    fn read_byte(&mut self) -> Result<u8, NetError>;

    /// Clock a single byte out
    fn write_byte(&mut self, byte: u8) -> Result<(), NetError>;

    /// Fill `buf` from the bus
    fn read_burst(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        for byte in buf.iter_mut() {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Write all of `buf` to the bus
    fn write_burst(&mut self, buf: &[u8]) -> Result<(), NetError> {
        for &byte in buf {
            self.write_byte(byte)?;
        }
        Ok(())
    }
}

/// [`BusTransport`] over an `embedded-hal` SPI bus and an active-low
/// chip-select pin.
pub struct SpiTransport<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> SpiTransport<SPI, CS>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    /// Give the bus and pin back
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

fn bus_error<E: spi::Error>(err: E) -> NetError {
    NetError::Bus(err.kind())
}

fn pin_error<E: digital::Error>(err: E) -> NetError {
    NetError::ChipSelect(err.kind())
}

impl<SPI, CS> BusTransport for SpiTransport<SPI, CS>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
{
    fn select(&mut self) -> Result<(), NetError> {
        self.cs.set_low().map_err(pin_error)
    }

    fn deselect(&mut self) -> Result<(), NetError> {
        // Drain the bus before releasing the chip
        self.spi.flush().map_err(bus_error)?;
        self.cs.set_high().map_err(pin_error)
    }

    fn read_byte(&mut self) -> Result<u8, NetError> {
        let mut byte = [0u8; 1];
        self.spi.read(&mut byte).map_err(bus_error)?;
        Ok(byte[0])
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), NetError> {
        self.spi.write(&[byte]).map_err(bus_error)
    }

    fn read_burst(&mut self, buf: &mut [u8]) -> Result<(), NetError> {
        buf.fill(0);
        self.spi.read(buf).map_err(bus_error)
    }

    fn write_burst(&mut self, buf: &[u8]) -> Result<(), NetError> {
        self.spi.write(buf).map_err(bus_error)
    }
}
