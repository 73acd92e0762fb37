//! High-level interface to the DW1000
//!
//! [`DW1000`] presents the radio as a set of precisely timed one-shot
//! operations: program a delayed transmit or receive at a 40-bit system time,
//! then poll [`DW1000::poll_tx`] / [`DW1000::poll_rx`] (or watch the IRQ line
//! configured with [`DW1000::enable_interrupts`]) until it completes. The
//! [register-level interface] stays reachable through [`DW1000::ll`].
//!
//! [register-level interface]: ../ll/index.html

use core::fmt;

use embedded_hal::{blocking::spi, digital::v2::OutputPin};

use crate::{configs::Config, ll, time::Instant};

pub use error::*;
pub use init::*;
pub use rx::*;
pub use sleep::*;

mod error;
mod init;
mod rx;
mod sleep;
mod tx;

/// Entry point to the DW1000 driver API
pub struct DW1000<SPI, CS> {
    ll: ll::DW1000<SPI, CS>,
    config: Config,
    tx_antenna_delay: u16,
    rx_antenna_delay: u16,
}

// Can't be derived without putting requirements on `SPI` and `CS`.
impl<SPI, CS> fmt::Debug for DW1000<SPI, CS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DW1000 {{ config: {:?}, tx_antenna_delay: {}, .. }}",
            self.config, self.tx_antenna_delay
        )
    }
}

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Wraps the bus. Call [`DW1000::init`] before anything else.
    pub fn new(spi: SPI, chip_select: CS) -> Self {
        DW1000 {
            ll: ll::DW1000::new(spi, chip_select),
            config: Config::default(),
            tx_antenna_delay: 0,
            rx_antenna_delay: 0,
        }
    }

    /// Access to the register-level interface
    pub fn ll(&mut self) -> &mut ll::DW1000<SPI, CS> {
        &mut self.ll
    }

    /// The configuration last applied with [`DW1000::configure`]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current system time
    pub fn sys_time(&mut self) -> Result<Instant, Error<SPI, CS>> {
        let value = self.ll.sys_time().read()?.value();
        Ok(Instant::wrapping(value))
    }

    /// Reads the 40 status bits
    pub fn read_status(&mut self) -> Result<Status, Error<SPI, CS>> {
        Ok(Status(self.ll.sys_status().read()?.value()))
    }

    /// Clears the status bits set in `mask`
    pub fn clear_irq(&mut self, mask: Status) -> Result<(), Error<SPI, CS>> {
        self.ll.sys_status().write(|w| w.value(mask.0))?;
        Ok(())
    }

    /// Routes the events in `mask` to the IRQ line
    pub fn enable_interrupts(&mut self, mask: Status) -> Result<(), Error<SPI, CS>> {
        self.ll.sys_mask().write(|w| w.value(mask.0 as u32))?;
        Ok(())
    }

    /// Writes `data` into the transmit buffer at `offset`
    pub fn write_tx_buffer(&mut self, data: &[u8], offset: usize) -> Result<(), Error<SPI, CS>> {
        check_buffer_range(offset, data.len())?;
        self.ll.write_tx_buffer(offset as u16, data)?;
        Ok(())
    }

    /// Fills `buffer` from the receive buffer, starting at `offset`
    pub fn read_rx_buffer(&mut self, buffer: &mut [u8], offset: usize) -> Result<(), Error<SPI, CS>> {
        check_buffer_range(offset, buffer.len())?;
        self.ll.read_rx_buffer(offset as u16, buffer)?;
        Ok(())
    }

    /// Puts the transceiver into IDLE, cancelling any pending operation
    ///
    /// Interrupts are masked while doing so, and all TX and RX events are
    /// cleared afterwards.
    pub fn force_trx_off(&mut self) -> Result<(), Error<SPI, CS>> {
        let mask = self.ll.sys_mask().read()?.value();
        self.ll.sys_mask().write(|w| w.value(0))?;
        self.ll.sys_ctrl().write(|w| w.trxoff(1))?;
        self.clear_irq(Status::ALL_TX | Status::ALL_RX_GOOD | Status::ALL_RX_ERR | Status::ALL_RX_TO)?;
        self.sync_double_rx_buffers()?;
        self.ll.sys_mask().write(|w| w.value(mask))?;
        Ok(())
    }
}

fn check_buffer_range<SPI, CS>(offset: usize, len: usize) -> Result<(), Error<SPI, CS>>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    if offset + len > ll::BUFFER_LEN {
        return Err(Error::BufferTooSmall {
            required_len: offset + len,
        });
    }
    Ok(())
}

/// Snapshot of SYS_STATUS, also used as an event mask
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(pub u64);

impl Status {
    /// Clock PLL locked
    pub const CPLOCK: Status = Status(1 << 1);
    /// Transmit frame begins
    pub const TXFRB: Status = Status(1 << 4);
    /// Transmit preamble sent
    pub const TXPRS: Status = Status(1 << 5);
    /// Transmit PHY header sent
    pub const TXPHS: Status = Status(1 << 6);
    /// Transmit frame sent
    pub const TXFRS: Status = Status(1 << 7);
    /// Preamble detected
    pub const RXPRD: Status = Status(1 << 8);
    /// SFD detected
    pub const RXSFDD: Status = Status(1 << 9);
    /// Leading edge detection done
    pub const LDEDONE: Status = Status(1 << 10);
    /// PHY header detected
    pub const RXPHD: Status = Status(1 << 11);
    /// PHY header error
    pub const RXPHE: Status = Status(1 << 12);
    /// Data frame ready
    pub const RXDFR: Status = Status(1 << 13);
    /// FCS good
    pub const RXFCG: Status = Status(1 << 14);
    /// FCS error
    pub const RXFCE: Status = Status(1 << 15);
    /// Reed-Solomon frame sync loss
    pub const RXRFSL: Status = Status(1 << 16);
    /// Frame wait timeout
    pub const RXRFTO: Status = Status(1 << 17);
    /// Leading edge detection error
    pub const LDEERR: Status = Status(1 << 18);
    /// Receiver overrun
    pub const RXOVRR: Status = Status(1 << 20);
    /// Preamble detection timeout
    pub const RXPTO: Status = Status(1 << 21);
    /// Woke up into INIT
    pub const SLP2INIT: Status = Status(1 << 23);
    /// SFD timeout
    pub const RXSFDTO: Status = Status(1 << 26);
    /// Delayed operation programmed in the past
    pub const HPDWARN: Status = Status(1 << 27);
    /// Frame rejected by filtering
    pub const AFFREJ: Status = Status(1 << 29);
    /// Transmitter power-up time error
    pub const TXPUTE: Status = Status(1 << 34);

    /// Every transmit event
    pub const ALL_TX: Status = Status(Self::TXFRB.0 | Self::TXPRS.0 | Self::TXPHS.0 | Self::TXFRS.0);
    /// Events of a successful reception
    pub const ALL_RX_GOOD: Status = Status(
        Self::RXPRD.0
            | Self::RXSFDD.0
            | Self::LDEDONE.0
            | Self::RXPHD.0
            | Self::RXDFR.0
            | Self::RXFCG.0,
    );
    /// Reception errors
    pub const ALL_RX_ERR: Status = Status(
        Self::RXPHE.0
            | Self::RXFCE.0
            | Self::RXRFSL.0
            | Self::RXSFDTO.0
            | Self::AFFREJ.0
            | Self::LDEERR.0
            | Self::RXOVRR.0,
    );
    /// Reception timeouts
    pub const ALL_RX_TO: Status = Status(Self::RXRFTO.0 | Self::RXPTO.0);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set
    pub fn intersects(self, other: Status) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}
