//! The radio as seen by the location protocol
//!
//! [`Radio`] is the small set of timed one-shot operations a location cell
//! needs. [`Dw1000Radio`] implements it on top of the DW1000 driver, using the
//! IRQ line as the completion signal, and tests implement it with simulated
//! participants.

use core::fmt;

use dw1000::{
    hl::{OnWake, Status, WakeTrigger},
    time::{Duration, Instant},
    DW1000,
};
use embedded_hal::{
    blocking::{delay::DelayMs, spi},
    digital::v2::{InputPin, OutputPin},
};

use crate::debug;

/// Failure of a radio operation
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum RadioError<E> {
    /// Nothing was received before the frame wait timeout or the deadline
    Timeout,
    /// A frame was detected but could not be received
    Rx,
    /// The scheduled time had already passed
    TxLate,
    /// The bus to the radio failed
    Bus(E),
}

// `E` is only `Debug` for some buses.
impl<E: fmt::Debug> fmt::Debug for RadioError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RadioError::Timeout => write!(f, "Timeout"),
            RadioError::Rx => write!(f, "Rx"),
            RadioError::TxLate => write!(f, "TxLate"),
            RadioError::Bus(error) => write!(f, "Bus({:?})", error),
        }
    }
}

#[cfg(feature = "defmt")]
impl<E> defmt::Format for RadioError<E> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            RadioError::Timeout => defmt::write!(f, "Timeout"),
            RadioError::Rx => defmt::write!(f, "Rx"),
            RadioError::TxLate => defmt::write!(f, "TxLate"),
            RadioError::Bus(_) => defmt::write!(f, "Bus"),
        }
    }
}

/// A frame that has been received
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RxInfo {
    pub len: usize,
    /// RMARKER at the antenna
    pub timestamp: Instant,
}

/// A completed operation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trx {
    /// Transmit RMARKER at the antenna
    Sent(Instant),
    Received(RxInfo),
}

/// Timed one-shot radio operations
///
/// At most one operation is outstanding at a time. Scheduled times are raw
/// DW1000 system times, so their low 9 bits are ignored.
pub trait Radio {
    type Error;

    fn sys_time(&mut self) -> Result<Instant, RadioError<Self::Error>>;

    /// Delay between the scheduled transmit time and the RMARKER leaving
    /// the antenna
    fn tx_antenna_delay(&self) -> Duration;

    fn write_tx(&mut self, data: &[u8], offset: usize) -> Result<(), RadioError<Self::Error>>;

    /// Transmits the first `len` bytes of the transmit buffer at `at`
    fn schedule_tx(&mut self, at: Instant, len: usize) -> Result<(), RadioError<Self::Error>>;

    /// Switches the receiver on at `at` for at most `timeout`
    fn schedule_rx(&mut self, at: Instant, timeout: Duration) -> Result<(), RadioError<Self::Error>>;

    /// Checks whether the outstanding operation has finished
    fn poll(&mut self) -> nb::Result<Trx, RadioError<Self::Error>>;

    /// Reads from the last received frame, starting at `offset`
    fn read_rx(&mut self, buf: &mut [u8], offset: usize) -> Result<(), RadioError<Self::Error>>;

    /// Clock offset of the sender of the last received frame
    ///
    /// A duration the sender measured with its own clock is `1 - ratio`
    /// times that duration in local ticks.
    fn clock_offset_ratio(&mut self) -> Result<f32, RadioError<Self::Error>>;

    /// Cancels the outstanding operation and resets the receiver
    fn abort(&mut self) -> Result<(), RadioError<Self::Error>>;

    fn sleep(&mut self) -> Result<(), RadioError<Self::Error>>;

    fn wake(&mut self) -> Result<(), RadioError<Self::Error>>;
}

/// Instant the RMARKER of a frame scheduled at `at` leaves the antenna
pub fn tx_rmarker(at: Instant, antenna_delay: Duration) -> Instant {
    at.scheduled() + antenna_delay
}

/// Busy-waits for the outstanding operation, giving up at `deadline`
///
/// The radio is aborted after a failure or a missed deadline, so it is ready
/// for the next operation either way.
pub fn wait_for_trx<R: Radio>(radio: &mut R, deadline: Instant) -> Result<Trx, RadioError<R::Error>> {
    loop {
        match radio.poll() {
            Ok(trx) => return Ok(trx),
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(error)) => {
                radio.abort()?;
                return Err(error);
            }
        }

        if radio.sys_time()?.signed_diff(deadline) > 0 {
            radio.abort()?;
            return Err(RadioError::Timeout);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pending {
    Tx,
    Rx,
}

/// [`Radio`] on a DW1000 whose IRQ line is wired to `IRQ`
///
/// The IRQ line signals TX done, RX done and every RX error, so `poll` only
/// touches the bus once the line is high.
pub struct Dw1000Radio<SPI, CS, IRQ, D> {
    dw1000: DW1000<SPI, CS>,
    irq: IRQ,
    delay: D,
    antenna_delay: Duration,
    pending: Option<Pending>,
}

impl<SPI, CS, IRQ, D> Dw1000Radio<SPI, CS, IRQ, D>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
    IRQ: InputPin,
    D: DelayMs<u8>,
{
    /// Takes over an initialized and configured driver
    pub fn new(mut dw1000: DW1000<SPI, CS>, irq: IRQ, delay: D) -> Result<Self, dw1000::Error<SPI, CS>> {
        dw1000.enable_interrupts(Status::TXFRS | Status::RXDFR | Status::ALL_RX_ERR | Status::ALL_RX_TO)?;
        dw1000.config_sleep(
            OnWake::RESTORE_CONFIG | OnWake::LOAD_LDE | OnWake::LOAD_LDOTUNE,
            WakeTrigger::CHIP_SELECT,
        )?;
        let antenna_delay = Duration::new(dw1000.tx_antenna_delay() as u64).unwrap_or(Duration::from_nanos(0));
        Ok(Dw1000Radio {
            dw1000,
            irq,
            delay,
            antenna_delay,
            pending: None,
        })
    }

    pub fn dw1000(&mut self) -> &mut DW1000<SPI, CS> {
        &mut self.dw1000
    }

    pub fn free(self) -> (DW1000<SPI, CS>, IRQ, D) {
        (self.dw1000, self.irq, self.delay)
    }
}

fn classify<SPI, CS>(error: dw1000::Error<SPI, CS>) -> RadioError<dw1000::Error<SPI, CS>>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    use dw1000::Error::*;

    match error {
        DelayedSendTooLate | DelayedSendPowerUpWarning | DelayedReceiveTooLate => RadioError::TxLate,
        ref error if error.is_timeout() => RadioError::Timeout,
        Fcs | Phy | ReedSolomon | Overrun | FrameFilteringRejection | LdeError => RadioError::Rx,
        error => RadioError::Bus(error),
    }
}

impl<SPI, CS, IRQ, D> Radio for Dw1000Radio<SPI, CS, IRQ, D>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
    IRQ: InputPin,
    D: DelayMs<u8>,
{
    type Error = dw1000::Error<SPI, CS>;

    fn sys_time(&mut self) -> Result<Instant, RadioError<Self::Error>> {
        self.dw1000.sys_time().map_err(classify)
    }

    fn tx_antenna_delay(&self) -> Duration {
        self.antenna_delay
    }

    fn write_tx(&mut self, data: &[u8], offset: usize) -> Result<(), RadioError<Self::Error>> {
        self.dw1000.write_tx_buffer(data, offset).map_err(classify)
    }

    fn schedule_tx(&mut self, at: Instant, len: usize) -> Result<(), RadioError<Self::Error>> {
        self.pending = None;
        self.dw1000.schedule_tx_at(at, len, false).map_err(classify)?;
        self.pending = Some(Pending::Tx);
        Ok(())
    }

    fn schedule_rx(&mut self, at: Instant, timeout: Duration) -> Result<(), RadioError<Self::Error>> {
        self.pending = None;
        self.dw1000.schedule_rx_at(at, Some(timeout)).map_err(classify)?;
        self.pending = Some(Pending::Rx);
        Ok(())
    }

    fn poll(&mut self) -> nb::Result<Trx, RadioError<Self::Error>> {
        let pending = match self.pending {
            Some(pending) => pending,
            None => return Err(nb::Error::Other(RadioError::Timeout)),
        };
        // A pin that can't be read falls back to polling the status register.
        if let Ok(false) = self.irq.is_high() {
            return Err(nb::Error::WouldBlock);
        }

        let result = match pending {
            Pending::Tx => self.dw1000.poll_tx().map(Trx::Sent),
            Pending::Rx => self.dw1000.poll_rx().map(|info| {
                Trx::Received(RxInfo {
                    len: info.len,
                    timestamp: info.timestamp,
                })
            }),
        };
        match result {
            Ok(trx) => {
                self.pending = None;
                Ok(trx)
            }
            Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(nb::Error::Other(error)) => {
                self.pending = None;
                Err(nb::Error::Other(classify(error)))
            }
        }
    }

    fn read_rx(&mut self, buf: &mut [u8], offset: usize) -> Result<(), RadioError<Self::Error>> {
        self.dw1000.read_rx_buffer(buf, offset).map_err(classify)
    }

    fn clock_offset_ratio(&mut self) -> Result<f32, RadioError<Self::Error>> {
        Ok(self.dw1000.rx_clock_offset_ppm().map_err(classify)? * 1.0e-6)
    }

    fn abort(&mut self) -> Result<(), RadioError<Self::Error>> {
        if self.pending.take().is_some() {
            debug!("radio aborted");
        }
        self.dw1000.force_trx_off().map_err(classify)?;
        self.dw1000.rx_reset().map_err(classify)
    }

    fn sleep(&mut self) -> Result<(), RadioError<Self::Error>> {
        self.pending = None;
        self.dw1000.enter_sleep().map_err(classify)
    }

    fn wake(&mut self) -> Result<(), RadioError<Self::Error>> {
        self.dw1000.wake_by_cs(&mut self.delay).map_err(classify)
    }
}
