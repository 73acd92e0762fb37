use embedded_hal::{blocking::spi, digital::v2::OutputPin};

use crate::{
    configs::BitRate,
    hl::Status,
    time::{Duration, Instant},
    Error, DW1000,
};

/// Carrier integrator to Hz at 850 kbps and 6.8 Mbps: 998.4 MHz / 2 / 1024 / 2^17
const FREQ_OFFSET_MULTIPLIER: f32 = 998.4e6 / 2.0 / 1024.0 / 131072.0;

/// Carrier integrator to Hz at 110 kbps
const FREQ_OFFSET_MULTIPLIER_110K: f32 = 998.4e6 / 2.0 / 8192.0 / 131072.0;

/// A frame sitting in the receive buffer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxInfo {
    /// Length without the FCS
    pub len: usize,
    /// RMARKER arrival time
    pub timestamp: Instant,
}

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Enables the receiver at `at`
    ///
    /// With a `timeout` the receiver gives up (`FrameWaitTimeout`) if no frame
    /// has arrived that long after being enabled. The timeout resolution is
    /// 512 / 499.2 MHz, about 1.026 µs.
    pub fn schedule_rx_at(&mut self, at: Instant, timeout: Option<Duration>) -> Result<(), Error<SPI, CS>> {
        match timeout {
            Some(timeout) => {
                let units = (timeout.as_micros() * 39 / 40).max(1).min(0xffff) as u16;
                self.ll.rx_fwto().write(|w| w.value(units))?;
                self.ll.sys_cfg().modify(|_, w| w.rxwtoe(1))?;
            }
            None => {
                self.ll.sys_cfg().modify(|_, w| w.rxwtoe(0))?;
            }
        }

        self.ll.dx_time().write(|w| w.value(at.value()))?;
        self.ll.sys_ctrl().write(|w| w.rxdlye(1).rxenab(1))?;

        if self.read_status()?.contains(Status::HPDWARN) {
            self.force_trx_off()?;
            return Err(Error::DelayedReceiveTooLate);
        }
        Ok(())
    }

    /// Checks whether the receive operation has finished
    ///
    /// Error and timeout events are cleared and reported as the matching
    /// `Error` variant; the receiver is left off.
    pub fn poll_rx(&mut self) -> nb::Result<RxInfo, Error<SPI, CS>> {
        let status = self.read_status().map_err(nb::Error::Other)?;

        let error = if status.contains(Status::RXPHE) {
            Some(Error::Phy)
        } else if status.contains(Status::RXFCE) {
            Some(Error::Fcs)
        } else if status.contains(Status::RXRFSL) {
            Some(Error::ReedSolomon)
        } else if status.contains(Status::RXRFTO) {
            Some(Error::FrameWaitTimeout)
        } else if status.contains(Status::RXOVRR) {
            Some(Error::Overrun)
        } else if status.contains(Status::RXPTO) {
            Some(Error::PreambleDetectionTimeout)
        } else if status.contains(Status::RXSFDTO) {
            Some(Error::SfdTimeout)
        } else if status.contains(Status::AFFREJ) {
            Some(Error::FrameFilteringRejection)
        } else if status.contains(Status::LDEERR) {
            Some(Error::LdeError)
        } else {
            None
        };
        if let Some(error) = error {
            self.clear_irq(Status::ALL_RX_ERR | Status::ALL_RX_TO)
                .map_err(nb::Error::Other)?;
            return Err(nb::Error::Other(error));
        }

        if !status.contains(Status::RXDFR) || !status.contains(Status::LDEDONE) {
            return Err(nb::Error::WouldBlock);
        }

        let timestamp = self.read_rmarker_rx_timestamp().map_err(nb::Error::Other)?;
        let len = self.rx_frame_length().map_err(nb::Error::Other)?;
        self.clear_irq(Status::ALL_RX_GOOD).map_err(nb::Error::Other)?;

        Ok(RxInfo { len, timestamp })
    }

    /// Length of the received frame, without the FCS
    pub fn rx_frame_length(&mut self) -> Result<usize, Error<SPI, CS>> {
        let finfo = self.ll.rx_finfo().read()?;
        let len = finfo.rxflen() as usize | (finfo.rxfle() as usize) << 7;
        Ok(len.saturating_sub(2))
    }

    /// Timestamp of the last received RMARKER
    ///
    /// The chip subtracts the receive antenna delay from the raw value, so
    /// this is the instant the marker reached the antenna.
    pub fn read_rmarker_rx_timestamp(&mut self) -> Result<Instant, Error<SPI, CS>> {
        let stamp = self.ll.rx_time().read()?.rx_stamp();
        Ok(Instant::wrapping(stamp))
    }

    /// Resets the receiver after an error, user manual section 4.1.6
    pub fn rx_reset(&mut self) -> Result<(), Error<SPI, CS>> {
        self.ll.pmsc_ctrl0().modify(|_, w| w.softreset(0b1110))?;
        self.ll.pmsc_ctrl0().modify(|_, w| w.softreset(0b1111))?;
        Ok(())
    }

    /// Aligns the host side receive buffer pointer with the IC side one
    pub fn sync_double_rx_buffers(&mut self) -> Result<(), Error<SPI, CS>> {
        let status = self.ll.sys_status().read()?;
        if status.icrbp() != status.hsrbp() {
            self.ll.sys_ctrl().write(|w| w.hrbpt(1))?;
        }
        Ok(())
    }

    /// Carrier frequency offset of the last received frame, in Hz
    ///
    /// Positive when our clock runs fast relative to the remote transmitter.
    pub fn rx_clock_offset_hz(&mut self) -> Result<f32, Error<SPI, CS>> {
        let raw = self.ll.drx_car_int().read()?.value();
        // 21-bit two's complement
        let value = ((raw << 11) as i32) >> 11;
        let multiplier = match self.config.bitrate {
            BitRate::Kbps110 => FREQ_OFFSET_MULTIPLIER_110K,
            _ => FREQ_OFFSET_MULTIPLIER,
        };
        Ok(value as f32 * multiplier)
    }

    /// Offset of the remote clock in parts per million
    ///
    /// Multiply a duration measured by the remote with `1 - ppm * 1e-6` to get
    /// the same duration in local ticks.
    pub fn rx_clock_offset_ppm(&mut self) -> Result<f32, Error<SPI, CS>> {
        let hz = self.rx_clock_offset_hz()?;
        Ok(hz * -1.0e6 / self.config.channel.center_frequency_hz())
    }
}
