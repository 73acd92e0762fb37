use embedded_hal::{blocking::spi, digital::v2::OutputPin};

use crate::{hl::Status, time::Instant, Error, DW1000};

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Transmits the first `frame_len` bytes of the transmit buffer at `at`
    ///
    /// The low 9 bits of `at` are ignored by the chip, and the RMARKER leaves
    /// the antenna one transmit antenna delay later. With `expect_rx` the
    /// receiver is switched on right after the frame has been sent.
    ///
    /// If `at` has already passed the transmission is cancelled and
    /// `DelayedSendTooLate` is returned.
    pub fn schedule_tx_at(
        &mut self,
        at: Instant,
        frame_len: usize,
        expect_rx: bool,
    ) -> Result<(), Error<SPI, CS>> {
        // The chip appends a 2 byte FCS.
        let len = frame_len + 2;
        if len > 1023 {
            return Err(Error::BufferTooSmall { required_len: len });
        }

        self.ll.evc_ctrl().write(|w| w.evc_clr(1))?;
        self.ll.evc_ctrl().write(|w| w.evc_en(1))?;

        self.ll.dx_time().write(|w| w.value(at.value()))?;
        self.ll.tx_fctrl().modify(|_, w| {
            w.tflen((len & 0x7f) as u8)
                .tfle((len >> 7) as u8)
                .txboffs(0)
        })?;
        self.ll
            .sys_ctrl()
            .write(|w| w.txdlys(1).txstrt(1).wait4resp(expect_rx as u8))?;

        let status = self.read_status()?;
        if status.contains(Status::HPDWARN) {
            self.force_trx_off()?;
            return Err(Error::DelayedSendTooLate);
        }
        if status.contains(Status::TXPUTE) {
            self.force_trx_off()?;
            return Err(Error::DelayedSendPowerUpWarning);
        }
        Ok(())
    }

    /// Checks whether the scheduled frame has gone out
    ///
    /// Returns the transmit RMARKER timestamp once it has. Late transmits
    /// that slipped past the warning check in [`DW1000::schedule_tx_at`] are
    /// caught here through the event counters.
    pub fn poll_tx(&mut self) -> nb::Result<Instant, Error<SPI, CS>> {
        let status = self.read_status().map_err(nb::Error::Other)?;
        if !status.contains(Status::TXFRS) {
            return Err(nb::Error::WouldBlock);
        }

        self.clear_irq(Status::ALL_TX).map_err(nb::Error::Other)?;

        let late = self
            .ll
            .evc_hpw()
            .read()
            .map_err(|error| nb::Error::Other(Error::Spi(error)))?
            .value();
        if late != 0 {
            return Err(nb::Error::Other(Error::DelayedSendTooLate));
        }

        self.read_rmarker_tx_timestamp().map_err(nb::Error::Other)
    }

    /// Timestamp of the last transmitted RMARKER
    ///
    /// TX_STAMP already includes the programmed transmit antenna delay, so this
    /// is the instant the marker left the antenna.
    pub fn read_rmarker_tx_timestamp(&mut self) -> Result<Instant, Error<SPI, CS>> {
        let stamp = self.ll.tx_time().read()?.tx_stamp();
        Ok(Instant::wrapping(stamp))
    }
}
