use embedded_hal::{
    blocking::{delay::DelayMs, spi},
    digital::v2::OutputPin,
};

use crate::{
    configs::{BitRate, Config, SfdSequence},
    Error, DW1000,
};

/// OTP word holding the LDO tuning value, low 32 bits
const OTP_LDOTUNE_LOW: u16 = 0x004;
/// OTP word holding the LDO tuning value, high 8 bits
const OTP_LDOTUNE_HIGH: u16 = 0x005;
/// OTP word with the antenna delays: 16 MHz PRF low, 64 MHz PRF high
const OTP_ANTENNA_DELAY: u16 = 0x01C;
/// OTP word with the crystal trim (bits 0..4) and OTP revision (bits 8..15)
const OTP_XTAL_TRIM: u16 = 0x01E;

/// Antenna delay used when OTP holds no calibration
pub const DEFAULT_ANTENNA_DELAY: u16 = 16436;

/// Crystal trim used when OTP holds no calibration (middle of the range)
const DEFAULT_XTAL_TRIM: u8 = 0x10;

/// Factory calibration read from OTP during [`DW1000::init`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtpCalibration {
    /// LDO tuning, zero if not calibrated
    pub ldotune: u64,
    /// Antenna delay for 16 MHz PRF
    pub antenna_delay_16: u16,
    /// Antenna delay for 64 MHz PRF
    pub antenna_delay_64: u16,
    /// Crystal trim, zero if not calibrated
    pub xtal_trim: u8,
    /// OTP layout revision
    pub revision: u8,
}

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Resets the chip and loads calibration and microcode
    ///
    /// Performs a soft reset, applies the default tuning the user manual
    /// (section 2.5.5) asks for, loads LDOTUNE, crystal trim and antenna delay
    /// from OTP, loads the LDE microcode and finally applies the current
    /// [`Config`].
    pub fn init<D: DelayMs<u8>>(&mut self, delay: &mut D) -> Result<OtpCalibration, Error<SPI, CS>> {
        if self.ll.dev_id().read()?.ridtag() != 0xDECA {
            return Err(Error::StillAsleep);
        }

        self.soft_reset(delay)?;

        // OTP and LDE loading need the slow crystal clock.
        self.ll.pmsc_ctrl0().modify(|_, w| w.sysclks(0b01))?;

        self.ll.lde_cfg1().modify(|_, w| w.ntm(0xD))?;
        self.ll.tx_power().write(|w| w.value(0x0E082848))?;
        self.ll.rf_txctrl().modify(|_, w| w.txmtune(0b1111).txmq(0b111))?;

        let mut otp = OtpCalibration::default();

        let ldotune_low = self.read_otp(OTP_LDOTUNE_LOW)?;
        if ldotune_low != 0 {
            let ldotune_high = self.read_otp(OTP_LDOTUNE_HIGH)? & 0xff;
            otp.ldotune = ldotune_low as u64 | (ldotune_high as u64) << 32;
            self.ll.ldotune().write(|w| w.value(otp.ldotune))?;
        }

        let trim = self.read_otp(OTP_XTAL_TRIM)?;
        otp.xtal_trim = (trim & 0x1f) as u8;
        otp.revision = (trim >> 8) as u8;
        let xtal_trim = if otp.xtal_trim == 0 {
            DEFAULT_XTAL_TRIM
        } else {
            otp.xtal_trim
        };
        self.ll.fs_xtalt().write(|w| w.xtalt(xtal_trim).reserved(0b011))?;

        let delays = self.read_otp(OTP_ANTENNA_DELAY)?;
        otp.antenna_delay_16 = delays as u16;
        otp.antenna_delay_64 = (delays >> 16) as u16;

        // LDELOAD, section 2.5.5.10
        self.ll
            .pmsc_ctrl0()
            .modify(|r, w| w.raw_value(r.raw_value() | 0x0301))?;
        self.ll.otp_ctrl().write(|w| w.ldeload(0b1))?;
        delay.delay_ms(1);
        self.ll
            .pmsc_ctrl0()
            .modify(|r, w| w.raw_value(r.raw_value() & !0x0101))?;

        self.ll.pmsc_ctrl0().modify(|_, w| w.sysclks(0b00))?;

        let config = self.config;
        self.configure(config)?;

        let antenna_delay = match config.prf {
            crate::configs::PulseRepetitionFrequency::Mhz16 => otp.antenna_delay_16,
            crate::configs::PulseRepetitionFrequency::Mhz64 => otp.antenna_delay_64,
        };
        let antenna_delay = if antenna_delay == 0 {
            DEFAULT_ANTENNA_DELAY
        } else {
            antenna_delay
        };
        self.set_antenna_delay(antenna_delay, antenna_delay)?;

        Ok(otp)
    }

    fn soft_reset<D: DelayMs<u8>>(&mut self, delay: &mut D) -> Result<(), Error<SPI, CS>> {
        self.ll.pmsc_ctrl0().modify(|_, w| w.sysclks(0b01))?;
        self.ll.pmsc_ctrl1().write(|w| w)?;
        // Clear the always-on configuration so the reset isn't undone on wake-up.
        self.ll.aon_wcfg().write(|w| w)?;
        self.ll.aon_cfg0().write(|w| w)?;
        self.ll.aon_ctrl().write(|w| w)?;
        self.ll.aon_ctrl().write(|w| w.save(1))?;

        self.ll.pmsc_ctrl0().modify(|_, w| w.softreset(0b0000))?;
        delay.delay_ms(1);
        self.ll.pmsc_ctrl0().modify(|_, w| w.softreset(0b1111))?;
        Ok(())
    }

    /// Applies a radio configuration
    ///
    /// Returns `InvalidConfiguration` for combinations the user manual doesn't
    /// list, leaving the chip unchanged.
    pub fn configure(&mut self, config: Config) -> Result<(), Error<SPI, CS>> {
        if !config.is_valid() {
            return Err(Error::InvalidConfiguration);
        }
        let drx_tune1b = config
            .preamble_length
            .drx_tune1b(config.bitrate)
            .ok_or(Error::InvalidConfiguration)?;
        let lde_repc = config.lde_repc().ok_or(Error::InvalidConfiguration)?;

        let filtering = config.frame_filtering as u8;
        self.ll.sys_cfg().modify(|_, w| {
            w.ffen(filtering)
                .ffab(filtering)
                .ffad(filtering)
                .hirq_pol(1)
                .dis_drxb(1)
                .phr_mode(0b00)
                .rxm110k((config.bitrate == BitRate::Kbps110) as u8)
        })?;

        let decawave_sfd = (config.sfd_sequence == SfdSequence::Decawave) as u8;
        self.ll.chan_ctrl().write(|w| {
            w.tx_chan(config.channel.into())
                .rx_chan(config.channel.into())
                .rxprf(config.prf.into())
                .dwsfd(decawave_sfd)
                .tnssfd(0)
                .rnssfd(0)
                .tx_pcode(config.tx_pcode)
                .rx_pcode(config.rx_pcode)
        })?;

        self.ll.tx_fctrl().modify(|_, w| {
            let preamble: u8 = config.preamble_length.into();
            w.txbr(config.bitrate.into())
                .txprf(config.prf.into())
                .txpsr(preamble >> 2)
                .pe(preamble & 0b11)
        })?;

        self.ll.agc_tune1().write(|w| w.value(config.prf.agc_tune1()))?;
        self.ll.agc_tune2().write(|w| w.value(0x2502A907))?;
        self.ll
            .drx_tune0b()
            .write(|w| w.value(config.bitrate.drx_tune0b(config.sfd_sequence)))?;
        self.ll.drx_tune1a().write(|w| w.value(config.prf.drx_tune1a()))?;
        self.ll.drx_tune1b().write(|w| w.value(drx_tune1b))?;
        self.ll
            .drx_tune2()
            .write(|w| w.value(config.prf.drx_tune2(config.pac)))?;
        self.ll
            .drx_tune4h()
            .write(|w| w.value(config.preamble_length.drx_tune4h()))?;
        self.ll.drx_sfdtoc().write(|w| w.count(config.sfd_timeout))?;

        self.ll.lde_cfg2().write(|w| w.value(config.prf.lde_cfg2()))?;
        self.ll.lde_repc().write(|w| w.value(lde_repc))?;

        self.ll.rf_txctrl().write(|w| w.value(config.channel.rf_txctrl()))?;
        self.ll.rf_rxctrlh().write(|w| w.value(config.channel.rf_rxctrlh()))?;
        self.ll.tc_pgdelay().write(|w| w.value(config.channel.tc_pgdelay()))?;
        self.ll.fs_pllcfg().write(|w| w.value(config.channel.fs_pllcfg()))?;
        self.ll.fs_plltune().write(|w| w.value(config.channel.fs_plltune()))?;

        if let Some(power) = config.tx_power {
            self.ll.tx_power().write(|w| w.value(power))?;
        }

        self.config = config;
        Ok(())
    }

    /// Programs the antenna delays, in system time ticks
    ///
    /// The transmit delay is added to TX timestamps and the receive delay is
    /// subtracted from RX timestamps by the chip.
    pub fn set_antenna_delay(&mut self, tx: u16, rx: u16) -> Result<(), Error<SPI, CS>> {
        self.ll.tx_antd().write(|w| w.value(tx))?;
        self.ll.lde_rxantd().write(|w| w.value(rx))?;
        self.tx_antenna_delay = tx;
        self.rx_antenna_delay = rx;
        Ok(())
    }

    /// The programmed transmit antenna delay
    pub fn tx_antenna_delay(&self) -> u16 {
        self.tx_antenna_delay
    }

    /// Reads a 32-bit word from OTP memory
    pub fn read_otp(&mut self, address: u16) -> Result<u32, Error<SPI, CS>> {
        self.ll.otp_addr().write(|w| w.value(address))?;
        self.ll.otp_ctrl().write(|w| w.otprden(0b1).otpread(0b1))?;
        self.ll.otp_ctrl().write(|w| w.otprden(0b1))?;
        let value = self.ll.otp_rdat().read()?.value();
        self.ll.otp_ctrl().write(|w| w)?;
        Ok(value)
    }
}
