use embedded_hal::{
    blocking::{delay::DelayMs, spi},
    digital::v2::OutputPin,
};

use crate::{hl::Status, Error, DW1000};

/// Actions the chip performs when it wakes up (AON_WCFG bits)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OnWake(pub u16);

impl OnWake {
    /// Sample temperature and battery voltage
    pub const RUN_ADC: OnWake = OnWake(1 << 0);
    /// Switch the receiver on
    pub const RX: OnWake = OnWake(1 << 1);
    /// Reload the EUI from OTP
    pub const LOAD_EUI: OnWake = OnWake(1 << 3);
    /// Restore the configuration saved before sleeping
    pub const RESTORE_CONFIG: OnWake = OnWake(1 << 6);
    /// Reload the LDE microcode
    pub const LOAD_LDE: OnWake = OnWake(1 << 11);
    /// Reload LDOTUNE from OTP
    pub const LOAD_LDOTUNE: OnWake = OnWake(1 << 12);
}

impl core::ops::BitOr for OnWake {
    type Output = OnWake;

    fn bitor(self, rhs: OnWake) -> OnWake {
        OnWake(self.0 | rhs.0)
    }
}

/// Events that end sleep (AON_CFG0 bits)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WakeTrigger(pub u8);

impl WakeTrigger {
    /// The WAKEUP pin
    pub const PIN: WakeTrigger = WakeTrigger(1 << 1);
    /// Chip select held low
    pub const CHIP_SELECT: WakeTrigger = WakeTrigger(1 << 2);
    /// The sleep counter
    pub const COUNTER: WakeTrigger = WakeTrigger(1 << 3);
}

impl core::ops::BitOr for WakeTrigger {
    type Output = WakeTrigger;

    fn bitor(self, rhs: WakeTrigger) -> WakeTrigger {
        WakeTrigger(self.0 | rhs.0)
    }
}

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Sets what happens on wake-up and what wakes the chip
    pub fn config_sleep(&mut self, on_wake: OnWake, wake: WakeTrigger) -> Result<(), Error<SPI, CS>> {
        self.ll.aon_wcfg().write(|w| w.value(on_wake.0))?;
        self.ll.aon_cfg0().write(|w| {
            w.sleep_en(1)
                .wake_pin((wake.0 & WakeTrigger::PIN.0 != 0) as u8)
                .wake_spi((wake.0 & WakeTrigger::CHIP_SELECT.0 != 0) as u8)
                .wake_cnt((wake.0 & WakeTrigger::COUNTER.0 != 0) as u8)
        })?;
        Ok(())
    }

    /// Saves the configuration to always-on memory and enters sleep
    pub fn enter_sleep(&mut self) -> Result<(), Error<SPI, CS>> {
        self.ll.aon_ctrl().write(|w| w)?;
        self.ll.aon_ctrl().write(|w| w.save(1))?;
        Ok(())
    }

    /// Wakes the chip by holding chip select low
    ///
    /// Waits for the crystal to settle, checks that the chip answers and
    /// restores the antenna delays, which aren't kept across sleep.
    pub fn wake_by_cs<D: DelayMs<u8>>(&mut self, delay: &mut D) -> Result<(), Error<SPI, CS>> {
        self.ll.assert_cs_low()?;
        delay.delay_ms(1);
        self.ll.assert_cs_high()?;
        delay.delay_ms(5);

        if self.ll.dev_id().read()?.ridtag() != 0xDECA {
            return Err(Error::StillAsleep);
        }

        self.clear_irq(Status::SLP2INIT | Status::CPLOCK)?;
        let (tx, rx) = (self.tx_antenna_delay, self.rx_antenna_delay);
        self.set_antenna_delay(tx, rx)
    }
}
