//! Radio configuration and the tuning tables that go with it
//!
//! The DW1000 needs a handful of registers programmed with values that depend
//! on the channel, pulse repetition frequency, data rate, preamble length and
//! PAC size. Those values come straight from the tables in the user manual and
//! are reproduced here unchanged; [`Config`] picks the right ones.

use num_enum::IntoPrimitive;

/// Radio configuration, applied with [`DW1000::configure`]
///
/// [`DW1000::configure`]: ../hl/struct.DW1000.html#method.configure
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Channel used for both directions
    pub channel: UwbChannel,
    /// Pulse repetition frequency
    pub prf: PulseRepetitionFrequency,
    /// Data rate of the payload
    pub bitrate: BitRate,
    /// Length of the transmitted preamble
    pub preamble_length: PreambleLength,
    /// Preamble acquisition chunk size of the receiver
    pub pac: PacSize,
    /// Preamble code used when transmitting
    pub tx_pcode: u8,
    /// Preamble code the receiver searches for
    pub rx_pcode: u8,
    /// Start of frame delimiter
    pub sfd_sequence: SfdSequence,
    /// SFD detection timeout in preamble symbols
    pub sfd_timeout: u16,
    /// Raw TX_POWER value. `None` keeps the value written by `init`.
    pub tx_power: Option<u32>,
    /// Drop frames that are neither broadcast nor addressed to us
    pub frame_filtering: bool,
}

impl Default for Config {
    fn default() -> Self {
        let preamble_length = PreambleLength::Symbols128;
        let pac = preamble_length.default_pac();
        Config {
            channel: UwbChannel::Channel5,
            prf: PulseRepetitionFrequency::Mhz64,
            bitrate: BitRate::Kbps6800,
            preamble_length,
            pac,
            tx_pcode: 9,
            rx_pcode: 9,
            sfd_sequence: SfdSequence::Ieee,
            sfd_timeout: default_sfd_timeout(preamble_length, SfdSequence::Ieee, pac),
            tx_power: None,
            frame_filtering: false,
        }
    }
}

impl Config {
    /// Checks the combination against the tables of the user manual
    pub fn is_valid(&self) -> bool {
        self.channel.supports_code(self.prf, self.tx_pcode)
            && self.channel.supports_code(self.prf, self.rx_pcode)
            && self.preamble_length.drx_tune1b(self.bitrate).is_some()
            && self.sfd_timeout > 0
    }

    /// LDE_REPC value for the receive preamble code
    pub fn lde_repc(&self) -> Option<u16> {
        let value = match self.rx_pcode {
            1 | 2 => 0x5998,
            3 | 8 => 0x51EA,
            4 => 0x428E,
            5 => 0x451E,
            6 => 0x2E14,
            7 => 0x8000,
            9 => 0x28F4,
            10 | 17 => 0x3332,
            11 | 13 | 21 => 0x3AE0,
            12 => 0x3D70,
            14 | 16 | 18 | 19 => 0x35C2,
            15 => 0x2B84,
            20 => 0x47AE,
            22 | 24 => 0x3850,
            23 => 0x30A2,
            _ => return None,
        };
        // The 110 kbps mode uses a scaled coefficient.
        Some(match self.bitrate {
            BitRate::Kbps110 => value >> 3,
            _ => value,
        })
    }
}

/// Recommended SFD timeout: preamble + 1 + SFD length - PAC
pub fn default_sfd_timeout(preamble: PreambleLength, sfd: SfdSequence, pac: PacSize) -> u16 {
    let sfd_len = match sfd {
        SfdSequence::Ieee => 8,
        SfdSequence::Decawave => 16,
    };
    preamble.symbols() + 1 + sfd_len - pac as u16
}

/// Payload data rate
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BitRate {
    /// 110 kbps
    Kbps110 = 0b00,
    /// 850 kbps
    Kbps850 = 0b01,
    /// 6.8 Mbps
    Kbps6800 = 0b10,
}

impl BitRate {
    /// DRX_TUNE0b, table 30
    pub fn drx_tune0b(self, sfd: SfdSequence) -> u16 {
        match (self, sfd) {
            (BitRate::Kbps110, SfdSequence::Ieee) => 0x000A,
            (BitRate::Kbps110, SfdSequence::Decawave) => 0x0016,
            (BitRate::Kbps850, SfdSequence::Ieee) => 0x0001,
            (BitRate::Kbps850, SfdSequence::Decawave) => 0x0006,
            (BitRate::Kbps6800, SfdSequence::Ieee) => 0x0001,
            (BitRate::Kbps6800, SfdSequence::Decawave) => 0x0002,
        }
    }
}

/// Pulse repetition frequency
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PulseRepetitionFrequency {
    /// 16 MHz
    Mhz16 = 0b01,
    /// 64 MHz
    Mhz64 = 0b10,
}

impl PulseRepetitionFrequency {
    /// DRX_TUNE1a, table 31
    pub fn drx_tune1a(self) -> u16 {
        match self {
            PulseRepetitionFrequency::Mhz16 => 0x0087,
            PulseRepetitionFrequency::Mhz64 => 0x008D,
        }
    }

    /// DRX_TUNE2, table 33
    pub fn drx_tune2(self, pac: PacSize) -> u32 {
        use PacSize::*;
        use PulseRepetitionFrequency::*;
        match (self, pac) {
            (Mhz16, Pac8) => 0x311A002D,
            (Mhz64, Pac8) => 0x313B006B,
            (Mhz16, Pac16) => 0x331A0052,
            (Mhz64, Pac16) => 0x333B00BE,
            (Mhz16, Pac32) => 0x351A009A,
            (Mhz64, Pac32) => 0x353B015E,
            (Mhz16, Pac64) => 0x371A011D,
            (Mhz64, Pac64) => 0x373B0296,
        }
    }

    /// AGC_TUNE1, table 24
    pub fn agc_tune1(self) -> u16 {
        match self {
            PulseRepetitionFrequency::Mhz16 => 0x8870,
            PulseRepetitionFrequency::Mhz64 => 0x889B,
        }
    }

    /// LDE_CFG2, table 50
    pub fn lde_cfg2(self) -> u16 {
        match self {
            PulseRepetitionFrequency::Mhz16 => 0x1607,
            PulseRepetitionFrequency::Mhz64 => 0x0607,
        }
    }
}

/// Preamble length in symbols
///
/// The discriminant is the TXPSR and PE bit pattern of TX_FCTRL (table 16).
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PreambleLength {
    /// 64 symbols, 6.8 Mbps only
    Symbols64 = 0b0100,
    /// 128 symbols
    Symbols128 = 0b0101,
    /// 256 symbols
    Symbols256 = 0b0110,
    /// 512 symbols
    Symbols512 = 0b0111,
    /// 1024 symbols
    Symbols1024 = 0b1000,
    /// 1536 symbols, 110 kbps only
    Symbols1536 = 0b1001,
    /// 2048 symbols, 110 kbps only
    Symbols2048 = 0b1010,
    /// 4096 symbols, 110 kbps only
    Symbols4096 = 0b1100,
}

impl PreambleLength {
    /// Number of preamble symbols
    pub fn symbols(self) -> u16 {
        match self {
            PreambleLength::Symbols64 => 64,
            PreambleLength::Symbols128 => 128,
            PreambleLength::Symbols256 => 256,
            PreambleLength::Symbols512 => 512,
            PreambleLength::Symbols1024 => 1024,
            PreambleLength::Symbols1536 => 1536,
            PreambleLength::Symbols2048 => 2048,
            PreambleLength::Symbols4096 => 4096,
        }
    }

    /// Recommended PAC size, table 6
    pub fn default_pac(self) -> PacSize {
        match self {
            PreambleLength::Symbols64 | PreambleLength::Symbols128 => PacSize::Pac8,
            PreambleLength::Symbols256 | PreambleLength::Symbols512 => PacSize::Pac16,
            PreambleLength::Symbols1024 => PacSize::Pac32,
            _ => PacSize::Pac64,
        }
    }

    /// DRX_TUNE1b, table 32. `None` for combinations the chip doesn't support.
    pub fn drx_tune1b(self, bitrate: BitRate) -> Option<u16> {
        use PreambleLength::*;
        match (self, bitrate) {
            (Symbols64, BitRate::Kbps6800) => Some(0x0010),
            (Symbols128 | Symbols256 | Symbols512 | Symbols1024, BitRate::Kbps6800) => Some(0x0020),
            (Symbols128 | Symbols256 | Symbols512 | Symbols1024, BitRate::Kbps850) => Some(0x0020),
            (Symbols1536 | Symbols2048 | Symbols4096, BitRate::Kbps110) => Some(0x0064),
            _ => None,
        }
    }

    /// DRX_TUNE4H, table 34
    pub fn drx_tune4h(self) -> u16 {
        match self {
            PreambleLength::Symbols64 => 0x0010,
            _ => 0x0028,
        }
    }
}

/// Preamble acquisition chunk size
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacSize {
    /// 8 symbols
    Pac8 = 8,
    /// 16 symbols
    Pac16 = 16,
    /// 32 symbols
    Pac32 = 32,
    /// 64 symbols
    Pac64 = 64,
}

/// Start of frame delimiter sequence
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SfdSequence {
    /// Standard IEEE 802.15.4 SFD
    Ieee,
    /// Decawave's longer, non-standard SFD
    Decawave,
}

/// UWB channel
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UwbChannel {
    /// 3494.4 MHz
    Channel1 = 1,
    /// 3993.6 MHz
    Channel2 = 2,
    /// 4492.8 MHz
    Channel3 = 3,
    /// 3993.6 MHz, wide band
    Channel4 = 4,
    /// 6489.6 MHz
    Channel5 = 5,
    /// 6489.6 MHz, wide band
    Channel7 = 7,
}

impl UwbChannel {
    /// Center frequency in Hz
    pub fn center_frequency_hz(self) -> f32 {
        match self {
            UwbChannel::Channel1 => 3494.4e6,
            UwbChannel::Channel2 | UwbChannel::Channel4 => 3993.6e6,
            UwbChannel::Channel3 => 4492.8e6,
            UwbChannel::Channel5 | UwbChannel::Channel7 => 6489.6e6,
        }
    }

    /// Whether `code` is a legal preamble code on this channel at `prf`
    pub fn supports_code(self, prf: PulseRepetitionFrequency, code: u8) -> bool {
        use UwbChannel::*;
        match prf {
            PulseRepetitionFrequency::Mhz16 => match self {
                Channel1 => code == 1 || code == 2,
                Channel2 | Channel5 => code == 3 || code == 4,
                Channel3 => code == 5 || code == 6,
                Channel4 | Channel7 => code == 7 || code == 8,
            },
            PulseRepetitionFrequency::Mhz64 => match self {
                Channel4 | Channel7 => (17..=20).contains(&code),
                _ => (9..=12).contains(&code),
            },
        }
    }

    /// RF_TXCTRL, table 38
    pub fn rf_txctrl(self) -> u32 {
        match self {
            UwbChannel::Channel1 => 0x00005C40,
            UwbChannel::Channel2 => 0x00045CA0,
            UwbChannel::Channel3 => 0x00086CC0,
            UwbChannel::Channel4 => 0x00045C80,
            UwbChannel::Channel5 => 0x001E3FE0,
            UwbChannel::Channel7 => 0x001E7DE0,
        }
    }

    /// TC_PGDELAY, table 40
    pub fn tc_pgdelay(self) -> u8 {
        match self {
            UwbChannel::Channel1 => 0xC9,
            UwbChannel::Channel2 => 0xC2,
            UwbChannel::Channel3 => 0xC5,
            UwbChannel::Channel4 => 0x95,
            UwbChannel::Channel5 => 0xC0,
            UwbChannel::Channel7 => 0x93,
        }
    }

    /// FS_PLLCFG, table 43
    pub fn fs_pllcfg(self) -> u32 {
        match self {
            UwbChannel::Channel1 => 0x09000407,
            UwbChannel::Channel2 | UwbChannel::Channel4 => 0x08400508,
            UwbChannel::Channel3 => 0x08401009,
            UwbChannel::Channel5 | UwbChannel::Channel7 => 0x0800041D,
        }
    }

    /// FS_PLLTUNE, table 44
    pub fn fs_plltune(self) -> u8 {
        match self {
            UwbChannel::Channel1 => 0x1E,
            UwbChannel::Channel2 | UwbChannel::Channel4 => 0x26,
            UwbChannel::Channel3 => 0x56,
            UwbChannel::Channel5 | UwbChannel::Channel7 => 0xBE,
        }
    }

    /// RF_RXCTRLH, table 37
    pub fn rf_rxctrlh(self) -> u8 {
        match self {
            UwbChannel::Channel4 | UwbChannel::Channel7 => 0xBC,
            _ => 0xD8,
        }
    }
}
