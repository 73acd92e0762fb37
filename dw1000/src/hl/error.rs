use core::fmt;

use embedded_hal::{blocking::spi, digital::v2::OutputPin};

use crate::ll;

/// An error reported by the high-level driver
pub enum Error<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Error occured while using SPI bus
    Spi(ll::Error<SPI, CS>),

    /// Receiver FCS error
    Fcs,

    /// PHY header error
    Phy,

    /// Access beyond the end of a data buffer
    BufferTooSmall {
        /// Length the access would have needed
        required_len: usize,
    },

    /// Receiver Reed Solomon Frame Sync Loss
    ReedSolomon,

    /// Receiver Frame Wait Timeout
    FrameWaitTimeout,

    /// Receiver Overrun
    Overrun,

    /// Preamble Detection Timeout
    PreambleDetectionTimeout,

    /// Receiver SFD Timeout
    SfdTimeout,

    /// Frame was rejected by frame filtering
    FrameFilteringRejection,

    /// Leading edge detection failed, the receive timestamp is unusable
    LdeError,

    /// The delayed transmit time had already passed when it was programmed
    ///
    /// The transmission was cancelled.
    DelayedSendTooLate,

    /// Transmitter could not power up in time for the delayed send
    DelayedSendPowerUpWarning,

    /// The delayed receive time had already passed when it was programmed
    DelayedReceiveTooLate,

    /// The configuration was not valid
    InvalidConfiguration,

    /// The chip did not answer after a wake-up attempt
    StillAsleep,
}

impl<SPI, CS> From<ll::Error<SPI, CS>> for Error<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    fn from(error: ll::Error<SPI, CS>) -> Self {
        Error::Spi(error)
    }
}

// We can't derive this implementation, as `Debug` is only implemented
// conditionally for `ll::Error`.
impl<SPI, CS> fmt::Debug for Error<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    <SPI as spi::Transfer<u8>>::Error: fmt::Debug,
    <SPI as spi::Write<u8>>::Error: fmt::Debug,
    CS: OutputPin,
    <CS as OutputPin>::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Spi(error) => write!(f, "Spi({:?})", error),
            Error::Fcs => write!(f, "Fcs"),
            Error::Phy => write!(f, "Phy"),
            Error::BufferTooSmall { required_len } => {
                write!(f, "BufferTooSmall {{ required_len: {:?} }}", required_len)
            }
            Error::ReedSolomon => write!(f, "ReedSolomon"),
            Error::FrameWaitTimeout => write!(f, "FrameWaitTimeout"),
            Error::Overrun => write!(f, "Overrun"),
            Error::PreambleDetectionTimeout => write!(f, "PreambleDetectionTimeout"),
            Error::SfdTimeout => write!(f, "SfdTimeout"),
            Error::FrameFilteringRejection => write!(f, "FrameFilteringRejection"),
            Error::LdeError => write!(f, "LdeError"),
            Error::DelayedSendTooLate => write!(f, "DelayedSendTooLate"),
            Error::DelayedSendPowerUpWarning => write!(f, "DelayedSendPowerUpWarning"),
            Error::DelayedReceiveTooLate => write!(f, "DelayedReceiveTooLate"),
            Error::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            Error::StillAsleep => write!(f, "StillAsleep"),
        }
    }
}

impl<SPI, CS> Error<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Whether the receiver gave up waiting rather than failing on a frame
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::FrameWaitTimeout | Error::PreambleDetectionTimeout | Error::SfdTimeout
        )
    }
}
