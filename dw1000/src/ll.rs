//! Register-level access to the DW1000
//!
//! Every register the driver touches is declared once in the `registers!`
//! table at the bottom of this file. For each entry the macro generates a
//! marker type, a module holding `R` (read view) and `W` (write builder) with
//! one method per field, and an accessor method on [`DW1000`].
//!
//! Field setters truncate values that are wider than the field.

use core::{fmt, marker::PhantomData};

use embedded_hal::{blocking::spi, digital::v2::OutputPin};

/// Register ID of the transmit data buffer
const TX_BUFFER_ID: u8 = 0x09;

/// Register ID of the receive data buffer
const RX_BUFFER_ID: u8 = 0x11;

/// Size of both data buffers in bytes
pub const BUFFER_LEN: usize = 1024;

/// Register-level handle on the SPI bus and chip select line
pub struct DW1000<SPI, CS> {
    spi: SPI,
    chip_select: CS,
}

impl<SPI, CS> DW1000<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Wraps the SPI peripheral and chip select pin wired to the DW1000
    pub fn new(spi: SPI, chip_select: CS) -> Self {
        DW1000 { spi, chip_select }
    }

    /// Releases the bus and pin
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.chip_select)
    }

    /// Reads `buffer.len()` bytes starting at `offset` of the receive buffer
    pub fn read_rx_buffer(&mut self, offset: u16, buffer: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        self.read_bytes(RX_BUFFER_ID, offset, buffer)
    }

    /// Writes `data` into the transmit buffer, starting at `offset`
    pub fn write_tx_buffer(&mut self, offset: u16, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        self.write_bytes(TX_BUFFER_ID, offset, data)
    }

    fn read_bytes(&mut self, id: u8, sub_id: u16, buffer: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        let mut header = [0; 3];
        let header_len = init_header(false, id, sub_id, &mut header);

        self.assert_cs_low()?;
        self.spi
            .write(&header[..header_len])
            .map_err(Error::Write)?;
        if buffer.len() == 1 {
            // Single byte reads return garbage on some revisions; clock out two.
            let mut padded = [0; 2];
            self.spi.transfer(&mut padded).map_err(Error::Transfer)?;
            buffer[0] = padded[0];
        } else {
            self.spi.transfer(buffer).map_err(Error::Transfer)?;
        }
        self.assert_cs_high()
    }

    fn write_bytes(&mut self, id: u8, sub_id: u16, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        let mut header = [0; 3];
        let header_len = init_header(true, id, sub_id, &mut header);

        self.assert_cs_low()?;
        self.spi
            .write(&header[..header_len])
            .map_err(Error::Write)?;
        self.spi.write(data).map_err(Error::Write)?;
        self.assert_cs_high()
    }

    /// Drives chip select low. Holding it low for ~500 µs wakes the chip.
    pub(crate) fn assert_cs_low(&mut self) -> Result<(), Error<SPI, CS>> {
        self.chip_select.set_low().map_err(Error::ChipSelect)
    }

    pub(crate) fn assert_cs_high(&mut self) -> Result<(), Error<SPI, CS>> {
        self.chip_select.set_high().map_err(Error::ChipSelect)
    }
}

/// Provides access to a single register
pub struct RegAccessor<'s, R, SPI, CS>(&'s mut DW1000<SPI, CS>, PhantomData<R>);

impl<'s, R, SPI, CS> RegAccessor<'s, R, SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// Read from the register
    pub fn read(&mut self) -> Result<R::Read, Error<SPI, CS>>
    where
        R: Register + Readable,
    {
        let mut r = R::read();
        self.0.read_bytes(R::ID, R::SUB_ID, R::buffer(&mut r))?;
        Ok(r)
    }

    /// Write to the register. Fields not set by `f` are written as zero.
    pub fn write<F>(&mut self, f: F) -> Result<(), Error<SPI, CS>>
    where
        R: Register + Writable,
        F: FnOnce(&mut R::Write) -> &mut R::Write,
    {
        let mut w = R::write();
        f(&mut w);
        self.0.write_bytes(R::ID, R::SUB_ID, <R as Writable>::buffer(&mut w))
    }

    /// Read-modify-write
    pub fn modify<F>(&mut self, f: F) -> Result<(), Error<SPI, CS>>
    where
        R: Register + Readable + Writable,
        F: for<'r> FnOnce(&mut R::Read, &'r mut R::Write) -> &'r mut R::Write,
    {
        let mut r = self.read()?;
        let mut w = R::write();
        <R as Writable>::buffer(&mut w).copy_from_slice(<R as Readable>::buffer(&mut r));

        f(&mut r, &mut w);

        self.0.write_bytes(R::ID, R::SUB_ID, <R as Writable>::buffer(&mut w))
    }
}

/// An SPI error that can occur when communicating with the DW1000
pub enum Error<SPI, CS>
where
    SPI: spi::Transfer<u8> + spi::Write<u8>,
    CS: OutputPin,
{
    /// SPI error occured during a transfer transaction
    Transfer(<SPI as spi::Transfer<u8>>::Error),

    /// SPI error occured during a write transaction
    Write(<SPI as spi::Write<u8>>::Error),

    /// Error occured while changing chip select signal
    ChipSelect(<CS as OutputPin>::Error),
}

// Can't be derived: the associated error types would need `Debug` bounds on
// `SPI` and `CS` themselves.
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
            Error::Transfer(error) => write!(f, "Transfer({:?})", error),
            Error::Write(error) => write!(f, "Write({:?})", error),
            Error::ChipSelect(error) => write!(f, "ChipSelect({:?})", error),
        }
    }
}

/// Encodes the 1 to 3 byte transaction header into `buffer`
///
/// Byte 0 carries the write flag, the sub-index flag and the 6-bit register
/// ID. A non-zero sub-index adds one byte (7 bits) or, above 127, two bytes
/// (15 bits). Returns the number of header bytes used.
fn init_header(write: bool, id: u8, sub_id: u16, buffer: &mut [u8; 3]) -> usize {
    let has_sub_id = sub_id > 0;
    buffer[0] = (write as u8) << 7 | (has_sub_id as u8) << 6 | (id & 0x3f);
    if !has_sub_id {
        return 1;
    }

    let extended = sub_id > 127;
    buffer[1] = (extended as u8) << 7 | (sub_id as u8 & 0x7f);
    if !extended {
        return 2;
    }

    buffer[2] = (sub_id >> 7) as u8;
    3
}

/// Extracts bits `first..=last` (little-endian bit order) from `bytes`
pub(crate) fn get_bits(bytes: &[u8], first: usize, last: usize) -> u64 {
    (first..=last)
        .rev()
        .fold(0, |acc, bit| acc << 1 | u64::from(bytes[bit / 8] >> (bit % 8) & 1))
}

/// Stores the low bits of `value` into bits `first..=last` of `bytes`
pub(crate) fn set_bits(bytes: &mut [u8], first: usize, last: usize, value: u64) {
    for (i, bit) in (first..=last).enumerate() {
        let mask = 1 << (bit % 8);
        if value >> i & 1 == 1 {
            bytes[bit / 8] |= mask;
        } else {
            bytes[bit / 8] &= !mask;
        }
    }
}

/// Address and size of a register, as given in the user manual, section 7.1
pub trait Register {
    /// The register file ID
    const ID: u8;

    /// The sub-register offset
    const SUB_ID: u16;

    /// The length in bytes
    const LEN: usize;
}

/// Implemented by registers that can be read
pub trait Readable {
    /// The read view
    type Read;

    /// Returns a zeroed read view
    fn read() -> Self::Read;

    /// Returns the read view's bytes
    fn buffer(r: &mut Self::Read) -> &mut [u8];
}

/// Implemented by registers that can be written
pub trait Writable {
    /// The write builder
    type Write;

    /// Returns a zeroed write builder
    fn write() -> Self::Write;

    /// Returns the write builder's bytes
    fn buffer(w: &mut Self::Write) -> &mut [u8];
}

macro_rules! registers {
    (@RO, $name:ident, $name_lower:ident, $len:expr) => {
        registers!(@read, $name, $name_lower, $len);
    };
    (@RW, $name:ident, $name_lower:ident, $len:expr) => {
        registers!(@read, $name, $name_lower, $len);

        impl Writable for $name {
            type Write = $name_lower::W;

            fn write() -> Self::Write {
                $name_lower::W([0; $len])
            }

            fn buffer(w: &mut Self::Write) -> &mut [u8] {
                &mut w.0
            }
        }
    };
    (@read, $name:ident, $name_lower:ident, $len:expr) => {
        impl Readable for $name {
            type Read = $name_lower::R;

            fn read() -> Self::Read {
                $name_lower::R([0; $len])
            }

            fn buffer(r: &mut Self::Read) -> &mut [u8] {
                &mut r.0
            }
        }
    };
    (
        $(
            $id:expr,
            $sub_id:expr,
            $len:expr,
            $rw:tt,
            $name:ident($name_lower:ident) {
            #[$doc:meta]
            $(
                $field:ident,
                $first_bit:expr,
                $last_bit:expr,
                $ty:ty;
                #[$field_doc:meta]
            )*
            }
        )*
    ) => {
        $(
            #[$doc]
            #[allow(non_camel_case_types)]
            pub struct $name;

            impl Register for $name {
                const ID: u8 = $id;
                const SUB_ID: u16 = $sub_id;
                const LEN: usize = $len;
            }

            #[$doc]
            pub mod $name_lower {
                use core::fmt;

                /// Read view of the register
                pub struct R(pub(crate) [u8; $len]);

                impl R {
                    $(
                        #[$field_doc]
                        pub fn $field(&self) -> $ty {
                            crate::ll::get_bits(&self.0, $first_bit, $last_bit) as $ty
                        }
                    )*
                }

                impl fmt::Debug for R {
                    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                        write!(f, "0x")?;
                        for byte in self.0.iter().rev() {
                            write!(f, "{:02x}", byte)?;
                        }
                        Ok(())
                    }
                }

                /// Write builder for the register
                pub struct W(pub(crate) [u8; $len]);

                impl W {
                    $(
                        #[$field_doc]
                        pub fn $field(&mut self, value: $ty) -> &mut Self {
                            crate::ll::set_bits(&mut self.0, $first_bit, $last_bit, value as u64);
                            self
                        }
                    )*
                }
            }

            registers!(@$rw, $name, $name_lower, $len);
        )*

        impl<SPI, CS> DW1000<SPI, CS> {
            $(
                #[$doc]
                pub fn $name_lower(&mut self) -> RegAccessor<$name, SPI, CS> {
                    RegAccessor(self, PhantomData)
                }
            )*
        }
    };

}

// <id>, <sub-id>, <bytes>, <RO/RW>, <NAME>(name) { /// <doc>
//     <field>, <first bit>, <last bit>, <type>; /// <doc>
// }
registers! {
    0x00, 0x00, 4, RO, DEV_ID(dev_id) { /// Device identifier
        rev,     0,  3, u8;  /// Revision
        ver,     4,  7, u8;  /// Version
        model,   8, 15, u8;  /// Model
        ridtag, 16, 31, u16; /// Register identification tag, reads 0xDECA
    }
    0x01, 0x00, 8, RW, EUI(eui) { /// Extended unique identifier
        value, 0, 63, u64; /// 64-bit EUI
    }
    0x03, 0x00, 4, RW, PANADR(panadr) { /// PAN identifier and short address
        short_addr,  0, 15, u16; /// Short address
        pan_id,     16, 31, u16; /// PAN identifier
    }
    0x04, 0x00, 4, RW, SYS_CFG(sys_cfg) { /// System configuration
        ffen,      0,  0, u8; /// Frame filtering enable
        ffab,      2,  2, u8; /// Accept beacon frames
        ffad,      3,  3, u8; /// Accept data frames
        hirq_pol,  9,  9, u8; /// IRQ line active high
        dis_drxb, 12, 12, u8; /// Disable double receive buffering
        phr_mode, 16, 17, u8; /// PHR mode, 0b11 for long frames
        rxm110k,  22, 22, u8; /// Receiver in 110 kbps mode
        rxwtoe,   28, 28, u8; /// Receive wait timeout enable
        rxautr,   29, 29, u8; /// Receiver auto re-enable
    }
    0x06, 0x00, 5, RO, SYS_TIME(sys_time) { /// System time counter
        value, 0, 39, u64; /// 40-bit system time
    }
    0x08, 0x00, 5, RW, TX_FCTRL(tx_fctrl) { /// Transmit frame control
        tflen,     0,  6, u8;  /// Frame length, including the FCS
        tfle,      7,  9, u8;  /// Frame length extension
        txbr,     13, 14, u8;  /// Data rate
        tr,       15, 15, u8;  /// Ranging frame bit
        txprf,    16, 17, u8;  /// Pulse repetition frequency
        txpsr,    18, 19, u8;  /// Preamble symbol repetitions
        pe,       20, 21, u8;  /// Preamble extension
        txboffs,  22, 31, u16; /// Offset into the transmit buffer
        ifsdelay, 32, 39, u8;  /// Inter-frame spacing
    }
    0x0A, 0x00, 5, RW, DX_TIME(dx_time) { /// Delayed transmit or receive time
        value, 0, 39, u64; /// Target system time, low 9 bits ignored
    }
    0x0C, 0x00, 2, RW, RX_FWTO(rx_fwto) { /// Receive frame wait timeout
        value, 0, 15, u16; /// Timeout in units of ~1.026 µs
    }
    0x0D, 0x00, 4, RW, SYS_CTRL(sys_ctrl) { /// System control
        sfcst,      0,  0, u8; /// Suppress automatic FCS
        txstrt,     1,  1, u8; /// Start transmission
        txdlys,     2,  2, u8; /// Delay transmission until DX_TIME
        trxoff,     6,  6, u8; /// Turn the transceiver off
        wait4resp,  7,  7, u8; /// Enable the receiver after transmission
        rxenab,     8,  8, u8; /// Enable the receiver
        rxdlye,     9,  9, u8; /// Delay receiver enable until DX_TIME
        hrbpt,     24, 24, u8; /// Toggle the host side receive buffer pointer
    }
    0x0E, 0x00, 4, RW, SYS_MASK(sys_mask) { /// Interrupt mask, same layout as SYS_STATUS
        value, 0, 31, u32; /// Mask bits
    }
    0x0F, 0x00, 5, RW, SYS_STATUS(sys_status) { /// System event status, write 1 to clear
        irqs,      0,  0, u8;  /// Interrupt request pending
        cplock,    1,  1, u8;  /// Clock PLL lock
        txfrb,     4,  4, u8;  /// Transmit frame begins
        txprs,     5,  5, u8;  /// Transmit preamble sent
        txphs,     6,  6, u8;  /// Transmit PHY header sent
        txfrs,     7,  7, u8;  /// Transmit frame sent
        rxprd,     8,  8, u8;  /// Preamble detected
        rxsfdd,    9,  9, u8;  /// SFD detected
        ldedone,  10, 10, u8;  /// Leading edge detection done
        rxphd,    11, 11, u8;  /// PHY header detected
        rxphe,    12, 12, u8;  /// PHY header error
        rxdfr,    13, 13, u8;  /// Data frame ready
        rxfcg,    14, 14, u8;  /// FCS good
        rxfce,    15, 15, u8;  /// FCS error
        rxrfsl,   16, 16, u8;  /// Reed-Solomon frame sync loss
        rxrfto,   17, 17, u8;  /// Frame wait timeout
        ldeerr,   18, 18, u8;  /// Leading edge detection error
        rxovrr,   20, 20, u8;  /// Receiver overrun
        rxpto,    21, 21, u8;  /// Preamble detection timeout
        slp2init, 23, 23, u8;  /// Woke up from sleep into INIT
        rxsfdto,  26, 26, u8;  /// SFD timeout
        hpdwarn,  27, 27, u8;  /// Delayed operation programmed too late
        txberr,   28, 28, u8;  /// Transmit buffer error
        affrej,   29, 29, u8;  /// Frame rejected by filtering
        hsrbp,    30, 30, u8;  /// Host side receive buffer pointer
        icrbp,    31, 31, u8;  /// IC side receive buffer pointer
        rxrscs,   32, 32, u8;  /// Reed-Solomon correction status
        rxprej,   33, 33, u8;  /// Preamble rejection
        txpute,   34, 34, u8;  /// Transmit power up time error
        value,     0, 39, u64; /// All status bits
    }
    0x10, 0x00, 4, RO, RX_FINFO(rx_finfo) { /// Receive frame information
        rxflen,  0,  6, u8;  /// Frame length, including the FCS
        rxfle,   7,  9, u8;  /// Frame length extension
        rxpacc, 20, 31, u16; /// Preamble accumulation count
    }
    0x15, 0x00, 14, RO, RX_TIME(rx_time) { /// Receive time stamp
        rx_stamp,  0,  39, u64; /// Adjusted RMARKER receive time
        fp_index, 40,  55, u16; /// First path index
        fp_ampl1, 56,  71, u16; /// First path amplitude, point 1
        rx_rawst, 72, 111, u64; /// Raw receive time stamp
    }
    0x17, 0x00, 10, RO, TX_TIME(tx_time) { /// Transmit time stamp
        tx_stamp,  0, 39, u64; /// Adjusted transmit time, includes the antenna delay
        tx_rawst, 40, 79, u64; /// Raw transmit time stamp
    }
    0x18, 0x00, 2, RW, TX_ANTD(tx_antd) { /// Transmit antenna delay
        value, 0, 15, u16; /// Delay in system time units
    }
    0x1E, 0x00, 4, RW, TX_POWER(tx_power) { /// Transmit power control
        value, 0, 31, u32; /// Power setting
    }
    0x1F, 0x00, 4, RW, CHAN_CTRL(chan_ctrl) { /// Channel control
        tx_chan,   0,  3, u8; /// Transmit channel
        rx_chan,   4,  7, u8; /// Receive channel
        dwsfd,    17, 17, u8; /// Use the Decawave SFD sequence
        rxprf,    18, 19, u8; /// Receive pulse repetition frequency
        tnssfd,   20, 20, u8; /// Transmit user-defined SFD
        rnssfd,   21, 21, u8; /// Receive user-defined SFD
        tx_pcode, 22, 26, u8; /// Transmit preamble code
        rx_pcode, 27, 31, u8; /// Receive preamble code
    }
    0x23, 0x04, 2, RW, AGC_TUNE1(agc_tune1) { /// AGC tuning 1
        value, 0, 15, u16; /// Tuning value, depends on PRF
    }
    0x23, 0x0C, 4, RW, AGC_TUNE2(agc_tune2) { /// AGC tuning 2
        value, 0, 31, u32; /// Tuning value
    }
    0x27, 0x02, 2, RW, DRX_TUNE0B(drx_tune0b) { /// Digital tuning 0b
        value, 0, 15, u16; /// SFD detection tuning
    }
    0x27, 0x04, 2, RW, DRX_TUNE1A(drx_tune1a) { /// Digital tuning 1a
        value, 0, 15, u16; /// PRF dependent tuning
    }
    0x27, 0x06, 2, RW, DRX_TUNE1B(drx_tune1b) { /// Digital tuning 1b
        value, 0, 15, u16; /// Preamble length dependent tuning
    }
    0x27, 0x08, 4, RW, DRX_TUNE2(drx_tune2) { /// Digital tuning 2
        value, 0, 31, u32; /// PAC and PRF dependent tuning
    }
    0x27, 0x20, 2, RW, DRX_SFDTOC(drx_sfdtoc) { /// SFD detection timeout
        count, 0, 15, u16; /// Timeout in preamble symbols
    }
    0x27, 0x24, 2, RW, DRX_PRETOC(drx_pretoc) { /// Preamble detection timeout
        count, 0, 15, u16; /// Timeout in PAC units
    }
    0x27, 0x26, 2, RW, DRX_TUNE4H(drx_tune4h) { /// Digital tuning 4h
        value, 0, 15, u16; /// Preamble length dependent tuning
    }
    0x27, 0x28, 3, RO, DRX_CAR_INT(drx_car_int) { /// Carrier recovery integrator
        value, 0, 20, u32; /// Signed 21-bit integrator value
    }
    0x28, 0x0B, 1, RW, RF_RXCTRLH(rf_rxctrlh) { /// Analog receive control
        value, 0, 7, u8; /// Channel dependent value
    }
    0x28, 0x0C, 3, RW, RF_TXCTRL(rf_txctrl) { /// Analog transmit control
        txmtune, 5,  8, u8;  /// Transmit mixer tuning
        txmq,    9, 11, u8;  /// Transmit mixer Q-factor
        value,   0, 23, u32; /// Channel dependent value
    }
    0x28, 0x30, 5, RW, LDOTUNE(ldotune) { /// LDO voltage tuning
        value, 0, 39, u64; /// Calibrated value from OTP
    }
    0x2A, 0x0B, 1, RW, TC_PGDELAY(tc_pgdelay) { /// Pulse generator delay
        value, 0, 7, u8; /// Channel dependent value
    }
    0x2B, 0x07, 4, RW, FS_PLLCFG(fs_pllcfg) { /// PLL configuration
        value, 0, 31, u32; /// Channel dependent value
    }
    0x2B, 0x0B, 1, RW, FS_PLLTUNE(fs_plltune) { /// PLL tuning
        value, 0, 7, u8; /// Channel dependent value
    }
    0x2B, 0x0E, 1, RW, FS_XTALT(fs_xtalt) { /// Crystal trim
        xtalt,    0, 4, u8; /// Trim value
        reserved, 5, 7, u8; /// Must be written as 0b011
    }
    0x2C, 0x00, 2, RW, AON_WCFG(aon_wcfg) { /// Always-on wake-up configuration
        onw_radc,   0,  0, u8; /// Sample temperature and voltage on wake-up
        onw_rx,     1,  1, u8; /// Turn on the receiver on wake-up
        onw_leui,   3,  3, u8; /// Load the EUI from OTP on wake-up
        onw_ldc,    6,  6, u8; /// Restore the saved configuration on wake-up
        onw_l64p,   7,  7, u8; /// Load the length 64 parameter set on wake-up
        pres_sleep, 8,  8, u8; /// Preserve the automatic sleep bits
        onw_llde,  11, 11, u8; /// Load the LDE microcode on wake-up
        onw_lldo,  12, 12, u8; /// Load LDOTUNE from OTP on wake-up
        value,      0, 15, u16; /// All wake-up actions
    }
    0x2C, 0x02, 1, RW, AON_CTRL(aon_ctrl) { /// Always-on control
        restore, 0, 0, u8; /// Copy the saved configuration to the host registers
        save,    1, 1, u8; /// Copy the host registers into always-on memory
        upl_cfg, 2, 2, u8; /// Upload the always-on configuration
    }
    0x2C, 0x06, 4, RW, AON_CFG0(aon_cfg0) { /// Always-on configuration 0
        sleep_en,   0,  0, u8;  /// Enable sleep
        wake_pin,   1,  1, u8;  /// Wake on the WAKEUP pin
        wake_spi,   2,  2, u8;  /// Wake on chip select
        wake_cnt,   3,  3, u8;  /// Wake when the sleep counter elapses
        lpdiv_en,   4,  4, u8;  /// Low power divider enable
        lpclkdiva,  5, 15, u16; /// Low power clock divider
        sleep_tim, 16, 31, u16; /// Sleep counter
    }
    0x2C, 0x0A, 2, RW, AON_CFG1(aon_cfg1) { /// Always-on configuration 1
        sleep_cen, 0, 0, u8; /// Enable the sleep counter
        smxx,      1, 1, u8; /// Must be zero for sleep to work
        lposc_cal, 2, 2, u8; /// Calibrate the low power oscillator
    }
    0x2D, 0x04, 2, RW, OTP_ADDR(otp_addr) { /// OTP address
        value, 0, 10, u16; /// Word address
    }
    0x2D, 0x06, 2, RW, OTP_CTRL(otp_ctrl) { /// OTP control
        otprden,  0,  0, u8; /// Manual read mode
        otpread,  1,  1, u8; /// Start a read
        ldeload, 15, 15, u8; /// Load the LDE microcode
    }
    0x2D, 0x0A, 4, RO, OTP_RDAT(otp_rdat) { /// OTP read data
        value, 0, 31, u32; /// Word read from OTP
    }
    0x2E, 0x0806, 1, RW, LDE_CFG1(lde_cfg1) { /// Leading edge detection configuration 1
        ntm,   0, 4, u8; /// Noise threshold multiplier
        pmult, 5, 7, u8; /// Peak multiplier
    }
    0x2E, 0x1804, 2, RW, LDE_RXANTD(lde_rxantd) { /// Receive antenna delay
        value, 0, 15, u16; /// Delay in system time units
    }
    0x2E, 0x1806, 2, RW, LDE_CFG2(lde_cfg2) { /// Leading edge detection configuration 2
        value, 0, 15, u16; /// PRF dependent value
    }
    0x2E, 0x2804, 2, RW, LDE_REPC(lde_repc) { /// Leading edge replica coefficient
        value, 0, 15, u16; /// Preamble code dependent value
    }
    0x2F, 0x00, 4, RW, EVC_CTRL(evc_ctrl) { /// Event counter control
        evc_en,  0, 0, u8; /// Enable the counters
        evc_clr, 1, 1, u8; /// Clear the counters
    }
    0x2F, 0x18, 2, RO, EVC_HPW(evc_hpw) { /// Half period warning counter
        value, 0, 11, u16; /// Count
    }
    0x2F, 0x1A, 2, RO, EVC_TPW(evc_tpw) { /// Transmitter power-up warning counter
        value, 0, 11, u16; /// Count
    }
    0x36, 0x00, 4, RW, PMSC_CTRL0(pmsc_ctrl0) { /// Power management control 0
        sysclks,    0,  1, u8;  /// System clock selection
        softreset, 28, 31, u8;  /// Active low soft reset bits
        raw_value,  0, 31, u32; /// Whole register
    }
    0x36, 0x04, 4, RW, PMSC_CTRL1(pmsc_ctrl1) { /// Power management control 1
        arx2init,  1,  1, u8; /// Go to INIT after receiving
        pktseq,    3, 10, u8; /// Analog sequencing control
        atxslp,   11, 11, u8; /// Sleep after transmitting
        arxslp,   12, 12, u8; /// Sleep after receiving
        lderune,  17, 17, u8; /// Run leading edge detection
    }
}
