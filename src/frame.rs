//! Location beacon frames
//!
//! A beacon is an IEEE 802.15.4 data frame from the beacon's extended address
//! to the broadcast address, PAN id compressed. Its payload is
//!
//! | offset | size | field                                         |
//! |--------|------|-----------------------------------------------|
//! | 0      | 1    | version, [`VERSION`]                          |
//! | 1      | 1    | class                                         |
//! | 2      | 1    | offset (bits 0-2), slot (3-4), dir (5-7)      |
//! | 3      | 1    | reserved                                      |
//! | 4      | 20   | x, y, z, r, t as little endian `f32`          |
//! | 24     | 4    | neighborhood bitmask, little endian           |
//! | 28     | 12·N | N entries of 8 byte address + `i32` timestamp |
//!
//! The MAC header of a beacon is [`MAC_HEADER_LEN`] bytes long, so every
//! field sits at a fixed position in the radio buffers. The engine relies on
//! that to read only the head of a frame first and to patch single entries
//! of its outgoing frame in place.

use byte::{ctx::LE, BytesExt, TryRead, TryWrite};
use heapless::Vec;
use ieee802154::mac::{
    self, Address, ExtendedAddress, FooterMode, FrameSerDesContext, PanId, ShortAddress,
};

use crate::lattice::CELL_PARTICIPANTS;

pub const VERSION: u8 = 22;

/// PAN all location frames are sent in
pub const PAN_ID: PanId = PanId(0xDECA);

/// Frame control, sequence number, destination PAN and short address,
/// extended source address
pub const MAC_HEADER_LEN: usize = 15;

pub const PAYLOAD_HEAD_LEN: usize = 28;
pub const ENTRY_LEN: usize = 12;

/// Bytes needed to learn a beacon's source and offset
pub const PEEK_LEN: usize = 23;

pub const MAX_PAYLOAD_LEN: usize = PAYLOAD_HEAD_LEN + CELL_PARTICIPANTS * ENTRY_LEN;
pub const MAX_FRAME_LEN: usize = MAC_HEADER_LEN + MAX_PAYLOAD_LEN;

/// Timestamp of an entry without a measurement
pub const NOT_MEASURED: i32 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// The buffer ended early
    Incomplete,
    BadOffset(usize),
    BadInput(&'static str),
    NotData,
    /// Source address missing or not extended
    BadSource,
    Version(u8),
    /// Payload length that isn't a whole number of entries
    Length(usize),
}

impl From<byte::Error> for FrameError {
    fn from(error: byte::Error) -> Self {
        match error {
            byte::Error::Incomplete => FrameError::Incomplete,
            byte::Error::BadOffset(offset) => FrameError::BadOffset(offset),
            byte::Error::BadInput { err } => FrameError::BadInput(err),
        }
    }
}

/// One participant as seen by the sender
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Entry {
    pub addr: u64,
    pub tstamp: i32,
}

impl Entry {
    pub fn unmeasured(addr: u64) -> Self {
        Entry {
            addr,
            tstamp: NOT_MEASURED,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_LEN] {
        let mut bytes = [0; ENTRY_LEN];
        bytes[..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..].copy_from_slice(&self.tstamp.to_le_bytes());
        bytes
    }
}

impl<'a> TryRead<'a> for Entry {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;
        let addr = bytes.read_with::<u64>(offset, LE)?;
        let tstamp = bytes.read_with::<i32>(offset, LE)?;
        Ok((Entry { addr, tstamp }, *offset))
    }
}

/// Position in the transmit buffer of entry `k`
pub fn entry_offset(k: usize) -> usize {
    MAC_HEADER_LEN + PAYLOAD_HEAD_LEN + k * ENTRY_LEN
}

/// Frame length with `n` entries
pub fn frame_len(n: usize) -> usize {
    MAC_HEADER_LEN + PAYLOAD_HEAD_LEN + n * ENTRY_LEN
}

#[derive(Clone, Debug, PartialEq)]
pub struct BeaconPayload {
    pub class: u8,
    pub dir: u8,
    pub slot: u8,
    pub offset: u8,
    pub pos: [f32; 3],
    pub r: f32,
    pub t: f32,
    pub nbrhood: u32,
    pub entries: Vec<Entry, CELL_PARTICIPANTS>,
}

impl BeaconPayload {
    pub fn len(&self) -> usize {
        PAYLOAD_HEAD_LEN + self.entries.len() * ENTRY_LEN
    }

    fn packed(&self) -> u8 {
        (self.offset & 0x07) | (self.slot & 0x03) << 3 | (self.dir & 0x07) << 5
    }
}

fn read_f32(bytes: &[u8], offset: &mut usize) -> byte::Result<f32> {
    Ok(f32::from_bits(bytes.read_with::<u32>(offset, LE)?))
}

fn write_f32(bytes: &mut [u8], offset: &mut usize, value: f32) -> byte::Result<()> {
    bytes.write_with::<u32>(offset, value.to_bits(), LE)
}

impl<'a> TryRead<'a> for BeaconPayload {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;
        let version = bytes.read_with::<u8>(offset, LE)?;
        if version != VERSION {
            return Err(byte::Error::BadInput { err: "version" });
        }
        let class = bytes.read_with::<u8>(offset, LE)?;
        let packed = bytes.read_with::<u8>(offset, LE)?;
        let _reserved = bytes.read_with::<u8>(offset, LE)?;
        let x = read_f32(bytes, offset)?;
        let y = read_f32(bytes, offset)?;
        let z = read_f32(bytes, offset)?;
        let r = read_f32(bytes, offset)?;
        let t = read_f32(bytes, offset)?;
        let nbrhood = bytes.read_with::<u32>(offset, LE)?;

        let rest = bytes.len() - *offset;
        if rest % ENTRY_LEN != 0 || rest / ENTRY_LEN > CELL_PARTICIPANTS {
            return Err(byte::Error::BadInput { err: "entries" });
        }
        let mut entries = Vec::new();
        for _ in 0..rest / ENTRY_LEN {
            let entry = bytes.read::<Entry>(offset)?;
            // Capacity checked above
            let _ = entries.push(entry);
        }

        let payload = BeaconPayload {
            class,
            dir: packed >> 5,
            slot: (packed >> 3) & 0x03,
            offset: packed & 0x07,
            pos: [x, y, z],
            r,
            t,
            nbrhood,
            entries,
        };
        Ok((payload, *offset))
    }
}

impl TryWrite for &BeaconPayload {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        let offset = &mut 0;
        bytes.write_with::<u8>(offset, VERSION, LE)?;
        bytes.write_with::<u8>(offset, self.class, LE)?;
        bytes.write_with::<u8>(offset, self.packed(), LE)?;
        bytes.write_with::<u8>(offset, 0, LE)?;
        for &value in self.pos.iter().chain([self.r, self.t].iter()) {
            write_f32(bytes, offset, value)?;
        }
        bytes.write_with::<u32>(offset, self.nbrhood, LE)?;
        for entry in &self.entries {
            bytes.write_with::<u64>(offset, entry.addr, LE)?;
            bytes.write_with::<i32>(offset, entry.tstamp, LE)?;
        }
        Ok(*offset)
    }
}

/// Writes a beacon frame from `source` into `buf`, returns its length
pub fn encode(source: u64, seq: u8, payload: &BeaconPayload, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut body = [0u8; MAX_PAYLOAD_LEN];
    let body_len = &mut 0;
    body.write_with(body_len, payload, ())?;
    let body_len = *body_len;
    encode_raw(
        Address::Short(PAN_ID, ShortAddress::broadcast()),
        source,
        seq,
        &body[..body_len],
        buf,
    )
}

/// Wraps `payload` in a data frame from `source` to `destination`
pub fn encode_raw(
    destination: Address,
    source: u64,
    seq: u8,
    payload: &[u8],
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let frame = mac::Frame {
        header: mac::Header {
            frame_type: mac::FrameType::Data,
            version: mac::FrameVersion::Ieee802154_2006,
            auxiliary_security_header: None,
            ie_present: false,
            seq_no_suppress: false,
            frame_pending: false,
            ack_request: false,
            pan_id_compress: true,
            destination: Some(destination),
            source: Some(Address::Extended(PAN_ID, ExtendedAddress(source))),
            seq,
        },
        content: mac::FrameContent::Data,
        payload,
        footer: [0; 2],
    };
    let mut len = 0;
    buf.write_with(
        &mut len,
        frame,
        &mut FrameSerDesContext::no_security(FooterMode::None),
    )?;
    Ok(len)
}

/// A received data frame
#[derive(Debug)]
pub struct RawFrame<'a> {
    pub source: u64,
    pub destination: Option<Address>,
    pub payload: &'a [u8],
}

/// Unwraps a data frame with an extended source address
pub fn decode_raw(buf: &[u8]) -> Result<RawFrame<'_>, FrameError> {
    let frame: mac::Frame = buf.read_with(&mut 0, FooterMode::None)?;
    if frame.header.frame_type != mac::FrameType::Data {
        return Err(FrameError::NotData);
    }
    let source = match frame.header.source {
        Some(Address::Extended(_, ExtendedAddress(source))) => source,
        _ => return Err(FrameError::BadSource),
    };
    Ok(RawFrame {
        source,
        destination: frame.header.destination,
        payload: frame.payload,
    })
}

/// Decodes a beacon frame into its source address and payload
pub fn decode(buf: &[u8]) -> Result<(u64, BeaconPayload), FrameError> {
    let raw = decode_raw(buf)?;
    if raw.payload.first() != Some(&VERSION) {
        return Err(FrameError::Version(raw.payload.first().copied().unwrap_or(0)));
    }
    let rest = raw.payload.len().saturating_sub(PAYLOAD_HEAD_LEN);
    if raw.payload.len() < PAYLOAD_HEAD_LEN || rest % ENTRY_LEN != 0 {
        return Err(FrameError::Length(raw.payload.len()));
    }
    let payload = raw.payload.read::<BeaconPayload>(&mut 0)?;
    Ok((raw.source, payload))
}

/// What the first [`PEEK_LEN`] bytes of a beacon tell
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Peek {
    pub source: u64,
    pub offset: u8,
}

pub fn peek(head: &[u8; PEEK_LEN]) -> Result<Peek, FrameError> {
    let raw = decode_raw(head)?;
    match raw.payload {
        [VERSION, _, packed, ..] => Ok(Peek {
            source: raw.source,
            offset: packed & 0x07,
        }),
        [version, ..] => Err(FrameError::Version(*version)),
        [] => Err(FrameError::Length(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(entries: usize) -> BeaconPayload {
        let mut payload = BeaconPayload {
            class: 3,
            dir: 5,
            slot: 2,
            offset: 4,
            pos: [1.5, -2.25, 3.0],
            r: 0.5,
            t: -0.125,
            nbrhood: 0b1010_0000_0000_0000_0011,
            entries: Vec::new(),
        };
        for k in 0..entries {
            payload
                .entries
                .push(Entry {
                    addr: 0x0102_0304_0506_0700 + k as u64,
                    tstamp: k as i32 * 1000 - 1,
                })
                .unwrap();
        }
        payload
    }

    #[test]
    fn header_length_is_fixed() {
        let mut buf = [0; MAX_FRAME_LEN];
        for n in [1, 6].iter() {
            let len = encode(0xaabb, 7, &payload(*n), &mut buf).unwrap();
            assert_eq!(len, frame_len(*n));
        }
        assert_eq!(frame_len(6), MAX_FRAME_LEN);
    }

    #[test]
    fn decodes_what_was_encoded() {
        let mut buf = [0; MAX_FRAME_LEN];
        for n in 0..=CELL_PARTICIPANTS {
            let sent = payload(n);
            let len = encode(0x1122_3344_5566_7788, 1, &sent, &mut buf).unwrap();
            let (source, received) = decode(&buf[..len]).unwrap();
            assert_eq!(source, 0x1122_3344_5566_7788);
            assert_eq!(received, sent);
        }
    }

    #[test]
    fn entries_sit_at_their_offsets() {
        let mut buf = [0; MAX_FRAME_LEN];
        let sent = payload(6);
        encode(1, 1, &sent, &mut buf).unwrap();
        for (k, entry) in sent.entries.iter().enumerate() {
            let at = entry_offset(k);
            assert_eq!(buf[at..at + ENTRY_LEN], entry.to_bytes());
        }

        let patched = Entry { addr: 99, tstamp: 12345 };
        let at = entry_offset(3);
        buf[at..at + ENTRY_LEN].copy_from_slice(&patched.to_bytes());
        let (_, received) = decode(&buf[..frame_len(6)]).unwrap();
        assert_eq!(received.entries[3], patched);
    }

    #[test]
    fn peek_reads_source_and_offset() {
        let mut buf = [0; MAX_FRAME_LEN];
        encode(0xfeed, 9, &payload(1), &mut buf).unwrap();
        let mut head = [0; PEEK_LEN];
        head.copy_from_slice(&buf[..PEEK_LEN]);
        assert_eq!(peek(&head), Ok(Peek { source: 0xfeed, offset: 4 }));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = encode(1, 1, &payload(2), &mut buf).unwrap();
        assert_eq!(decode(&buf[..len - 1]), Err(FrameError::Length(PAYLOAD_HEAD_LEN + 23)));

        buf[MAC_HEADER_LEN] = 21;
        assert_eq!(decode(&buf[..len]), Err(FrameError::Version(21)));

        let len = encode_raw(
            Address::Short(PAN_ID, ShortAddress::broadcast()),
            1,
            1,
            b"RANGING PING",
            &mut buf,
        )
        .unwrap();
        assert!(decode(&buf[..len]).is_err());
    }
}
