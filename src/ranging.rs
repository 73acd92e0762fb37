//! Double-sided two-way ranging
//!
//! A node that needs its distance to a beacon (the tag) measures it with four
//! messages, one per micro-slot, as described in the DW1000 user manual,
//! section 12.3.2:
//!
//! 1. The tag sends a [`Poll`] to the beacon.
//! 2. The beacon answers with a [`Ping`] one micro-slot after the poll
//!    arrived.
//! 3. The tag replies with a ranging [`Request`].
//! 4. The beacon wraps up with a ranging [`Response`], which carries
//!    everything the tag needs to compute the time of flight.
//!
//! Both ends only exchange timestamps taken by their own clock, so the result
//! doesn't depend on the clock offset between them. No range bias is
//! applied; location cells work with raw times of flight.

use core::mem::size_of;

use dw1000::time::{Duration, Instant};
use ieee802154::mac::{Address, ExtendedAddress};
use serde::{Deserialize, Serialize};

use crate::{
    debug,
    frame::{self, FrameError, RawFrame, MAX_FRAME_LEN, PAN_ID},
    radio::{self, Radio, RadioError, Trx},
};

/// Largest message payload, prelude included
const MAX_MESSAGE_LEN: usize = 48;

/// Implemented by all ranging messages
pub trait Message: Sized + for<'de> Deserialize<'de> + Serialize {
    /// Identifies the message
    const PRELUDE: Prelude;

    /// `PRELUDE.0.len()`, which can't be used in constants
    const PRELUDE_LEN: usize;

    /// Length of the whole message, prelude and data
    const LEN: usize = Self::PRELUDE_LEN + size_of::<Self>();

    /// Decodes a received frame if it holds a message of this type
    ///
    /// Returns `Ok(None)` for frames carrying other messages.
    fn decode(frame: &RawFrame, rx_time: Instant) -> Result<Option<RxMessage<Self>>, FrameError> {
        if !frame.payload.starts_with(Self::PRELUDE.0) {
            return Ok(None);
        }
        if frame.payload.len() != Self::LEN {
            return Err(FrameError::Length(frame.payload.len()));
        }

        let (payload, _) = ssmarshal::deserialize::<Self>(&frame.payload[Self::PRELUDE_LEN..])
            .map_err(|_| FrameError::BadInput("ranging message"))?;

        Ok(Some(RxMessage {
            rx_time,
            source: frame.source,
            payload,
        }))
    }
}

/// An incoming ranging message
#[derive(Debug)]
pub struct RxMessage<T: Message> {
    /// RMARKER arrival time
    pub rx_time: Instant,
    pub source: u64,
    pub payload: T,
}

/// An outgoing ranging message
#[derive(Debug)]
pub struct TxMessage<T: Message> {
    pub recipient: u64,
    /// Time the transmission is scheduled at
    pub tx_time: Instant,
    pub payload: T,
}

impl<T> TxMessage<T>
where
    T: Message,
{
    /// Writes the message into the radio and schedules it
    pub fn send<R: Radio>(&self, radio: &mut R, source: u64, seq: u8) -> Result<(), RangingError<R::Error>> {
        let mut body = [0; MAX_MESSAGE_LEN];
        body[..T::PRELUDE_LEN].copy_from_slice(T::PRELUDE.0);
        ssmarshal::serialize(&mut body[T::PRELUDE_LEN..], &self.payload)
            .map_err(|_| RangingError::Frame(FrameError::BadInput("ranging message")))?;

        let mut buf = [0; MAX_FRAME_LEN];
        let len = frame::encode_raw(
            Address::Extended(PAN_ID, ExtendedAddress(self.recipient)),
            source,
            seq,
            &body[..T::LEN],
            &mut buf,
        )?;
        radio.write_tx(&buf[..len], 0)?;
        radio.schedule_tx(self.tx_time, len)?;
        Ok(())
    }
}

/// Sent before a message's data to identify the message
#[derive(Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Prelude(pub &'static [u8]);

/// Asks a beacon to start an exchange
#[derive(Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Poll;

impl Poll {
    pub fn new(recipient: u64, tx_time: Instant) -> TxMessage<Self> {
        TxMessage {
            recipient,
            tx_time,
            payload: Poll,
        }
    }
}

impl Message for Poll {
    const PRELUDE: Prelude = Prelude(b"RANGING POLL");
    const PRELUDE_LEN: usize = 12;
}

/// Ranging ping, the beacon's answer to a poll
#[derive(Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Ping {
    /// When the ping left the beacon's antenna, in beacon time
    pub ping_tx_time: Instant,
}

impl Ping {
    pub fn new(poll: &RxMessage<Poll>, tx_time: Instant, antenna_delay: Duration) -> TxMessage<Self> {
        TxMessage {
            recipient: poll.source,
            tx_time,
            payload: Ping {
                ping_tx_time: radio::tx_rmarker(tx_time, antenna_delay),
            },
        }
    }
}

impl Message for Ping {
    const PRELUDE: Prelude = Prelude(b"RANGING PING");
    const PRELUDE_LEN: usize = 12;
}

/// Ranging request, sent by the tag in reply to a ping
#[derive(Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Request {
    /// When the ping was sent, in beacon time
    pub ping_tx_time: Instant,

    /// Time between the ping arriving and the request leaving the tag
    pub ping_reply_time: Duration,

    /// When the request was sent, in tag time
    pub request_tx_time: Instant,
}

impl Request {
    pub fn new(ping: &RxMessage<Ping>, tx_time: Instant, antenna_delay: Duration) -> TxMessage<Self> {
        let request_tx_time = radio::tx_rmarker(tx_time, antenna_delay);
        TxMessage {
            recipient: ping.source,
            tx_time,
            payload: Request {
                ping_tx_time: ping.payload.ping_tx_time,
                ping_reply_time: request_tx_time.duration_since(ping.rx_time),
                request_tx_time,
            },
        }
    }
}

impl Message for Request {
    const PRELUDE: Prelude = Prelude(b"RANGING REQUEST");
    const PRELUDE_LEN: usize = 15;
}

/// Ranging response, closing the exchange
#[derive(Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct Response {
    /// Time between the ping arriving and the request leaving the tag
    pub ping_reply_time: Duration,

    /// Time between the ping leaving and the request arriving at the beacon
    pub ping_round_trip_time: Duration,

    /// When the request was sent, in tag time
    pub request_tx_time: Instant,

    /// Time between the request arriving and the response leaving the beacon
    pub request_reply_time: Duration,
}

impl Response {
    pub fn new(request: &RxMessage<Request>, tx_time: Instant, antenna_delay: Duration) -> TxMessage<Self> {
        let response_tx_time = radio::tx_rmarker(tx_time, antenna_delay);
        TxMessage {
            recipient: request.source,
            tx_time,
            payload: Response {
                ping_reply_time: request.payload.ping_reply_time,
                ping_round_trip_time: request.rx_time.duration_since(request.payload.ping_tx_time),
                request_tx_time: request.payload.request_tx_time,
                request_reply_time: response_tx_time.duration_since(request.rx_time),
            },
        }
    }
}

impl Message for Response {
    const PRELUDE: Prelude = Prelude(b"RANGING RESPONSE");
    const PRELUDE_LEN: usize = 16;
}

/// Time of flight to the sender of `response`, in DW1000 ticks
pub fn compute_tof_ticks(response: &RxMessage<Response>) -> Result<u64, ComputeDistanceError> {
    // `rt` is short for reply time, `rtt` for round-trip time.
    let ping_rt = response.payload.ping_reply_time.value();
    let ping_rtt = response.payload.ping_round_trip_time.value();
    let request_rt = response.payload.request_reply_time.value();
    let request_rtt = response
        .rx_time
        .duration_since(response.payload.request_tx_time)
        .value();

    let rtt_product = ping_rtt
        .checked_mul(request_rtt)
        .ok_or(ComputeDistanceError::RoundTripTimesTooLarge)?;
    let rt_product = ping_rt
        .checked_mul(request_rt)
        .ok_or(ComputeDistanceError::ReplyTimesTooLarge)?;
    let rt_sum = ping_rt
        .checked_add(request_rt)
        .ok_or(ComputeDistanceError::SumTooLarge)?;
    let rtt_sum = ping_rtt
        .checked_add(request_rtt)
        .ok_or(ComputeDistanceError::SumTooLarge)?;
    let sum = rt_sum
        .checked_add(rtt_sum)
        .ok_or(ComputeDistanceError::SumTooLarge)?;
    if sum == 0 {
        return Err(ComputeDistanceError::SumTooLarge);
    }

    // Noise can make the reply product win at very short range.
    Ok(rtt_product.saturating_sub(rt_product) / sum)
}

/// Distance to the sender of `response`, in millimeters
pub fn compute_distance_mm(response: &RxMessage<Response>) -> Result<u64, ComputeDistanceError> {
    const SPEED_OF_LIGHT: u64 = 299_792_458;

    let time_of_flight = compute_tof_ticks(response)?;
    // Ticks are roughly 1/64 ns.
    let distance_nm_times_64 = SPEED_OF_LIGHT
        .checked_mul(time_of_flight)
        .ok_or(ComputeDistanceError::TimeOfFlightTooLarge)?;
    Ok(distance_nm_times_64 / 64 / 1_000_000)
}

/// Returned from [`compute_distance_mm`] in case of an error
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ComputeDistanceError {
    /// Reply times are too large to be multiplied
    ReplyTimesTooLarge,

    /// Round-trip times are too large to be multiplied
    RoundTripTimesTooLarge,

    /// The sum computed as part of the algorithm is too large, or zero
    SumTooLarge,

    /// The time of flight is so large, the distance calculation would overflow
    TimeOfFlightTooLarge,
}

#[derive(Clone, Copy, PartialEq)]
pub enum RangingError<E> {
    Radio(RadioError<E>),
    Frame(FrameError),
    /// A frame from someone else or a message out of order
    Unexpected,
    Distance(ComputeDistanceError),
}

impl<E> From<RadioError<E>> for RangingError<E> {
    fn from(error: RadioError<E>) -> Self {
        RangingError::Radio(error)
    }
}

impl<E> From<FrameError> for RangingError<E> {
    fn from(error: FrameError) -> Self {
        RangingError::Frame(error)
    }
}

impl<E> From<ComputeDistanceError> for RangingError<E> {
    fn from(error: ComputeDistanceError) -> Self {
        RangingError::Distance(error)
    }
}

impl<E: core::fmt::Debug> core::fmt::Debug for RangingError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            RangingError::Radio(error) => write!(f, "Radio({:?})", error),
            RangingError::Frame(error) => write!(f, "Frame({:?})", error),
            RangingError::Unexpected => write!(f, "Unexpected"),
            RangingError::Distance(error) => write!(f, "Distance({:?})", error),
        }
    }
}

/// Runs ranging exchanges on a radio, one micro-slot per message
#[derive(Clone, Copy, Debug)]
pub struct Ranging {
    address: u64,
    grid: Duration,
    guard: Duration,
    rx_timeout: Duration,
    seq: u8,
}

impl Ranging {
    pub fn new(address: u64, grid: Duration, guard: Duration, rx_timeout: Duration) -> Self {
        Ranging {
            address,
            grid,
            guard,
            rx_timeout,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send<R: Radio, T: Message>(&mut self, radio: &mut R, message: &TxMessage<T>) -> Result<(), RangingError<R::Error>> {
        let seq = self.next_seq();
        message.send(radio, self.address, seq)?;
        match radio::wait_for_trx(radio, message.tx_time + self.grid)? {
            Trx::Sent(_) => Ok(()),
            Trx::Received(_) => Err(RangingError::Unexpected),
        }
    }

    /// Receives a message of type `T` from `source`, or from anyone if
    /// `source` is `None`
    fn receive<R: Radio, T: Message>(
        &mut self,
        radio: &mut R,
        at: Instant,
        timeout: Duration,
        source: Option<u64>,
    ) -> Result<RxMessage<T>, RangingError<R::Error>> {
        radio.schedule_rx(at, timeout)?;
        let info = match radio::wait_for_trx(radio, at + timeout + self.guard)? {
            Trx::Received(info) => info,
            Trx::Sent(_) => return Err(RangingError::Unexpected),
        };

        let mut buf = [0; MAX_FRAME_LEN];
        let len = info.len.min(buf.len());
        radio.read_rx(&mut buf[..len], 0)?;
        let raw = frame::decode_raw(&buf[..len])?;
        if raw.destination != Some(Address::Extended(PAN_ID, ExtendedAddress(self.address))) {
            return Err(RangingError::Unexpected);
        }
        if source.map_or(false, |source| source != raw.source) {
            return Err(RangingError::Unexpected);
        }
        T::decode(&raw, info.timestamp)?.ok_or(RangingError::Unexpected)
    }

    /// Measures the time of flight to `beacon`, polling at `start`
    ///
    /// Takes four micro-slots. Returns the one-way time of flight in ticks.
    pub fn initiate<R: Radio>(&mut self, radio: &mut R, beacon: u64, start: Instant) -> Result<u64, RangingError<R::Error>> {
        let antenna_delay = radio.tx_antenna_delay();

        self.send(radio, &Poll::new(beacon, start))?;
        let ping = self.receive::<_, Ping>(radio, start + self.grid - self.guard, self.rx_timeout, Some(beacon))?;

        let request = Request::new(&ping, ping.rx_time + self.grid, antenna_delay);
        self.send(radio, &request)?;
        let response = self.receive::<_, Response>(
            radio,
            ping.rx_time + self.grid + self.grid - self.guard,
            self.rx_timeout,
            Some(beacon),
        )?;

        let tof = compute_tof_ticks(&response)?;
        debug!("ranging with {:x}: {} ticks", beacon, tof);
        Ok(tof)
    }

    /// Listens for a poll from `start` on for `window`, and answers it
    ///
    /// Returns the tag's address once the exchange is complete.
    pub fn respond<R: Radio>(&mut self, radio: &mut R, start: Instant, window: Duration) -> Result<u64, RangingError<R::Error>> {
        let antenna_delay = radio.tx_antenna_delay();

        let poll = self.receive::<_, Poll>(radio, start, window, None)?;
        let tag = poll.source;

        let ping = Ping::new(&poll, poll.rx_time + self.grid, antenna_delay);
        self.send(radio, &ping)?;
        let request = self.receive::<_, Request>(
            radio,
            poll.rx_time + self.grid + self.grid - self.guard,
            self.rx_timeout,
            Some(tag),
        )?;

        let response = Response::new(&request, request.rx_time + self.grid, antenna_delay);
        self.send(radio, &response)?;
        debug!("answered ranging from {:x}", tag);
        Ok(tag)
    }
}
