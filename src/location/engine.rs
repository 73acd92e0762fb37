//! The location cell micro-protocol
//!
//! A cell is seven micro-slots long. The prime transmits at offset 0, the
//! other five participants at offsets 1 to 5, and the prime closes the cell at
//! offset 6 with the round-trip times it measured to everybody. Everybody
//! else listens.
//!
//! Each transmitter reports, in its own entry, the time between the prime
//! frame's arrival and its own transmission, plus the arrival times of the
//! frames sent before its own. Frames are patched in the transmit buffer as
//! the cell progresses: while micro-slot `j` is on air, the head of the frame
//! received in micro-slot `j - 1` is read, its arrival is written into our
//! pending frame, and only then the rest is parsed.
//!
//! [`CellRun`] drives one node through a cell. [`CellRun::start_slot`] and
//! [`CellRun::end_slot`] are separate so several simulated nodes can share
//! one thread; on hardware [`run_cell`] calls them back to back.

use dw1000::time::{Duration, Instant};

use super::{
    neighbors::Neighbor,
    update::{scale_remote, LocUpdate, SELF_COL},
};
use crate::{
    config::LocConfig,
    debug,
    frame::{self, BeaconPayload, Entry, FrameError, MAX_FRAME_LEN, NOT_MEASURED, PEEK_LEN},
    info,
    lattice::{CELL_PARTICIPANTS, NO_OFFSET},
    radio::{self, Radio, RadioError, RxInfo, Trx},
    warn,
};

/// Micro-slots per cell
pub const MICRO_SLOTS: usize = CELL_PARTICIPANTS + 1;

/// Micro-slot of the prime's closing frame
pub const FINAL_SLOT: usize = CELL_PARTICIPANTS;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellTiming {
    pub grid: Duration,
    pub guard: Duration,
    pub rx_timeout: Duration,
    /// From the cell start to the prime's RMARKER
    pub tx_start: Duration,
}

impl From<&LocConfig> for CellTiming {
    fn from(config: &LocConfig) -> Self {
        CellTiming {
            grid: config.grid_length(),
            guard: config.rx_guard(),
            rx_timeout: config.rx_timeout(),
            tx_start: config.tx_start(),
        }
    }
}

/// Everything a cell needs to know about this node
#[derive(Clone, Debug)]
pub struct CellPlan {
    pub dir: u8,
    pub slot: u8,
    /// Our participation offset, `NO_OFFSET` if we don't take part
    pub offset: u8,
    /// Whether the beacon wants to transmit at `offset`
    pub shouldtx: bool,
    pub indices: [u8; CELL_PARTICIPANTS],
    pub address: u64,
    pub seq: u8,
    /// Our frame without entries
    pub payload: BeaconPayload,
    /// Addresses our neighbor table holds for the participants, 0 if unknown
    pub table: [u64; CELL_PARTICIPANTS],
    /// Whether we transmitted the last time this cell came around
    pub transmitted_before: bool,
}

/// A frame received in the cell
#[derive(Clone, Debug)]
struct Heard {
    source: u64,
    payload: BeaconPayload,
    ratio: f32,
    rx: Instant,
}

impl Heard {
    /// The sender's own entry, the delay from its sync point to its
    /// transmission, in local ticks
    fn own_delay(&self, offset: usize) -> Option<i64> {
        let entry = self.payload.entries.get(offset)?;
        if entry.addr != self.source || entry.tstamp == NOT_MEASURED {
            return None;
        }
        Some(scale_remote(entry.tstamp, self.ratio))
    }

    /// What the sender measured for position `offset`, if it names `addr`
    fn report(&self, offset: usize, addr: u64) -> Option<i32> {
        match self.payload.entries.get(offset) {
            Some(entry) if entry.addr == addr && entry.tstamp != NOT_MEASURED => Some(entry.tstamp),
            _ => None,
        }
    }

    fn prime(&self) -> Option<u64> {
        self.payload.entries.first().map(|entry| entry.addr)
    }
}

/// One node's pass through a location cell
pub struct CellRun {
    update: LocUpdate,
    plan: CellPlan,
    timing: CellTiming,
    /// Arrival of the prime frame, or our own transmission as the prime
    t1: Instant,
    /// Whether `t1` was derived from any reception
    aligned: bool,
    /// Micro-slot of our next transmission
    tx_at: Option<usize>,
    /// Our own delay from `t1` to our transmission
    own_delay: Option<i64>,
    frame_len: usize,
    buf: [u8; MAX_FRAME_LEN],
    received: [Option<(RxInfo, f32)>; MICRO_SLOTS],
    sources: [Option<u64>; MICRO_SLOTS],
    heard: [Option<Heard>; MICRO_SLOTS],
}

impl CellRun {
    /// Prepares the cell starting now
    pub fn begin<R: Radio>(plan: CellPlan, timing: CellTiming, radio: &mut R) -> Result<Self, RadioError<R::Error>> {
        let now = radio.sys_time()?;
        let mut update = LocUpdate::new(plan.dir, plan.slot, plan.offset, plan.indices);
        update.shouldtx = plan.shouldtx && plan.offset < NO_OFFSET;

        let mut run = CellRun {
            t1: now + timing.tx_start,
            aligned: false,
            tx_at: None,
            own_delay: None,
            frame_len: 0,
            buf: [0; MAX_FRAME_LEN],
            received: [None; MICRO_SLOTS],
            sources: [None; MICRO_SLOTS],
            heard: Default::default(),
            update,
            plan,
            timing,
        };

        if run.update.shouldtx {
            let offset = run.plan.offset as usize;
            run.tx_at = Some(offset);
            if offset == 0 {
                let antenna_delay = radio.tx_antenna_delay();
                run.t1 = radio::tx_rmarker(run.t1 - antenna_delay, antenna_delay);
                run.aligned = true;
                run.update.synced = true;
                run.own_delay = Some(0);
                let entry = Entry {
                    addr: run.plan.address,
                    tstamp: 0,
                };
                run.write_frame(radio, 0, &[entry])?;
            } else {
                let entries = run.skeleton();
                run.write_frame(radio, offset as u8, &entries)?;
            }
        }
        Ok(run)
    }

    fn mark(&self, j: usize) -> Instant {
        Instant::wrapping(self.t1.value() + self.timing.grid.value() * j as u64)
    }

    fn skeleton(&self) -> [Entry; CELL_PARTICIPANTS] {
        let mut entries = [Entry::unmeasured(0); CELL_PARTICIPANTS];
        for (entry, &addr) in entries.iter_mut().zip(self.plan.table.iter()) {
            entry.addr = addr;
        }
        if let Some(entry) = entries.get_mut(self.plan.offset as usize) {
            entry.addr = self.plan.address;
        }
        entries
    }

    fn write_frame<R: Radio>(&mut self, radio: &mut R, offset: u8, entries: &[Entry]) -> Result<(), RadioError<R::Error>> {
        let mut buf = [0; MAX_FRAME_LEN];
        let encoded = frame_payload(&self.plan.payload, offset, entries)
            .and_then(|payload| frame::encode(self.plan.address, self.plan.seq, &payload, &mut buf));
        match encoded {
            Ok(len) => {
                self.frame_len = len;
                radio.write_tx(&buf[..len], 0)
            }
            Err(error) => {
                warn!("can't encode beacon: {:?}", error);
                self.tx_at = None;
                self.update.shouldtx = false;
                Ok(())
            }
        }
    }

    fn patch<R: Radio>(&self, radio: &mut R, k: usize, entry: Entry) -> Result<(), RadioError<R::Error>> {
        radio.write_tx(&entry.to_bytes(), frame::entry_offset(k))
    }

    /// Programs micro-slot `j`, handling the frame received in `j - 1`
    pub fn start_slot<R: Radio>(&mut self, radio: &mut R, j: usize) -> Result<(), RadioError<R::Error>> {
        if j > 0 {
            self.peek(radio, j - 1)?;
        }

        if self.tx_at == Some(j) && !self.update.synced {
            info!("not synced to the prime, skipping offset {}", j);
            self.tx_at = None;
            self.update.shouldtx = false;
        }

        if self.tx_at == Some(j) {
            let antenna_delay = radio.tx_antenna_delay();
            let at = self.mark(j) - antenna_delay;
            let delay = radio::tx_rmarker(at, antenna_delay).signed_diff(self.t1);
            if j != 0 && j != FINAL_SLOT {
                self.own_delay = Some(delay);
                let tstamp = delay as i32;
                let prime = self.sources[0].unwrap_or(0);
                let own = self.plan.address;
                self.patch(radio, 0, Entry { addr: prime, tstamp })?;
                self.patch(radio, j, Entry { addr: own, tstamp })?;
            }
            radio.schedule_tx(at, self.frame_len)?;
        } else {
            radio.schedule_rx(self.mark(j) - self.timing.guard, self.timing.rx_timeout)?;
        }

        if j > 0 {
            self.parse(radio, j - 1)?;
        }
        Ok(())
    }

    /// Waits for micro-slot `j` to complete
    ///
    /// Only a bus failure or a late transmission is an error; everything
    /// else just leaves the micro-slot empty.
    pub fn end_slot<R: Radio>(&mut self, radio: &mut R, j: usize) -> Result<(), RadioError<R::Error>> {
        let deadline = self.mark(j + 1) - self.timing.guard;
        match radio::wait_for_trx(radio, deadline) {
            Ok(Trx::Sent(_)) => {
                if j == 0 && self.tx_at == Some(0) {
                    self.tx_at = Some(FINAL_SLOT);
                    let mut entries = self.skeleton();
                    entries[0].tstamp = 0;
                    self.write_frame(radio, FINAL_SLOT as u8, &entries)?;
                }
                Ok(())
            }
            Ok(Trx::Received(info)) => {
                let ratio = radio.clock_offset_ratio()?;
                self.received[j] = Some((info, ratio));
                Ok(())
            }
            Err(RadioError::Timeout) => Ok(()),
            Err(RadioError::Rx) => {
                debug!("rx error at offset {}", j);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Reads the head of the frame received in micro-slot `k`
    fn peek<R: Radio>(&mut self, radio: &mut R, k: usize) -> Result<(), RadioError<R::Error>> {
        let (info, _) = match self.received[k] {
            Some(received) => received,
            None => return Ok(()),
        };
        if info.len < PEEK_LEN || info.len > MAX_FRAME_LEN {
            debug!("frame of {} bytes at offset {}", info.len, k);
            self.received[k] = None;
            return Ok(());
        }

        let mut head = [0; PEEK_LEN];
        radio.read_rx(&mut head, 0)?;
        let peek = match frame::peek(&head) {
            Ok(peek) if peek.offset as usize == k => peek,
            Ok(peek) => {
                debug!("offset {} frame at offset {}", peek.offset, k);
                self.received[k] = None;
                return Ok(());
            }
            Err(error) => {
                debug!("bad frame at offset {}: {:?}", k, error);
                self.received[k] = None;
                return Ok(());
            }
        };
        self.buf[..PEEK_LEN].copy_from_slice(&head);
        self.sources[k] = Some(peek.source);

        if k == 0 && !self.update.synced {
            self.t1 = info.timestamp;
            self.aligned = true;
            self.update.synced = true;
        } else if !self.aligned && k < FINAL_SLOT {
            self.t1 = Instant::wrapping(info.timestamp.value().wrapping_sub(self.timing.grid.value() * k as u64));
            self.aligned = true;
        }

        let reports = match self.tx_at {
            Some(tx_at) => self.update.synced && k > 0 && k < tx_at && k < FINAL_SLOT,
            None => false,
        };
        if reports {
            let tstamp = info.timestamp.signed_diff(self.t1);
            if tstamp >= 0 && tstamp <= i32::MAX as i64 {
                let entry = Entry {
                    addr: peek.source,
                    tstamp: tstamp as i32,
                };
                self.patch(radio, k, entry)?;
            }
        }
        Ok(())
    }

    /// Reads and decodes the rest of the frame received in micro-slot `k`
    fn parse<R: Radio>(&mut self, radio: &mut R, k: usize) -> Result<(), RadioError<R::Error>> {
        let (source, (info, ratio)) = match (self.sources[k], self.received[k]) {
            (Some(source), Some(received)) => (source, received),
            _ => return Ok(()),
        };
        radio.read_rx(&mut self.buf[PEEK_LEN..info.len], PEEK_LEN)?;
        match self.decode(&self.buf[..info.len], source, k) {
            Ok(payload) => {
                self.heard[k] = Some(Heard {
                    source,
                    payload,
                    ratio,
                    rx: info.timestamp,
                })
            }
            Err(error) => debug!("dropping frame at offset {}: {:?}", k, error),
        }
        Ok(())
    }

    fn decode(&self, buf: &[u8], source: u64, k: usize) -> Result<BeaconPayload, FrameError> {
        let (from, payload) = frame::decode(buf)?;
        if from != source || payload.offset as usize != k {
            return Err(FrameError::BadSource);
        }
        if payload.dir != self.update.dir || payload.slot != self.update.slot {
            return Err(FrameError::BadInput("cell"));
        }
        Ok(payload)
    }

    /// Reads the closing frame and fills the timing matrix
    pub fn finish<R: Radio>(mut self, radio: &mut R) -> Result<LocUpdate, RadioError<R::Error>> {
        self.peek(radio, FINAL_SLOT)?;
        self.parse(radio, FINAL_SLOT)?;
        self.collect();
        Ok(self.update)
    }

    fn collect(&mut self) {
        let me = self.update.me();
        let own = self.plan.address;
        let prime = if me == 0 {
            Some(own)
        } else {
            self.heard[0].as_ref().map(|heard| heard.source)
        };

        for i in 0..CELL_PARTICIPANTS {
            if i == me {
                continue;
            }
            if let Some(heard) = &self.heard[i] {
                self.update.new_nbrs[i] = Neighbor::from_payload(heard.source, &heard.payload);
                self.update.new_nbrhood |= 1 << i;
                let same = i == 0 || (prime.is_some() && heard.prime() == prime);
                if same {
                    self.update.same_prime |= 1 << i;
                }
            }
        }
        if me < SELF_COL {
            self.update.new_nbrhood |= 1 << me;
            self.update.same_prime |= 1 << me;
        }

        self.detect_conflicts();

        let delays: [Option<i64>; CELL_PARTICIPANTS] = core::array::from_fn(|i| self.delay_of(i));
        let same_prime = self.update.same_prime;
        let same = |i: usize| same_prime & 1 << i != 0;

        let closing = match (&self.heard[FINAL_SLOT], prime) {
            (Some(closing), Some(prime)) if closing.source == prime => Some(closing),
            (Some(_), Some(_)) => {
                info!("prime changed within the cell");
                None
            }
            _ => None,
        };

        for j in 1..CELL_PARTICIPANTS {
            let (delay, addr) = match (delays[j], self.address_of(j)) {
                (Some(delay), Some(addr)) if same(j) => (delay, addr),
                _ => continue,
            };
            if me == 0 {
                if let Some(heard) = &self.heard[j] {
                    self.update.record(0, j, heard.rx.signed_diff(self.t1) - delay);
                }
            } else if let Some(closing) = closing {
                if let Some(tstamp) = closing.report(j, addr) {
                    self.update.record(0, j, scale_remote(tstamp, closing.ratio) - delay);
                }
            }
        }

        for j in 2..CELL_PARTICIPANTS {
            for i in 1..j {
                if i == me || j == me || !same(i) || !same(j) {
                    continue;
                }
                let (reporter, subject, delay) = match (&self.heard[j], &self.heard[i], delays[i]) {
                    (Some(reporter), Some(subject), Some(delay)) => (reporter, subject, delay),
                    _ => continue,
                };
                if let Some(tstamp) = reporter.report(i, subject.source) {
                    self.update.record(i, j, scale_remote(tstamp, reporter.ratio) - delay);
                }
            }
        }

        if self.update.synced && me != 0 {
            for j in 1..CELL_PARTICIPANTS {
                if j == me || !same(j) {
                    continue;
                }
                if let (Some(heard), Some(delay)) = (&self.heard[j], delays[j]) {
                    self.update.record(j, SELF_COL, heard.rx.signed_diff(self.t1) - delay);
                }
            }
        }

        if self.heard[FINAL_SLOT].is_some() && closing.is_none() && prime.is_some() {
            self.update.adj = 0;
        }
        self.update.restrict_adj();
    }

    /// Address of the node at position `i`, if we heard it or are it
    fn address_of(&self, i: usize) -> Option<u64> {
        if i == self.update.me() {
            Some(self.plan.address)
        } else {
            self.heard[i].as_ref().map(|heard| heard.source)
        }
    }

    /// Delay of position `i` from its sync point to its transmission
    fn delay_of(&self, i: usize) -> Option<i64> {
        if i == 0 {
            Some(0)
        } else if i == self.update.me() {
            self.own_delay
        } else {
            self.heard[i].as_ref().and_then(|heard| heard.own_delay(i))
        }
    }

    fn detect_conflicts(&mut self) {
        let o = self.plan.offset as usize;
        if o >= CELL_PARTICIPANTS {
            return;
        }
        let own = self.plan.address;
        for (j, heard) in self.heard.iter().enumerate() {
            let heard = match heard {
                Some(heard) if j != o => heard,
                _ => continue,
            };
            let entry = match heard.payload.entries.get(o) {
                Some(entry) => entry,
                None => continue,
            };
            let bit = if j == FINAL_SLOT { 0 } else { j };
            let stranger = entry.addr != own && entry.addr != 0;
            let later = o < j;
            if later && self.update.shouldtx && stranger && entry.tstamp != NOT_MEASURED {
                info!("offset {} heard {:x} in our place", j, entry.addr);
                self.update.conflicts |= 1 << bit;
            } else if !later && self.plan.transmitted_before && stranger {
                info!("offset {} expects {:x} in our place", j, entry.addr);
                self.update.conflicts |= 1 << bit;
            }
        }
    }
}

/// Our frame for micro-slot `offset`, carrying `entries`
fn frame_payload(template: &BeaconPayload, offset: u8, entries: &[Entry]) -> Result<BeaconPayload, FrameError> {
    let mut payload = template.clone();
    payload.offset = offset;
    payload.entries = heapless::Vec::from_slice(entries).map_err(|_| FrameError::BadInput("entries"))?;
    Ok(payload)
}

/// Runs a whole cell on one node
///
/// Returns `None` when the cell had to be abandoned.
pub fn run_cell<R: Radio>(plan: CellPlan, timing: CellTiming, radio: &mut R) -> Option<LocUpdate> {
    match try_run_cell(plan, timing, radio) {
        Ok(update) => Some(update),
        Err(RadioError::TxLate) => {
            warn!("transmission missed its deadline, cell abandoned");
            None
        }
        Err(_) => {
            warn!("radio failure, cell abandoned");
            let _ = radio.abort();
            None
        }
    }
}

fn try_run_cell<R: Radio>(plan: CellPlan, timing: CellTiming, radio: &mut R) -> Result<LocUpdate, RadioError<R::Error>> {
    let mut run = CellRun::begin(plan, timing, radio)?;
    for j in 0..MICRO_SLOTS {
        run.start_slot(radio, j)?;
        run.end_slot(radio, j)?;
    }
    run.finish(radio)
}
