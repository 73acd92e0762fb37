//! Beacon election
//!
//! Decides whether this node transmits as a location beacon, when, and with
//! which lattice index. Nodes that want an index wait a random number of
//! cells scaled by their distance to the ideal lattice point, so the closest
//! candidate usually wins. Collisions detected in location cells feed a
//! binary exponential back-off.

use rand_core::RngCore;

use crate::{
    info,
    lattice::{NUM_DIRS, NUM_INDICES},
};

pub const BACKOFF_MIN: u8 = 1;
pub const BACKOFF_MAX: u8 = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconState {
    Silent,
    /// Waiting for the start timer, or transmitting without having been
    /// confirmed yet
    Joining,
    Joined,
    /// Index set from outside, immune to START and STOP
    Forced,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconEvent {
    /// Apply for `index`; `distance` to its ideal point orders contenders
    Start { index: u8, distance: f32 },
    Stop,
    /// Remember an index without transmitting
    SetIndex(u8),
    ForceIndex(u8),
    Joined,
    Allow,
    Disallow,
}

/// Uniform draw from `0..limit` without modulo bias
pub fn uniform<G: RngCore>(rng: &mut G, limit: u32) -> u32 {
    if limit <= 1 {
        return 0;
    }
    let zone = u32::MAX - (u32::MAX - limit + 1) % limit;
    loop {
        let value = rng.next_u32();
        if value <= zone {
            return value % limit;
        }
    }
}

/// Uniform draw from `[0, 1)`
fn unit<G: RngCore>(rng: &mut G) -> f32 {
    (rng.next_u32() >> 8) as f32 / (1 << 24) as f32
}

/// Cells to wait before the first transmission
///
/// `12x + 4x·U(0, 1)` with `x` the distance in half lattice spacings.
pub fn rand_delay<G: RngCore>(rng: &mut G, distance: f32, lattice_r: f32) -> u16 {
    let x = (distance / (lattice_r / 2.0)).max(0.0);
    let cells = 12.0 * x + 4.0 * x * unit(rng);
    if cells.is_finite() {
        libm::roundf(cells).min(u16::MAX as f32) as u16
    } else {
        u16::MAX
    }
}

/// Binary exponential back-off, counted in transmit opportunities
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Backoff {
    limit: u8,
    wait: u8,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            limit: BACKOFF_MIN,
            wait: 0,
        }
    }
}

impl Backoff {
    pub fn limit(&self) -> u8 {
        self.limit
    }

    pub fn wait(&self) -> u8 {
        self.wait
    }

    /// Doubles the window and draws a new wait from it
    pub fn fail<G: RngCore>(&mut self, rng: &mut G) {
        self.limit = (self.limit * 2).min(BACKOFF_MAX);
        self.wait = uniform(rng, self.limit as u32) as u8;
    }

    pub fn success(&mut self) {
        *self = Backoff::default();
    }

    /// Consumes one opportunity, returns whether it may be used
    pub fn permits(&mut self) -> bool {
        if self.wait == 0 {
            true
        } else {
            self.wait -= 1;
            false
        }
    }
}

/// Beacon side of a node
///
/// No next state is stored. The only deferred transition is a start, held as
/// `Joining` with a running `start_timer`; every other event takes effect in
/// [`handle`](Self::handle) at once.
#[derive(Clone, Debug)]
pub struct Beacon {
    state: BeaconState,
    index: Option<u8>,
    tx_history: u32,
    start_timer: u16,
    allow: bool,
    backoff: Backoff,
}

impl Default for Beacon {
    fn default() -> Self {
        Beacon {
            state: BeaconState::Silent,
            index: None,
            tx_history: 0,
            start_timer: 0,
            allow: true,
            backoff: Backoff::default(),
        }
    }
}

impl Beacon {
    pub fn state(&self) -> BeaconState {
        self.state
    }

    pub fn index(&self) -> Option<u8> {
        self.index
    }

    pub fn start_timer(&self) -> u16 {
        self.start_timer
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    /// Whether the node currently claims its index on air
    pub fn is_active(&self) -> bool {
        match self.state {
            BeaconState::Joining | BeaconState::Joined | BeaconState::Forced => self.index.is_some(),
            BeaconState::Silent => false,
        }
    }

    fn set_state(&mut self, state: BeaconState) {
        if state != self.state {
            info!("beacon {:?} -> {:?}, index {:?}", self.state, state, self.index);
            self.state = state;
        }
    }

    pub fn handle<G: RngCore>(&mut self, event: BeaconEvent, rng: &mut G, lattice_r: f32) {
        match event {
            BeaconEvent::Start { index, distance } => {
                if self.state == BeaconState::Forced || !self.allow || index as usize >= NUM_INDICES {
                    return;
                }
                let restart = match self.state {
                    BeaconState::Silent => true,
                    _ => self.index != Some(index),
                };
                if restart {
                    self.index = Some(index);
                    self.tx_history = 0;
                    self.backoff.success();
                    self.start_timer = rand_delay(rng, distance, lattice_r);
                    self.set_state(BeaconState::Joining);
                }
            }
            BeaconEvent::Stop => {
                if self.state != BeaconState::Forced {
                    self.start_timer = 0;
                    self.set_state(BeaconState::Silent);
                }
            }
            BeaconEvent::SetIndex(index) => {
                if self.state != BeaconState::Forced && (index as usize) < NUM_INDICES {
                    self.index = Some(index);
                }
            }
            BeaconEvent::ForceIndex(index) => {
                if (index as usize) < NUM_INDICES {
                    self.index = Some(index);
                    self.tx_history = 0;
                    self.backoff.success();
                    self.set_state(BeaconState::Forced);
                }
            }
            BeaconEvent::Joined => {
                if self.state == BeaconState::Joining {
                    self.set_state(BeaconState::Joined);
                }
            }
            BeaconEvent::Allow => self.allow = true,
            BeaconEvent::Disallow => {
                self.allow = false;
                self.start_timer = 0;
                self.set_state(BeaconState::Silent);
            }
        }
    }

    /// Asks to transmit in the current cell
    ///
    /// Counts down the start timer of a joining beacon and consumes one
    /// back-off opportunity.
    pub fn try_tx(&mut self) -> bool {
        if self.index.is_none() {
            return false;
        }
        let eligible = match self.state {
            BeaconState::Joined | BeaconState::Forced => true,
            BeaconState::Joining if self.start_timer == 0 => true,
            BeaconState::Joining => {
                self.start_timer -= 1;
                false
            }
            BeaconState::Silent => false,
        };
        eligible && self.backoff.permits()
    }

    /// Reports a collision at our offset
    pub fn fail<G: RngCore>(&mut self, rng: &mut G) {
        self.backoff.fail(rng);
        info!(
            "beacon collision, back-off limit {} wait {}",
            self.backoff.limit, self.backoff.wait
        );
    }

    pub fn success(&mut self) {
        self.backoff.success();
    }

    fn history_bit(slot: u8, dir: u8) -> u32 {
        1 << ((slot as u32 * NUM_DIRS as u32 + dir as u32) & 31)
    }

    /// Notes that we transmitted in cell `(slot, dir)`
    pub fn record_tx(&mut self, slot: u8, dir: u8) {
        self.tx_history |= Self::history_bit(slot, dir);
    }

    /// Whether we transmitted the last time cell `(slot, dir)` came around
    pub fn transmitted(&self, slot: u8, dir: u8) -> bool {
        self.tx_history & Self::history_bit(slot, dir) != 0
    }

    /// Clears the history bit of a cell we stayed silent in
    pub fn clear_tx(&mut self, slot: u8, dir: u8) {
        self.tx_history &= !Self::history_bit(slot, dir);
    }
}
