//! Measurements collected in one location cell
//!
//! The seven positions of a cell are the six participant offsets plus
//! [`SELF_COL`], which stands for this node while it only listens. Pair
//! timings between positions live in a compact upper-triangular matrix
//! `tstamps[i, j]`, `i < j`, with one adjacency bit per pair telling whether
//! the entry holds a usable measurement.
//!
//! Right after capture the matrix holds raw timings in radio ticks:
//!
//! - `t[0, j]`: twice the distance between the prime and `j`, as measured by
//!   the prime's round trip
//! - `t[i, j]`, `1 ≤ i < j ≤ 5`: `d(i, j) + d(0, i) − d(0, j)`, as measured
//!   by `j` from its own sync point
//! - `t[i, 6]`: `d(0, i) + d(i, self) − d(0, self)`, as measured by this
//!   node
//!
//! [`LocUpdate::prepare_tstamps`] turns them into distances and, for a node
//! that only listened, pseudoranges `d(i, self) − d(0, self)`.

use dw1000::time::TIME_RES;

use super::neighbors::Neighbor;
use crate::lattice::{CELL_PARTICIPANTS, NO_OFFSET};

/// Positions in a cell: six participants and the listening node
pub const NUM_POSITIONS: usize = CELL_PARTICIPANTS + 1;

/// Entries of the upper-triangular timing matrix
pub const NUM_PAIRS: usize = NUM_POSITIONS * (NUM_POSITIONS - 1) / 2;

/// Column of a node that doesn't transmit in the cell
pub const SELF_COL: usize = CELL_PARTICIPANTS;

const SPEED_OF_LIGHT: f32 = 299_792_458.0;

/// Meters travelled by radio in one DW1000 tick
pub const RADIO_TICK_M: f32 = TIME_RES * SPEED_OF_LIGHT;

/// Storage index of pair `(i, j)`, symmetric in its arguments
///
/// Pairs are stored column by column, so `(0, 1)` comes first and `(5, 6)`
/// last. `i` and `j` must differ.
pub fn compact_triu_index(i: usize, j: usize) -> usize {
    let (i, j) = if i < j { (i, j) } else { (j, i) };
    j * (j - 1) / 2 + i
}

/// Scales a duration measured by a remote clock into local ticks
pub fn scale_remote(ticks: i32, ratio: f32) -> i64 {
    ticks as i64 - libm::roundf(ticks as f32 * ratio) as i64
}

/// Scratchpad of one location cell
#[derive(Clone, Debug)]
pub struct LocUpdate {
    pub dir: u8,
    pub slot: u8,
    /// Our participation offset, `NO_OFFSET` if our index isn't in the cell
    pub offset: u8,
    /// Whether we transmitted at `offset`
    pub shouldtx: bool,
    /// Offsets (bit 0 for the prime and its closing frame) that reported
    /// another node in our place
    pub conflicts: u8,
    /// Positions heard, plus [`SELF_COL`] and our own offset
    pub new_nbrhood: u8,
    /// Participants whose frames named the same prime as ours
    pub same_prime: u8,
    pub adj: u32,
    pub new_nbrs: [Neighbor; CELL_PARTICIPANTS],
    /// Lattice indices of the participants
    pub indices: [u8; CELL_PARTICIPANTS],
    pub tstamps: [i32; NUM_PAIRS],
    /// Whether our cell timing was taken from the prime's frame
    pub synced: bool,
    /// Whether [`SELF_COL`] holds distances rather than pseudoranges
    pub measured: bool,
}

impl LocUpdate {
    pub fn new(dir: u8, slot: u8, offset: u8, indices: [u8; CELL_PARTICIPANTS]) -> Self {
        LocUpdate {
            dir,
            slot,
            offset,
            shouldtx: false,
            conflicts: 0,
            new_nbrhood: 1 << SELF_COL,
            same_prime: 0,
            adj: 0,
            new_nbrs: [Neighbor::default(); CELL_PARTICIPANTS],
            indices,
            tstamps: [0; NUM_PAIRS],
            synced: false,
            measured: false,
        }
    }

    /// Position this node occupies in the matrix
    pub fn me(&self) -> usize {
        if self.shouldtx && self.offset < NO_OFFSET {
            self.offset as usize
        } else {
            SELF_COL
        }
    }

    pub fn heard(&self, i: usize) -> bool {
        i < CELL_PARTICIPANTS && i != self.me() && self.new_nbrhood & 1 << i != 0
    }

    pub fn is_adj(&self, i: usize, j: usize) -> bool {
        i != j && self.adj & 1 << compact_triu_index(i, j) != 0
    }

    pub fn set_adj(&mut self, i: usize, j: usize, valid: bool) {
        if i == j {
            return;
        }
        let bit = 1 << compact_triu_index(i, j);
        if valid {
            self.adj |= bit;
        } else {
            self.adj &= !bit;
        }
    }

    pub fn tstamp(&self, i: usize, j: usize) -> i32 {
        self.tstamps[compact_triu_index(i, j)]
    }

    pub fn set_tstamp(&mut self, i: usize, j: usize, value: i32) {
        if i != j {
            self.tstamps[compact_triu_index(i, j)] = value;
        }
    }

    /// Stores a measurement and marks the pair usable
    ///
    /// Values that don't fit an `i32` are discarded.
    pub fn record(&mut self, i: usize, j: usize, value: i64) {
        if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
            self.set_tstamp(i, j, value as i32);
            self.set_adj(i, j, true);
        }
    }

    /// Number of participants other than the prime whose frames named our
    /// prime
    pub fn same_prime_count(&self) -> u32 {
        (self.same_prime & 0x3e).count_ones()
    }

    /// Clears every pair that involves a position not heard in the cell
    pub fn restrict_adj(&mut self) {
        for j in 1..NUM_POSITIONS {
            for i in 0..j {
                if self.new_nbrhood & 1 << i == 0 || self.new_nbrhood & 1 << j == 0 {
                    self.set_adj(i, j, false);
                }
            }
        }
    }

    /// Turns raw timings into distances and pseudoranges
    pub fn prepare_tstamps(&mut self) {
        let me = self.me();

        for i in 1..CELL_PARTICIPANTS {
            let half = self.tstamp(0, i) / 2;
            self.set_tstamp(0, i, half);
        }

        // Our own measurements move from the listener column to our offset
        if me > 0 && me < SELF_COL {
            for i in 1..CELL_PARTICIPANTS {
                if i == me {
                    continue;
                }
                let raw = self.tstamp(i, SELF_COL);
                let usable = self.is_adj(i, SELF_COL);
                if i < me {
                    self.set_tstamp(i, me, raw);
                    self.set_adj(i, me, usable);
                } else {
                    let usable = usable && self.is_adj(0, i) && self.is_adj(0, me);
                    let shift = 2 * (self.tstamp(0, i) as i64 - self.tstamp(0, me) as i64);
                    self.set_adj(me, i, false);
                    if usable {
                        self.record(me, i, raw as i64 - shift);
                    }
                }
            }
        }

        for j in 2..CELL_PARTICIPANTS {
            for i in 1..j {
                if self.is_adj(0, i) && self.is_adj(0, j) && self.is_adj(i, j) {
                    let value = self.tstamp(i, j) as i64 + self.tstamp(0, j) as i64 - self.tstamp(0, i) as i64;
                    self.set_adj(i, j, false);
                    self.record(i, j, value);
                } else {
                    self.set_adj(i, j, false);
                }
            }
        }

        for i in 0..CELL_PARTICIPANTS {
            if me != SELF_COL || i == 0 || !self.is_adj(0, i) {
                self.set_adj(i, SELF_COL, false);
            } else if self.is_adj(i, SELF_COL) {
                let value = self.tstamp(i, SELF_COL) as i64 - self.tstamp(0, i) as i64;
                self.set_adj(i, SELF_COL, false);
                self.record(i, SELF_COL, value);
            }
        }
    }

    /// Converts the pseudoranges of a listening node into distances, given
    /// its time of flight to the prime
    pub fn apply_prime_distance(&mut self, tof: i32) {
        for i in 1..CELL_PARTICIPANTS {
            if self.is_adj(i, SELF_COL) {
                let value = self.tstamp(i, SELF_COL) as i64 + tof as i64;
                self.set_adj(i, SELF_COL, false);
                self.record(i, SELF_COL, value);
            }
        }
        self.set_tstamp(0, SELF_COL, tof);
        self.set_adj(0, SELF_COL, true);
        self.new_nbrhood |= 1 << SELF_COL;
        self.measured = true;
    }

    /// Distance in meters between two positions
    pub fn distance_m(&self, i: usize, j: usize) -> f32 {
        self.tstamp(i, j) as f32 * RADIO_TICK_M
    }

    /// Whether `t[i, j]` is a distance rather than a pseudorange
    pub fn is_distance(&self, i: usize, j: usize) -> bool {
        i.max(j) != SELF_COL || self.measured
    }
}
