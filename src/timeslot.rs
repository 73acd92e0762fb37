//! Timeslot grid
//!
//! Time is kept by a 24-bit real-time counter running at 32768 Hz, extended
//! in software to 64 bits. Slot boundaries are expressed in microseconds
//! modulo [`TS_PERIOD`], which is exactly 2^53 counter ticks, so the
//! microsecond clock wraps together with the extended counter.
//!
//! The grid holds up to [`MAX_SLOTFRAMES`] slotframes, each repeating every
//! `numslots` cells of [`TS_CELL_LENGTH_US`]. Slot `index` of a slotframe is
//! active in every cell whose absolute slot number (ASN) satisfies
//! `asn mod numslots == index`. After each slot the grid arms the counter's
//! compare interrupt for the closest upcoming slot; the interrupt handler
//! calls [`TimeslotGrid::fire`] and runs the returned handler.

use heapless::Vec;

use crate::{debug, warn};

/// Length of one cell
pub const TS_CELL_LENGTH_US: u64 = 2500;

/// Period of the microsecond clock
pub const TS_PERIOD: u64 = 274_877_906_944_000_000;

/// One counter tick, rounded up to whole microseconds
pub const RTC_TICK_US: u64 = 31;

pub const MAX_SLOTFRAMES: usize = 4;
pub const MAX_SLOTS: usize = 8;

const RTC_WRAP: u64 = 1 << 24;
const TICKS_PERIOD: u64 = 1 << 53;

/// The real-time counter driving the grid
///
/// Besides the 32 kHz counter the implementation owns a fast timer chained
/// to the compare event, which delays the interrupt by the sub-tick
/// remainder.
pub trait Rtc {
    /// Current value of the 24-bit counter
    fn counter(&self) -> u32;

    /// Whether the counter wrapped since the flag was last cleared
    fn overflow_pending(&self) -> bool;

    fn clear_overflow(&mut self);

    /// Raises the slot interrupt `fine_us` microseconds after the counter
    /// reaches `ticks`
    fn set_compare(&mut self, ticks: u32, fine_us: u16);

    fn disable_compare(&mut self);

    /// Masks the slot interrupt
    fn lock(&mut self);

    fn unlock(&mut self);
}

/// Converts counter ticks to microseconds without overflowing
pub fn ticks_to_us(ticks: u64) -> u64 {
    (ticks >> 9) * 15625 + (((ticks & 511) * 15625) >> 9)
}

/// Converts microseconds to counter ticks, rounding down
pub fn us_to_ticks(us: u64) -> u64 {
    ((us / 15625) << 9) + (((us % 15625) << 9) / 15625)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GridError {
    TooManySlotframes,
    TooManySlots,
    SlotOccupied,
    IndexOutOfRange,
    NoSuchSlotframe,
    NoSuchSlot,
}

/// What a slot is used for
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotFlags(pub u8);

impl SlotFlags {
    pub const TX: SlotFlags = SlotFlags(1 << 0);
    pub const RX: SlotFlags = SlotFlags(1 << 1);
    /// Several nodes may transmit
    pub const SHARED: SlotFlags = SlotFlags(1 << 2);
}

impl core::ops::BitOr for SlotFlags {
    type Output = SlotFlags;

    fn bitor(self, rhs: SlotFlags) -> SlotFlags {
        SlotFlags(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot<H> {
    index: u16,
    flags: SlotFlags,
    handler: H,
}

#[derive(Debug)]
struct Slotframe<H> {
    id: u16,
    numslots: u16,
    slots: Vec<Slot<H>, MAX_SLOTS>,
}

/// The slot the compare interrupt is armed for
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Upcoming {
    slotframe: u16,
    index: u16,
    asn: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Armed {
    PowerUp(Upcoming),
    Slot(Upcoming),
}

#[derive(Clone, Copy, Debug, Default)]
struct Power {
    up_us: u64,
    down_us: u64,
    asleep: bool,
}

/// A slot that just started
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlotEvent<H> {
    pub slotframe: u16,
    pub index: u16,
    pub flags: SlotFlags,
    pub handler: H,
    pub asn: u64,
    /// Nominal start of the slot
    pub start_us: u64,
    /// The gap to the next slot is long enough to power the radio down
    /// once the handler returns
    pub power_down: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GridEvent<H> {
    /// The radio has to be powered up for the next slot
    PowerUp,
    Slot(SlotEvent<H>),
}

pub struct TimeslotGrid<H, R> {
    rtc: R,
    overflows: u64,
    tasn0: u64,
    last_slot_us: u64,
    slotframes: Vec<Slotframe<H>, MAX_SLOTFRAMES>,
    armed: Option<Armed>,
    power: Option<Power>,
}

impl<H, R> TimeslotGrid<H, R>
where
    H: Copy,
    R: Rtc,
{
    pub fn new(rtc: R) -> Self {
        TimeslotGrid {
            rtc,
            overflows: 0,
            tasn0: 0,
            last_slot_us: 0,
            slotframes: Vec::new(),
            armed: None,
            power: None,
        }
    }

    pub fn rtc(&self) -> &R {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut R {
        &mut self.rtc
    }

    /// Runs `f` with the slot interrupt masked
    fn locked<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.rtc.lock();
        let result = f(self);
        self.rtc.unlock();
        result
    }

    /// Extended counter value
    fn now_ticks(&mut self) -> u64 {
        if self.rtc.overflow_pending() {
            self.rtc.clear_overflow();
            self.overflows += 1;
        }
        let mut counter = self.rtc.counter() as u64;
        // Wrapped between the check and the read.
        if self.rtc.overflow_pending() && counter < RTC_WRAP / 2 {
            self.rtc.clear_overflow();
            self.overflows += 1;
            counter = self.rtc.counter() as u64;
        }
        ((self.overflows * RTC_WRAP) | counter) % TICKS_PERIOD
    }

    /// Monotonic time in microseconds, modulo [`TS_PERIOD`]
    pub fn now(&mut self) -> u64 {
        ticks_to_us(self.now_ticks())
    }

    /// The current ASN
    ///
    /// Rounds up by one counter tick, so a call made right at a slot start
    /// isn't attributed to the previous cell.
    pub fn asn_now(&mut self) -> u64 {
        let now = self.now();
        self.asn_at(now + RTC_TICK_US)
    }

    fn asn_at(&self, us: u64) -> u64 {
        ((us + TS_PERIOD - self.tasn0) % TS_PERIOD) / TS_CELL_LENGTH_US
    }

    /// Start of cell `asn`
    pub fn asn_start(&self, asn: u64) -> u64 {
        (self.tasn0 + asn % (TS_PERIOD / TS_CELL_LENGTH_US) * TS_CELL_LENGTH_US) % TS_PERIOD
    }

    /// Start of the slot that fired last
    pub fn last_slot_start(&self) -> u64 {
        self.last_slot_us
    }

    /// Makes cell `asn` start at `tstamp_us`
    pub fn sync(&mut self, asn: u64, tstamp_us: u64) {
        let offset = asn % (TS_PERIOD / TS_CELL_LENGTH_US) * TS_CELL_LENGTH_US;
        self.tasn0 = (tstamp_us % TS_PERIOD + TS_PERIOD - offset) % TS_PERIOD;
        debug!("grid synced, asn {} at {} us", asn, tstamp_us);
        self.locked(Self::reschedule);
    }

    /// Shifts every slot boundary by `delta_us`
    pub fn offset(&mut self, delta_us: i64) {
        let shift = |t: u64| (t as i128 + delta_us as i128).rem_euclid(TS_PERIOD as i128) as u64;
        self.tasn0 = shift(self.tasn0);
        self.last_slot_us = shift(self.last_slot_us);
        self.locked(Self::reschedule);
    }

    /// Registers a power-up lead time of `up_us` and the time `down_us` it
    /// takes to power down
    ///
    /// From then on the grid reports when the radio can sleep between slots
    /// and emits [`GridEvent::PowerUp`] `up_us` before the next slot.
    pub fn config_power(&mut self, up_us: u32, down_us: u32) {
        self.power = Some(Power {
            up_us: up_us as u64,
            down_us: down_us as u64,
            asleep: false,
        });
    }

    /// Sets the power-up lead time alone
    ///
    /// The grid has no power-up callback: the caller wakes the radio when
    /// [`fire`](Self::fire) returns [`GridEvent::PowerUp`], `up_us` ahead of
    /// the slot.
    pub fn config_power_up(&mut self, up_us: u32) {
        let down_us = self.power.map_or(0, |p| p.down_us as u32);
        self.config_power(up_us, down_us);
    }

    /// Sets the power-down time alone
    ///
    /// In place of a power-down callback, [`SlotEvent::power_down`] tells the
    /// caller to put the radio to sleep once the slot handler returns.
    pub fn config_power_down(&mut self, down_us: u32) {
        let up_us = self.power.map_or(0, |p| p.up_us as u32);
        self.config_power(up_us, down_us);
    }

    /// Adds a slotframe; adding an existing id does nothing
    pub fn slotframe_add(&mut self, id: u16, numslots: u16) -> Result<(), GridError> {
        if numslots == 0 {
            return Err(GridError::IndexOutOfRange);
        }
        self.locked(|grid| {
            let position = match grid.slotframes.binary_search_by_key(&id, |sf| sf.id) {
                Ok(_) => return Ok(()),
                Err(position) => position,
            };
            grid.slotframes
                .insert(
                    position,
                    Slotframe {
                        id,
                        numslots,
                        slots: Vec::new(),
                    },
                )
                .map_err(|_| GridError::TooManySlotframes)?;
            grid.reschedule();
            Ok(())
        })
    }

    pub fn slotframe_remove(&mut self, id: u16) -> Result<(), GridError> {
        self.locked(|grid| {
            let position = grid.slotframe_position(id)?;
            grid.slotframes.remove(position);
            grid.reschedule();
            Ok(())
        })
    }

    pub fn slot_add(&mut self, slotframe: u16, flags: SlotFlags, index: u16, handler: H) -> Result<(), GridError> {
        self.locked(|grid| {
            let sf = grid.slotframe_position(slotframe)?;
            let sf = &mut grid.slotframes[sf];
            if index >= sf.numslots {
                return Err(GridError::IndexOutOfRange);
            }
            let position = match sf.slots.binary_search_by_key(&index, |slot| slot.index) {
                Ok(_) => return Err(GridError::SlotOccupied),
                Err(position) => position,
            };
            sf.slots
                .insert(position, Slot { index, flags, handler })
                .map_err(|_| GridError::TooManySlots)?;
            grid.reschedule();
            Ok(())
        })
    }

    pub fn slot_remove(&mut self, slotframe: u16, index: u16) -> Result<(), GridError> {
        self.locked(|grid| {
            let sf = grid.slotframe_position(slotframe)?;
            let slots = &mut grid.slotframes[sf].slots;
            let position = slots
                .binary_search_by_key(&index, |slot| slot.index)
                .map_err(|_| GridError::NoSuchSlot)?;
            slots.remove(position);
            grid.reschedule();
            Ok(())
        })
    }

    /// First unoccupied index of a slotframe
    pub fn slotframe_next_free(&self, slotframe: u16) -> Option<u16> {
        let sf = self.slotframes.iter().find(|sf| sf.id == slotframe)?;
        (0..sf.numslots).find(|index| sf.slots.iter().all(|slot| slot.index != *index))
    }

    /// Indices of the slots in a slotframe, in ascending order
    pub fn slots(&self, slotframe: u16) -> impl Iterator<Item = u16> + '_ {
        self.slotframes
            .iter()
            .filter(move |sf| sf.id == slotframe)
            .flat_map(|sf| sf.slots.iter().map(|slot| slot.index))
    }

    fn slotframe_position(&self, id: u16) -> Result<usize, GridError> {
        self.slotframes
            .binary_search_by_key(&id, |sf| sf.id)
            .map_err(|_| GridError::NoSuchSlotframe)
    }

    fn find_slot(&self, slotframe: u16, index: u16) -> Option<Slot<H>> {
        let sf = self.slotframes.iter().find(|sf| sf.id == slotframe)?;
        sf.slots.iter().find(|slot| slot.index == index).copied()
    }

    /// The closest slot starting at or after cell `from_asn`
    ///
    /// Ties go to the slotframe with the lower id.
    fn next_event(&self, from_asn: u64) -> Option<Upcoming> {
        let mut best: Option<(u64, Upcoming)> = None;
        for sf in &self.slotframes {
            let numslots = sf.numslots as u64;
            let base = from_asn % numslots;
            for slot in &sf.slots {
                let cells = (slot.index as u64 + numslots - base) % numslots;
                if best.map_or(true, |(fewest, _)| cells < fewest) {
                    best = Some((
                        cells,
                        Upcoming {
                            slotframe: sf.id,
                            index: slot.index,
                            asn: from_asn + cells,
                        },
                    ));
                }
            }
        }
        best.map(|(_, upcoming)| upcoming)
    }

    fn reschedule(&mut self) {
        let asn = self.asn_now();
        let upcoming = self.next_event(asn + 1);
        self.arm_for(upcoming);
    }

    fn arm_for(&mut self, upcoming: Option<Upcoming>) {
        let upcoming = match upcoming {
            Some(upcoming) => upcoming,
            None => {
                self.armed = None;
                self.rtc.disable_compare();
                return;
            }
        };
        let armed = match self.power {
            Some(power) if power.asleep => Armed::PowerUp(upcoming),
            _ => Armed::Slot(upcoming),
        };
        self.arm(armed);
    }

    fn arm(&mut self, armed: Armed) {
        let deadline = match armed {
            Armed::Slot(upcoming) => self.asn_start(upcoming.asn),
            Armed::PowerUp(upcoming) => {
                let lead = self.power.map_or(0, |p| p.up_us);
                (self.asn_start(upcoming.asn) + TS_PERIOD - lead) % TS_PERIOD
            }
        };
        self.armed = Some(armed);

        let now_ticks = self.now_ticks();
        let now = ticks_to_us(now_ticks);
        let ahead = (deadline + TS_PERIOD - now) % TS_PERIOD;
        if ahead == 0 || ahead > TS_PERIOD / 2 {
            warn!("slot deadline {} us passed at {} us, running late", deadline, now);
            self.rtc.set_compare(((now_ticks + 1) % RTC_WRAP) as u32, 0);
            return;
        }

        let target = now + ahead;
        let ticks = us_to_ticks(target);
        let fine = target - ticks_to_us(ticks);
        self.rtc.set_compare((ticks % RTC_WRAP) as u32, fine as u16);
    }

    /// Handles the slot interrupt
    ///
    /// Returns what's due and arms the interrupt for the following event.
    /// Returns `None` for spurious interrupts and for slots removed after
    /// they were armed.
    pub fn fire(&mut self) -> Option<GridEvent<H>> {
        let armed = self.armed.take()?;
        let upcoming = match armed {
            Armed::PowerUp(upcoming) => {
                if let Some(power) = self.power.as_mut() {
                    power.asleep = false;
                }
                self.arm(Armed::Slot(upcoming));
                return Some(GridEvent::PowerUp);
            }
            Armed::Slot(upcoming) => upcoming,
        };

        let slot = match self.find_slot(upcoming.slotframe, upcoming.index) {
            Some(slot) => slot,
            None => {
                self.reschedule();
                return None;
            }
        };
        let start_us = self.asn_start(upcoming.asn);
        self.last_slot_us = start_us;

        let next = self.next_event(upcoming.asn + 1);
        let power_down = match (self.power.as_mut(), next) {
            (Some(power), Some(next)) => {
                let idle = (next.asn - upcoming.asn - 1) * TS_CELL_LENGTH_US;
                power.asleep = idle > power.up_us + power.down_us;
                power.asleep
            }
            _ => false,
        };
        self.arm_for(next);

        Some(GridEvent::Slot(SlotEvent {
            slotframe: upcoming.slotframe,
            index: upcoming.index,
            flags: slot.flags,
            handler: slot.handler,
            asn: upcoming.asn,
            start_us,
            power_down,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockRtc {
        counter: u32,
        overflow: bool,
        compare: Option<(u32, u16)>,
        locks: u32,
        unlocks: u32,
    }

    impl MockRtc {
        fn set_us(&mut self, us: u64) {
            self.counter = (us_to_ticks(us) % RTC_WRAP) as u32;
        }
    }

    impl Rtc for MockRtc {
        fn counter(&self) -> u32 {
            self.counter
        }

        fn overflow_pending(&self) -> bool {
            self.overflow
        }

        fn clear_overflow(&mut self) {
            self.overflow = false;
        }

        fn set_compare(&mut self, ticks: u32, fine_us: u16) {
            self.compare = Some((ticks, fine_us));
        }

        fn disable_compare(&mut self) {
            self.compare = None;
        }

        fn lock(&mut self) {
            self.locks += 1;
        }

        fn unlock(&mut self) {
            self.unlocks += 1;
        }
    }

    fn grid() -> TimeslotGrid<u8, MockRtc> {
        TimeslotGrid::new(MockRtc::default())
    }

    /// Moves the mock counter to the armed compare value
    fn advance_to_compare(grid: &mut TimeslotGrid<u8, MockRtc>) {
        let (ticks, _) = grid.rtc().compare.unwrap();
        grid.rtc_mut().counter = ticks;
    }

    #[test]
    fn tick_conversions() {
        assert_eq!(ticks_to_us(32768), 1_000_000);
        assert_eq!(us_to_ticks(1_000_000), 32768);
        assert_eq!(ticks_to_us(1), 30);
        assert_eq!(ticks_to_us(TICKS_PERIOD), TS_PERIOD);
        for us in [0, 29, 31, 2500, 123_456_789].iter() {
            let ticks = us_to_ticks(*us);
            assert!(ticks_to_us(ticks) <= *us);
            assert!(us - ticks_to_us(ticks) < RTC_TICK_US);
        }
    }

    #[test]
    fn sync_then_asn_now() {
        let mut grid = grid();
        let t = 5_000_000;
        grid.rtc_mut().set_us(t);
        let t = grid.now();
        grid.sync(1234, t);
        assert_eq!(grid.asn_now(), 1234);
        assert_eq!(grid.asn_start(1234), t);

        grid.rtc_mut().set_us(t + TS_CELL_LENGTH_US + 100);
        assert_eq!(grid.asn_now(), 1235);
    }

    #[test]
    fn offset_shifts_cell_boundaries() {
        let mut grid = grid();
        grid.rtc_mut().set_us(1_000_000);
        let t = grid.now();
        grid.sync(10, t);
        grid.rtc_mut().set_us(t + 1000);
        assert_eq!(grid.asn_now(), 10);

        grid.offset(200);
        assert_eq!(grid.asn_now(), 10);
        assert_eq!(grid.asn_start(10), t + 200);

        grid.offset(-1300);
        assert_eq!(grid.asn_now(), 10);
        grid.offset(-1300);
        assert_eq!(grid.asn_now(), 11);
    }

    #[test]
    fn extended_clock_survives_wraps() {
        let mut grid = grid();
        grid.rtc_mut().counter = 0xff_fff0;
        let before = grid.now();
        grid.rtc_mut().counter = 0x10;
        grid.rtc_mut().overflow = true;
        let after = grid.now();
        assert_eq!(after - before, ticks_to_us(RTC_WRAP + 0x10) - ticks_to_us(0xff_fff0));
        assert!(!grid.rtc().overflow);
    }

    #[test]
    fn slots_are_kept_unique() {
        let mut grid = grid();
        grid.slotframe_add(1, 4).unwrap();
        grid.slotframe_add(1, 8).unwrap();
        assert_eq!(grid.slot_add(2, SlotFlags::TX, 0, 0), Err(GridError::NoSuchSlotframe));
        assert_eq!(grid.slot_add(1, SlotFlags::TX, 4, 0), Err(GridError::IndexOutOfRange));

        grid.slot_add(1, SlotFlags::TX, 2, 0).unwrap();
        assert_eq!(grid.slot_add(1, SlotFlags::RX, 2, 1), Err(GridError::SlotOccupied));
        grid.slot_add(1, SlotFlags::RX, 0, 1).unwrap();
        assert_eq!(grid.slots(1).collect::<std::vec::Vec<_>>(), [0, 2]);

        assert_eq!(grid.slotframe_next_free(1), Some(1));
        grid.slot_add(1, SlotFlags::RX, 1, 2).unwrap();
        grid.slot_add(1, SlotFlags::RX, 3, 3).unwrap();
        assert_eq!(grid.slotframe_next_free(1), None);
        assert_eq!(grid.slotframe_next_free(7), None);

        grid.slot_remove(1, 3).unwrap();
        assert_eq!(grid.slot_remove(1, 3), Err(GridError::NoSuchSlot));
        assert_eq!(grid.slotframe_next_free(1), Some(3));
        assert_eq!(grid.rtc().locks, grid.rtc().unlocks);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut grid = grid();
        for id in 0..MAX_SLOTFRAMES as u16 {
            grid.slotframe_add(id, 16).unwrap();
        }
        assert_eq!(grid.slotframe_add(99, 16), Err(GridError::TooManySlotframes));
        for index in 0..MAX_SLOTS as u16 {
            grid.slot_add(0, SlotFlags::RX, index, 0).unwrap();
        }
        assert_eq!(grid.slot_add(0, SlotFlags::RX, 9, 0), Err(GridError::TooManySlots));
        grid.slotframe_remove(0).unwrap();
        assert_eq!(grid.slotframe_remove(0), Err(GridError::NoSuchSlotframe));
    }

    #[test]
    fn fires_closest_slot_first() {
        let mut grid = grid();
        grid.sync(0, 0);
        grid.slotframe_add(2, 10).unwrap();
        grid.slotframe_add(1, 5).unwrap();
        grid.slot_add(2, SlotFlags::RX, 3, 20).unwrap();
        grid.slot_add(1, SlotFlags::RX, 3, 10).unwrap();
        grid.slot_add(1, SlotFlags::TX, 4, 11).unwrap();

        // Cell 3 is active in both slotframes, the lower id wins.
        let mut handlers = std::vec::Vec::new();
        for _ in 0..5 {
            advance_to_compare(&mut grid);
            match grid.fire() {
                Some(GridEvent::Slot(event)) => handlers.push((event.asn, event.handler)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(handlers, [(3, 10), (4, 11), (8, 10), (9, 11), (13, 10)]);
        assert_eq!(grid.last_slot_start(), 13 * TS_CELL_LENGTH_US);
    }

    #[test]
    fn compare_carries_sub_tick_remainder() {
        let mut grid = grid();
        grid.sync(0, 0);
        grid.slotframe_add(1, 4).unwrap();
        grid.slot_add(1, SlotFlags::RX, 1, 0).unwrap();
        let (ticks, fine) = grid.rtc().compare.unwrap();
        assert_eq!(ticks_to_us(ticks as u64) + fine as u64, TS_CELL_LENGTH_US);
    }

    #[test]
    fn late_deadline_runs_immediately() {
        let mut grid = grid();
        grid.sync(0, 0);
        grid.slotframe_add(1, 4).unwrap();
        grid.slot_add(1, SlotFlags::RX, 1, 7).unwrap();

        // The handler of the previous slot overran past the next start.
        grid.rtc_mut().set_us(TS_CELL_LENGTH_US + 40);
        let armed = grid.armed;
        grid.arm(armed.unwrap());
        let now = us_to_ticks(TS_CELL_LENGTH_US + 40);
        assert_eq!(grid.rtc().compare, Some(((now + 1) as u32, 0)));
        match grid.fire() {
            Some(GridEvent::Slot(event)) => assert_eq!(event.handler, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn removed_slot_does_not_fire() {
        let mut grid = grid();
        grid.sync(0, 0);
        grid.slotframe_add(1, 4).unwrap();
        grid.slot_add(1, SlotFlags::RX, 1, 7).unwrap();
        let armed = grid.armed;
        grid.slot_remove(1, 1).unwrap();
        assert_eq!(grid.rtc().compare, None);
        grid.armed = armed;
        assert_eq!(grid.fire(), None);
    }

    #[test]
    fn power_times_are_set_one_at_a_time() {
        let mut grid = grid();
        assert!(grid.power.is_none());
        grid.config_power_down(100);
        grid.config_power_up(500);
        let power = grid.power.unwrap();
        assert_eq!((power.up_us, power.down_us), (500, 100));
        assert!(!power.asleep);

        grid.config_power_down(250);
        let power = grid.power.unwrap();
        assert_eq!((power.up_us, power.down_us), (500, 250));
    }

    #[test]
    fn power_hooks_bracket_long_gaps() {
        let mut grid = grid();
        grid.sync(0, 0);
        grid.config_power_up(500);
        grid.config_power_down(100);
        grid.slotframe_add(1, 10).unwrap();
        grid.slot_add(1, SlotFlags::RX, 1, 1).unwrap();
        grid.slot_add(1, SlotFlags::RX, 2, 2).unwrap();

        advance_to_compare(&mut grid);
        match grid.fire() {
            Some(GridEvent::Slot(event)) => {
                assert_eq!(event.handler, 1);
                assert!(!event.power_down);
            }
            other => panic!("unexpected {:?}", other),
        }

        advance_to_compare(&mut grid);
        match grid.fire() {
            Some(GridEvent::Slot(event)) => {
                assert_eq!(event.handler, 2);
                assert!(event.power_down);
            }
            other => panic!("unexpected {:?}", other),
        }

        let (ticks, fine) = grid.rtc().compare.unwrap();
        assert_eq!(ticks_to_us(ticks as u64) + fine as u64, 11 * TS_CELL_LENGTH_US - 500);
        advance_to_compare(&mut grid);
        assert_eq!(grid.fire(), Some(GridEvent::PowerUp));
        advance_to_compare(&mut grid);
        match grid.fire() {
            Some(GridEvent::Slot(event)) => assert_eq!(event.asn, 11),
            other => panic!("unexpected {:?}", other),
        }
    }
}
