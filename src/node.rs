//! A node: the timeslot grid driving location cells and ranging on a radio
//!
//! The application owns a [`Node`], calls [`Node::on_rtc_irq`] from the slot
//! interrupt and [`Node::on_timeout`] every now and then. Starting the node
//! adds the location slotframe with its four location slots to the grid, and
//! a ranging slotframe of the same length holding one shared ranging slot.

use dw1000::time::Duration;
use rand_core::RngCore;

use crate::{
    beacon::BeaconState,
    config::LocConfig,
    debug, info, lattice,
    location::{self, Command, Commands, LocEvent, LocState, Location},
    radio::{Radio, RadioError},
    ranging::Ranging,
    timeslot::{GridError, GridEvent, Rtc, SlotFlags, TimeslotGrid},
    warn,
};

/// What a slot is used for
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Handler {
    /// Location cell, numbered 0 to 3 within the slotframe
    Location(u8),
    Ranging,
}

#[derive(Clone, Copy, PartialEq)]
pub enum NodeError<E> {
    Grid(GridError),
    Radio(RadioError<E>),
}

impl<E> From<GridError> for NodeError<E> {
    fn from(error: GridError) -> Self {
        NodeError::Grid(error)
    }
}

impl<E> From<RadioError<E>> for NodeError<E> {
    fn from(error: RadioError<E>) -> Self {
        NodeError::Radio(error)
    }
}

impl<E: core::fmt::Debug> core::fmt::Debug for NodeError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            NodeError::Grid(error) => write!(f, "Grid({:?})", error),
            NodeError::Radio(error) => write!(f, "Radio({:?})", error),
        }
    }
}

pub struct Node<R, C, G> {
    address: u64,
    radio: R,
    grid: TimeslotGrid<Handler, C>,
    location: Location,
    ranging: Ranging,
    rng: G,
    /// Beacon we measure our distance to
    target: Option<u64>,
}

impl<R, C, G> Node<R, C, G>
where
    R: Radio,
    C: Rtc,
    G: RngCore,
{
    pub fn new(address: u64, class: u8, config: LocConfig, radio: R, rtc: C, rng: G) -> Self {
        let ranging = Ranging::new(address, config.grid_length(), config.rx_guard(), config.rx_timeout());
        Node {
            address,
            radio,
            grid: TimeslotGrid::new(rtc),
            location: Location::new(config, class),
            ranging,
            rng,
            target: None,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn grid(&self) -> &TimeslotGrid<Handler, C> {
        &self.grid
    }

    /// For syncing the grid and configuring power hooks
    pub fn grid_mut(&mut self) -> &mut TimeslotGrid<Handler, C> {
        &mut self.grid
    }

    pub fn radio(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Beacon we are measuring our distance to
    pub fn ranging_target(&self) -> Option<u64> {
        self.target
    }

    pub fn start(&mut self) -> Result<(), GridError> {
        self.handle(LocEvent::Start)
    }

    /// Starts as the origin of the network
    pub fn start_root(&mut self) -> Result<(), GridError> {
        self.handle(LocEvent::StartRoot)
    }

    pub fn stop(&mut self) -> Result<(), GridError> {
        self.handle(LocEvent::Stop)
    }

    /// Reports a distance measured by other means, as time of flight in
    /// radio ticks
    pub fn dist_measured(&mut self, dest: u64, tof: i32) -> Result<(), GridError> {
        self.handle(LocEvent::DistMeasured { dest, tof })
    }

    /// Fires the location watchdogs that are due
    pub fn on_timeout(&mut self) -> Result<(), GridError> {
        let now_ms = self.grid.now() / 1000;
        let commands = self.location.poll_timeout(now_ms, &mut self.rng);
        self.apply(commands)
    }

    /// Runs whatever the grid has due
    ///
    /// Returns the handler of the slot that ran, if any.
    pub fn on_rtc_irq(&mut self) -> Result<Option<Handler>, NodeError<R::Error>> {
        let slot = match self.grid.fire() {
            None => return Ok(None),
            Some(GridEvent::PowerUp) => {
                self.radio.wake()?;
                return Ok(None);
            }
            Some(GridEvent::Slot(slot)) => slot,
        };

        let result = match slot.handler {
            Handler::Location(k) => self.location_cell(slot.asn, k),
            Handler::Ranging => self.ranging_cell(),
        };
        if slot.power_down {
            self.radio.sleep()?;
        }
        result.map(|()| Some(slot.handler))
    }

    fn handle(&mut self, event: LocEvent) -> Result<(), GridError> {
        let now_ms = self.grid.now() / 1000;
        let commands = self.location.handle(event, now_ms, &mut self.rng);
        self.apply(commands)
    }

    fn apply(&mut self, commands: Commands) -> Result<(), GridError> {
        let config = self.location.config();
        let (id, numslots, indices) = (config.slotframe_id, config.slotframe_len, config.location_slots());
        let ranging_id = config.ranging_slotframe_id;
        let flags = SlotFlags::TX | SlotFlags::RX | SlotFlags::SHARED;
        for command in commands {
            match command {
                Command::AddLocationSlots => {
                    self.grid.slotframe_add(id, numslots)?;
                    for (k, &index) in indices.iter().enumerate() {
                        self.grid.slot_add(id, flags, index, Handler::Location(k as u8))?;
                    }
                    self.grid.slotframe_add(ranging_id, numslots)?;
                    let index = self.grid.slotframe_next_free(ranging_id).ok_or(GridError::TooManySlots)?;
                    self.grid.slot_add(ranging_id, flags, index, Handler::Ranging)?;
                    info!("location slotframe {} added, ranging in {} at {}", id, ranging_id, index);
                }
                Command::RemoveLocationSlots => {
                    self.target = None;
                    self.grid.slotframe_remove(id)?;
                    self.grid.slotframe_remove(ranging_id)?;
                }
                Command::StartRanging { dest } => self.target = Some(dest),
                Command::StopRanging => self.target = None,
            }
        }
        Ok(())
    }

    fn location_cell(&mut self, asn: u64, k: u8) -> Result<(), NodeError<R::Error>> {
        let numslots = self.location.config().slotframe_len;
        let event = match self.location.plan_cell(asn, numslots, k, self.address) {
            Some(plan) => match location::run_cell(plan, self.location.timing(), &mut self.radio) {
                Some(update) => LocEvent::CellDone(update),
                None => LocEvent::CellSkip,
            },
            None => LocEvent::CellSkip,
        };
        Ok(self.handle(event)?)
    }

    /// Primes that beacon answer ranging polls
    fn is_responder(&self) -> bool {
        let beacon = self.location.beacon();
        let beaconing = matches!(beacon.state(), BeaconState::Joined | BeaconState::Forced);
        beaconing && beacon.index().map_or(false, lattice::is_prime)
    }

    fn ranging_cell(&mut self) -> Result<(), NodeError<R::Error>> {
        let config = self.location.config();
        let lead = config.tx_start();
        let window = Duration::from_micros(config.tx_start_us + 2 * config.rx_guard_us);
        let now = self.radio.sys_time()?;

        match self.target {
            Some(dest) if self.location.state() == LocState::MeasureDist => {
                match self.ranging.initiate(&mut self.radio, dest, now + lead) {
                    Ok(tof) if tof <= i32::MAX as u64 => self.dist_measured(dest, tof as i32)?,
                    Ok(tof) => warn!("time of flight to {:x} out of range: {}", dest, tof),
                    Err(_) => debug!("no ranging answer from {:x}", dest),
                }
            }
            Some(_) => self.target = None,
            None if self.is_responder() => {
                if let Ok(tag) = self.ranging.respond(&mut self.radio, now, window) {
                    debug!("ranged with {:x}", tag);
                }
            }
            None => {}
        }
        Ok(())
    }
}
