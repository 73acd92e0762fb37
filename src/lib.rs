//! Cooperative self-localization over UWB
//!
//! Nodes built around a DW1000 transceiver place themselves in a shared 3D
//! frame by exchanging timed beacons. A subset of them claims the points of a
//! face-centered-cubic lattice ([`lattice`]) and transmits in location cells
//! scheduled on a TDMA grid ([`timeslot`]); everyone in range of a cell
//! learns distances or pseudoranges from it and multilaterates
//! ([`location`]).
//!
//! [`node::Node`] ties the pieces together on top of a [`radio::Radio`] and
//! a real-time counter ([`timeslot::Rtc`]).

#![cfg_attr(not(test), no_std)]

pub mod beacon;
pub mod config;
pub mod filter;
pub mod frame;
pub mod lattice;
pub mod location;
pub mod node;
pub mod radio;
pub mod ranging;
pub mod timeslot;

pub use crate::{
    config::LocConfig,
    location::{LocEvent, LocState, Location},
    node::Node,
};

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};

#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};
