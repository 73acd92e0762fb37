//! Driver crate for the DW1000 UWB transceiver
//!
//! The [`hl`] module exposes the radio as timed one-shot operations, which is
//! what TDMA protocols need: transmit or receive at an exact 40-bit system
//! time, read RMARKER timestamps, estimate the remote clock offset. The [`ll`]
//! module gives typed access to every register used along the way.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

pub mod configs;
pub mod hl;
pub mod ll;
pub mod time;

pub use crate::{
    configs::Config,
    hl::{Error, OnWake, OtpCalibration, RxInfo, Status, WakeTrigger, DW1000},
};
