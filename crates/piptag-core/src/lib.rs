//! Hardware-independent core library for the PIPtag sensor tag
//!
//! This crate contains all platform-agnostic logic for the duty-cycled tag:
//! the epoch scheduler, the shared capture timer arbiter, the bit-banged
//! humidity sensor link, capacitive moisture measurement, the packet memory
//! pool, the hourly history ring and the sub-GHz radio link.
//!
//! Hardware is reached only through `embedded-hal` traits and the small
//! capability traits in [`hal`], so the crate is `#![no_std]` on embedded
//! targets and compiles on desktop hosts for the simulator and tests.

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

pub mod config;
pub mod energy;
pub mod hal;
pub mod header;
pub mod history;
pub mod mem_pool;
pub mod packet;
pub mod radio;
pub mod scheduler;
pub mod sensors;
pub mod timer_arbiter;
pub mod vlo;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{TagConfig, TagParameters};
pub use header::DataHeader;
pub use scheduler::{EpochReport, Scheduler, TagError, TagHardware, TagState};
pub use timer_arbiter::{ActiveWaiter, TimerArbiter};
