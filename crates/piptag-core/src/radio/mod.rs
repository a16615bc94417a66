//! Sub-GHz radio: register access, packet transmit/receive and tuning.

pub mod cc1101;
pub mod link;
pub mod spi_bus;

use thiserror_no_std::Error;

pub use link::{CalibrationSnapshot, RadioLink, RxOutcome, RxStatus};
pub use spi_bus::SpiRadioBus;

/// Command capability set of the radio chip.
///
/// Addresses are plain register numbers; implementations add the SPI
/// read/burst header bits themselves.
pub trait RadioBus {
    type Error: core::fmt::Debug;

    async fn write_register(&mut self, address: u8, value: u8) -> Result<(), Self::Error>;

    async fn read_register(&mut self, address: u8) -> Result<u8, Self::Error>;

    async fn write_burst(&mut self, address: u8, data: &[u8]) -> Result<(), Self::Error>;

    async fn read_burst(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Send a command strobe; returns the chip status byte.
    async fn strobe(&mut self, command: u8) -> Result<u8, Self::Error>;

    async fn read_status(&mut self, address: u8) -> Result<u8, Self::Error>;

    /// Bring the chip out of power-down and wait for the crystal to settle.
    async fn wake(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RadioError<E> {
    #[error("Radio bus error: {0:?}")]
    Bus(E),

    #[error("Frequency {hz} Hz outside 340-950 MHz")]
    InvalidFrequency { hz: u32 },

    #[error("Receive timed out waiting for {stage}")]
    RxTimeout { stage: &'static str },

    #[error("Receive FIFO empty")]
    FifoEmpty,

    #[error("Synthesizer calibration did not return to idle")]
    CalibrationTimeout,

    #[error("GDO0 pin error")]
    Pin,

    #[error("Chip did not report ready after wake")]
    NotReady,
}
