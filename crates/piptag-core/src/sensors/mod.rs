//! Sensing engines.
//!
//! Each engine produces a typed reading that knows how to lay itself out in
//! the packet payload ([`PayloadReadings`]). Engines that block on a hardware
//! event do it through a [`TimerArbiter`](crate::TimerArbiter) reservation.

pub mod battery;
pub mod binary;
pub mod htu21d;
pub mod i2c_link;
pub mod light;
pub mod moisture;
pub mod temperature;

use thiserror_no_std::Error;

use crate::hal::CaptureTimer;
use crate::mem_pool::{MemoryPool, PoolError, PoolWindow};
use crate::timer_arbiter::{ArbiterError, TimerArbiter};

pub use battery::BatteryReading;
pub use binary::{BinarySensor, PulledContact, Temp7Binary};
pub use htu21d::{Htu21d, HtuReadings, HtuValue};
pub use light::AmbientLight;
pub use moisture::{MoistureConfig, MoistureEngine};
pub use temperature::{TemperatureCalibration, TemperatureTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("{sensor}: failed to {operation}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
    },

    #[error("{sensor}: initialization failed ({details})")]
    InitializationFailed {
        sensor: &'static str,
        details: &'static str,
    },

    #[error("{sensor}: timed out during {operation}")]
    Timeout {
        sensor: &'static str,
        operation: &'static str,
    },

    #[error("Timer unavailable: {0}")]
    Timer(ArbiterError),

    #[error("Payload rejected: {0}")]
    Pool(PoolError),
}

impl From<ArbiterError> for SensorError {
    fn from(value: ArbiterError) -> Self {
        SensorError::Timer(value)
    }
}

impl From<PoolError> for SensorError {
    fn from(value: PoolError) -> Self {
        SensorError::Pool(value)
    }
}

/// Typed readings with a fixed payload encoding.
pub trait PayloadReadings<const LEN: usize> {
    /// Wire bytes, most significant byte first.
    fn to_payload(&self) -> [u8; LEN];
}

/// Append a reading's payload to the active arena.
pub fn append<R, const LEN: usize>(
    pool: &mut MemoryPool,
    readings: &R,
) -> Result<PoolWindow, PoolError>
where
    R: PayloadReadings<LEN>,
{
    pool.push(&readings.to_payload())
}

/// Temperature and relative humidity module.
pub trait HumiditySensor {
    fn is_initialized(&self) -> bool;

    /// Warm up and configure the device. Marks it initialized on success.
    async fn initialize<T: CaptureTimer>(
        &mut self,
        arbiter: &TimerArbiter,
        timer: &mut T,
    ) -> Result<(), SensorError>;

    /// Read temperature then humidity. Failures are reported in-band.
    async fn read(&mut self) -> HtuReadings;
}

/// Round half away from zero.
pub fn round(value: f32) -> i32 {
    if value >= 0.0 {
        (value + 0.5) as i32
    } else {
        (value - 0.5) as i32
    }
}

/// Signed 12.4 fixed point.
pub fn to_16_fixed(value: f32) -> u16 {
    (value * 16.0) as i16 as u16
}
