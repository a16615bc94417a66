//! Bit-banged two-wire master on open-drain GPIO.
//!
//! Both lines are driven open drain: `set_high` releases the line to the
//! pull-up, `set_low` pulls it down. The slave may stretch the clock before
//! sending a byte; the master then sleeps on the clock's rising edge instead
//! of spinning, bounded by a deadline.

use embassy_time::{Duration, with_timeout};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use log::warn;
use thiserror_no_std::Error;

/// Minimum high/low time of the clock is 0.6 us; 1 us keeps a margin.
const HALF_BIT_NS: u32 = 1_000;

/// Longest clock stretch accepted (a 14-bit temperature conversion is 50 ms).
pub const DEFAULT_STRETCH_LIMIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Bus pin access failed")]
    Pin,

    #[error("Slave held the clock low for longer than allowed")]
    StretchTimeout,
}

/// Acknowledge bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack,
}

pub struct BitBangI2c<SDA, SCL, D> {
    sda: SDA,
    scl: SCL,
    delay: D,
    stretch_limit: Duration,
}

impl<SDA, SCL, D> BitBangI2c<SDA, SCL, D>
where
    SDA: InputPin + OutputPin,
    SCL: InputPin + OutputPin + Wait,
    D: DelayNs,
{
    pub fn new(sda: SDA, scl: SCL, delay: D) -> Self {
        Self {
            sda,
            scl,
            delay,
            stretch_limit: DEFAULT_STRETCH_LIMIT,
        }
    }

    pub fn with_stretch_limit(mut self, limit: Duration) -> Self {
        self.stretch_limit = limit;
        self
    }

    pub fn release(self) -> (SDA, SCL, D) {
        (self.sda, self.scl, self.delay)
    }

    /// Release both lines (bus idle).
    pub fn idle(&mut self) -> Result<(), LinkError> {
        self.sda.set_high().map_err(|_| LinkError::Pin)?;
        self.scl.set_high().map_err(|_| LinkError::Pin)
    }

    /// Start (or repeated start): data falls while the clock is high.
    pub fn start(&mut self) -> Result<(), LinkError> {
        self.idle()?;
        self.delay.delay_ns(HALF_BIT_NS);
        self.sda.set_low().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        self.scl.set_low().map_err(|_| LinkError::Pin)
    }

    /// Stop: data rises while the clock is high.
    pub fn stop(&mut self) -> Result<(), LinkError> {
        self.sda.set_low().map_err(|_| LinkError::Pin)?;
        self.scl.set_low().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        self.scl.set_high().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        self.sda.set_high().map_err(|_| LinkError::Pin)
    }

    /// Shift a byte out MSB first and sample the slave's acknowledge.
    ///
    /// Expects the clock low on entry and leaves it low.
    pub fn write_byte(&mut self, byte: u8) -> Result<Ack, LinkError> {
        for bit in (0..8).rev() {
            if byte & (1 << bit) != 0 {
                self.sda.set_high().map_err(|_| LinkError::Pin)?;
            } else {
                self.sda.set_low().map_err(|_| LinkError::Pin)?;
            }
            self.clock_pulse()?;
        }

        self.sda.set_high().map_err(|_| LinkError::Pin)?;
        self.scl.set_high().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        let ack = if self.sda.is_low().map_err(|_| LinkError::Pin)? {
            Ack::Ack
        } else {
            Ack::Nack
        };
        self.scl.set_low().map_err(|_| LinkError::Pin)?;
        Ok(ack)
    }

    /// Shift a byte in MSB first and answer with `ack`.
    ///
    /// Releases the clock first; if the slave is stretching it, suspends
    /// until the clock rises or the stretch limit passes.
    pub async fn read_byte(&mut self, ack: Ack) -> Result<u8, LinkError> {
        self.sda.set_high().map_err(|_| LinkError::Pin)?;
        self.scl.set_high().map_err(|_| LinkError::Pin)?;

        if self.scl.is_low().map_err(|_| LinkError::Pin)? {
            match with_timeout(self.stretch_limit, self.scl.wait_for_high()).await {
                Ok(released) => released.map_err(|_| LinkError::Pin)?,
                Err(_) => {
                    warn!(
                        "Clock stretched past {} ms",
                        self.stretch_limit.as_millis()
                    );
                    return Err(LinkError::StretchTimeout);
                }
            }
        }

        let mut byte = 0u8;
        for _ in 0..8 {
            byte <<= 1;
            self.scl.set_high().map_err(|_| LinkError::Pin)?;
            self.delay.delay_ns(HALF_BIT_NS);
            if self.sda.is_high().map_err(|_| LinkError::Pin)? {
                byte |= 1;
            }
            self.scl.set_low().map_err(|_| LinkError::Pin)?;
            self.delay.delay_ns(HALF_BIT_NS);
        }

        match ack {
            Ack::Ack => self.sda.set_low().map_err(|_| LinkError::Pin)?,
            Ack::Nack => self.sda.set_high().map_err(|_| LinkError::Pin)?,
        }
        self.clock_pulse()?;
        Ok(byte)
    }

    fn clock_pulse(&mut self) -> Result<(), LinkError> {
        self.scl.set_high().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        self.scl.set_low().map_err(|_| LinkError::Pin)?;
        self.delay.delay_ns(HALF_BIT_NS);
        Ok(())
    }
}
