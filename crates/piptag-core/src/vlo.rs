//! Very-low-power oscillator timing.
//!
//! The VLO clocks every sleep but drifts widely with temperature and supply
//! (4 to 20 kHz). It is calibrated against the radio crystal: the crystal,
//! divided by 192, drives the timer while the VLO gates a window of 100
//! ticks. The crystal count captured at the end of the window gives the VLO
//! ticks per millisecond.

use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;
use embassy_time::Duration;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::hal::{CaptureEdge, CaptureTimer, ClockSource, CountMode, TimerConfig};
use crate::radio::cc1101::CrystalDivider;
use crate::radio::{RadioBus, RadioError, RadioLink};
use crate::timer_arbiter::{ArbiterError, Client, TimerArbiter, TimerEvent, WaitOutcome};

/// Nominal VLO rate before the first calibration.
pub const DEFAULT_TICKS_PER_MS: f32 = 12.0;

/// VLO ticks in the calibration window.
pub const CALIBRATION_TICKS: u16 = 100;

/// Crystal divided by 192, in kHz.
const CRYSTAL_DIV192_KHZ: f32 = 135.416;

/// The window is 5 ms at the slowest VLO.
const CALIBRATION_DEADLINE: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VloError<E> {
    #[error("Timer unavailable: {0}")]
    Timer(ArbiterError),

    #[error("Radio crystal unavailable: {0}")]
    Radio(RadioError<E>),

    #[error("Calibration window ended without a capture")]
    NoCapture,
}

impl<E> From<ArbiterError> for VloError<E> {
    fn from(value: ArbiterError) -> Self {
        VloError::Timer(value)
    }
}

impl<E> From<RadioError<E>> for VloError<E> {
    fn from(value: RadioError<E>) -> Self {
        VloError::Radio(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VloClock {
    ticks_per_ms: f32,
}

impl Default for VloClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VloClock {
    pub const fn new() -> Self {
        Self {
            ticks_per_ms: DEFAULT_TICKS_PER_MS,
        }
    }

    pub fn ticks_per_ms(&self) -> f32 {
        self.ticks_per_ms
    }

    /// VLO ticks in `ms`, saturating at the 16-bit compare range.
    pub fn ticks(&self, ms: u32) -> u16 {
        let ticks = ms as f32 * self.ticks_per_ms;
        if ticks >= u16::MAX as f32 {
            u16::MAX
        } else {
            ticks as u16
        }
    }

    /// Low-power sleep for `ms` on the VLO, through the shared timer.
    pub async fn sleep_ms<T: CaptureTimer>(
        &self,
        arbiter: &TimerArbiter,
        timer: &mut T,
        ms: u32,
    ) -> Result<(), ArbiterError> {
        let mut reservation = arbiter.reserve(Client::TimedSleep)?;
        let config = TimerConfig::compare(ClockSource::Vlo, 1, self.ticks(ms));
        // Bounded by the slowest VLO with margin
        let deadline = Duration::from_millis(ms as u64 * 4 + 10);
        if reservation.await_event(timer, &config, Some(deadline)).await == WaitOutcome::TimedOut {
            warn!("Timed sleep of {} ms ended by deadline", ms);
        }
        Ok(())
    }

    /// Measure the VLO against the radio crystal.
    ///
    /// Wakes the radio if needed and routes its clock out of GDO0, then
    /// returns GDO0 to high impedance. The radio is left awake.
    pub async fn calibrate<T, B, G>(
        &mut self,
        arbiter: &TimerArbiter,
        timer: &mut T,
        radio: &mut RadioLink<B, G>,
    ) -> Result<f32, VloError<B::Error>>
    where
        T: CaptureTimer,
        B: RadioBus,
        G: InputPin + Wait,
    {
        let mut reservation = arbiter.reserve(Client::TimedSleep)?;
        radio.crystal_on(CrystalDivider::Div192).await?;

        let config = TimerConfig::compare(ClockSource::ExternalCrystal, 1, CALIBRATION_TICKS)
            .with_mode(CountMode::Continuous)
            .with_capture(CaptureEdge::Rising);
        let outcome = reservation
            .await_event(timer, &config, Some(CALIBRATION_DEADLINE))
            .await;
        radio.release_gdo0().await?;

        match outcome {
            WaitOutcome::Signaled(TimerEvent::Capture(count)) if count > 0 => {
                self.ticks_per_ms = CRYSTAL_DIV192_KHZ * CALIBRATION_TICKS as f32 / count as f32;
                info!("VLO calibrated: {} ticks/ms", self.ticks_per_ms);
                Ok(self.ticks_per_ms)
            }
            other => {
                warn!("VLO calibration failed: {:?}", other);
                Err(VloError::NoCapture)
            }
        }
    }
}
