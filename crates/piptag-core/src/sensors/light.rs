//! Relative ambient light from an LED used as a photodiode.
//!
//! The reverse-biased LED is charged and then left to discharge through its
//! own photocurrent; the brighter the light, the sooner the cathode falls
//! through the input threshold and triggers a capture. The timer runs from
//! the VLO divided by 4 and gives up after 255 counts, which reads as dark.

use embassy_time::Duration;
use log::{debug, warn};

use super::{PayloadReadings, SensorError};
use crate::hal::{CaptureEdge, CaptureTimer, ClockSource, LedSensor, TimerConfig};
use crate::timer_arbiter::{Client, TimerArbiter, TimerEvent, WaitOutcome};

/// Counts after which the measurement is declared dark.
pub const DARK_TIMEOUT: u16 = 255;

const LIGHT_TIMER: TimerConfig = TimerConfig::compare(ClockSource::Vlo, 4, DARK_TIMEOUT)
    .with_capture(CaptureEdge::Falling);

/// 255 counts of VLO/4 take about 85 ms at the slowest VLO.
const LIGHT_DEADLINE: Duration = Duration::from_millis(200);

/// Light level from the captured discharge count; 0 is dark.
pub fn level_from_capture(count: u16) -> u8 {
    (DARK_TIMEOUT as u32 + 1).saturating_sub(count as u32).min(255) as u8
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientLight {
    cached: u8,
}

impl AmbientLight {
    pub const fn new() -> Self {
        Self { cached: 0 }
    }

    pub fn cached(&self) -> u8 {
        self.cached
    }

    /// Measure when `fresh`, otherwise return the cached level.
    pub async fn sense<L: LedSensor, T: CaptureTimer>(
        &mut self,
        fresh: bool,
        led: &mut L,
        arbiter: &TimerArbiter,
        timer: &mut T,
    ) -> Result<u8, SensorError> {
        if fresh {
            self.cached = measure(led, arbiter, timer).await?;
            debug!("Ambient light {}", self.cached);
        }
        Ok(self.cached)
    }
}

impl PayloadReadings<1> for AmbientLight {
    fn to_payload(&self) -> [u8; 1] {
        [self.cached]
    }
}

/// One discharge measurement.
pub async fn measure<L: LedSensor, T: CaptureTimer>(
    led: &mut L,
    arbiter: &TimerArbiter,
    timer: &mut T,
) -> Result<u8, SensorError> {
    let mut reservation = arbiter.reserve(Client::AmbientLight)?;

    led.charge();
    led.release_to_capture();
    let outcome = reservation
        .await_event(timer, &LIGHT_TIMER, Some(LIGHT_DEADLINE))
        .await;
    led.park();

    Ok(match outcome {
        WaitOutcome::Signaled(TimerEvent::Capture(count)) => level_from_capture(count),
        WaitOutcome::Signaled(TimerEvent::Compare) => 0,
        WaitOutcome::TimedOut => {
            warn!("Light measurement got no timer event, reporting dark");
            0
        }
    })
}
