//! Capacitive moisture sensing.
//!
//! The probe is charged through a fixed resistor and the timer counts until
//! the comparator sees the probe cross half the supply. A wet probe has a
//! higher capacitance and takes longer. The timer is clocked from the radio
//! crystal for resolution, so the radio is woken for the measurement.
//!
//! Each measurement starts the counter `discharge_wait` counts below
//! overflow; the probe is held discharged until the counter wraps, then the
//! charge starts from zero. An even number of measurements is averaged
//! with the comparator inputs swapped every other one, which cancels its
//! offset.
//!
//! # Calibration
//!
//! The count for a given capacitance also depends on the supply voltage.
//! Two reference capacitors ("small" and "big") are each measured at two
//! supply voltages; each pair defines a line giving the reference count at
//! any voltage. A measurement is mapped linearly between the two reference
//! counts onto the output scale.

use embassy_time::Duration;
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;
use log::{debug, warn};
use thiserror_no_std::Error;

use super::{PayloadReadings, SensorError};
use crate::hal::{CaptureEdge, CaptureTimer, ClockSource, MoistureProbe, TimerConfig};
use crate::radio::cc1101::CrystalDivider;
use crate::radio::{RadioBus, RadioError, RadioLink};
use crate::timer_arbiter::{Client, TimerArbiter, TimerEvent, WaitOutcome};

/// One calibration measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPoint {
    pub battery_mv: u16,
    pub count: u16,
}

/// Reference count of one calibration capacitor against supply voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationLine {
    /// Output value this capacitor represents
    pub scaled: u16,
    pub high_battery: CalibrationPoint,
    pub low_battery: CalibrationPoint,
}

impl CalibrationLine {
    /// Reference count at `battery_mv`.
    ///
    /// Uses the negative inverse slope (millivolts per count) in integer
    /// math. Points that do not define a usable slope give a flat line.
    pub fn count_at(&self, battery_mv: u16) -> i32 {
        let count_rise = self.low_battery.count as i32 - self.high_battery.count as i32;
        let battery_drop = self.high_battery.battery_mv as i32 - self.low_battery.battery_mv as i32;
        if count_rise == 0 || battery_drop / count_rise == 0 {
            return self.high_battery.count as i32;
        }

        let slope = battery_drop / count_rise;
        let intercept = self.low_battery.count as i32 + self.low_battery.battery_mv as i32 / slope;
        intercept - battery_mv as i32 / slope
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureConfig {
    /// Measurements averaged per reading; should be even.
    pub measurements: u8,
    /// Compare value ending a measurement that never crossed.
    pub max_count: u16,
    /// Counts the probe stays discharged before charging starts.
    pub discharge_wait: u16,
    /// Report the averaged count instead of the calibrated scale.
    pub raw_output: bool,
    pub min_scaled: u16,
    pub max_scaled: u16,
    pub small: CalibrationLine,
    pub big: CalibrationLine,
    pub crystal_divider: CrystalDivider,
    /// Software bound on a single measurement.
    pub deadline: Duration,
}

impl Default for MoistureConfig {
    fn default() -> Self {
        Self {
            measurements: 4,
            max_count: 0xFFFF,
            discharge_wait: 130,
            raw_output: true,
            min_scaled: 0,
            max_scaled: 500,
            small: CalibrationLine {
                scaled: 47,
                high_battery: CalibrationPoint {
                    battery_mv: 3081,
                    count: 258,
                },
                low_battery: CalibrationPoint {
                    battery_mv: 2701,
                    count: 261,
                },
            },
            big: CalibrationLine {
                scaled: 180,
                high_battery: CalibrationPoint {
                    battery_mv: 3081,
                    count: 848,
                },
                low_battery: CalibrationPoint {
                    battery_mv: 2680,
                    count: 851,
                },
            },
            crystal_divider: CrystalDivider::Div4,
            // 0xFFFF counts at 6.5 MHz is about 10 ms
            deadline: Duration::from_millis(25),
        }
    }
}

impl MoistureConfig {
    /// Map an averaged count onto the output scale at the given supply.
    pub fn calibrate(&self, measurement: u16, battery_mv: u16) -> u16 {
        let big = self.big.count_at(battery_mv);
        let small = self.small.count_at(battery_mv);
        let measurement = measurement as i32;
        let small_scaled = self.small.scaled as i32;

        let scaled = if measurement == small {
            small_scaled
        } else {
            let top = big - small;
            if top <= 0 {
                warn!("Moisture references cross at {} mV (big {}, small {})", battery_mv, big, small);
                small_scaled
            } else {
                // Scaler keeps the integer quotients large enough to be precise
                let scaler = 65_535 / top;
                let span = self.big.scaled as i32 - small_scaled;
                let position = scaler * top / (measurement - small).abs();
                match (position, measurement > small) {
                    (0, true) => i32::MAX,
                    (0, false) => i32::MIN,
                    (p, true) => small_scaled + scaler * span / p,
                    (p, false) => small_scaled - scaler * span / p,
                }
            }
        };

        scaled.clamp(self.min_scaled as i32, self.max_scaled as i32) as u16
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoistureError<E> {
    #[error("Moisture timer: {0}")]
    Sensor(SensorError),

    #[error("Moisture crystal clock: {0}")]
    Radio(RadioError<E>),
}

impl<E> From<SensorError> for MoistureError<E> {
    fn from(value: SensorError) -> Self {
        MoistureError::Sensor(value)
    }
}

impl<E> From<RadioError<E>> for MoistureError<E> {
    fn from(value: RadioError<E>) -> Self {
        MoistureError::Radio(value)
    }
}

/// Value reported for a measurement that never completed.
pub const INVALID_MOISTURE: u16 = 0;

pub struct MoistureEngine {
    config: MoistureConfig,
    cached: u16,
}

impl MoistureEngine {
    pub const fn new(config: MoistureConfig) -> Self {
        Self { config, cached: 0 }
    }

    pub fn config(&self) -> &MoistureConfig {
        &self.config
    }

    pub fn cached(&self) -> u16 {
        self.cached
    }

    /// Measure when `fresh`, otherwise return the cached value.
    ///
    /// The timer configuration is saved before and restored after the
    /// measurement, and the radio crystal is stopped even when a measurement
    /// fails.
    pub async fn sense<P, T, B, G>(
        &mut self,
        fresh: bool,
        probe: &mut P,
        arbiter: &TimerArbiter,
        timer: &mut T,
        radio: &mut RadioLink<B, G>,
        battery_mv: u16,
    ) -> Result<u16, MoistureError<B::Error>>
    where
        P: MoistureProbe,
        T: CaptureTimer,
        B: RadioBus,
        G: InputPin + Wait,
    {
        if !fresh {
            return Ok(self.cached);
        }

        let saved = timer.save();
        radio.crystal_on(self.config.crystal_divider).await?;
        let average = self.measure(probe, arbiter, timer).await;
        probe.disconnect();
        let stopped = radio.crystal_off().await;
        timer.restore(saved);
        stopped?;

        self.cached = match average? {
            Some(count) if self.config.raw_output => count,
            Some(count) => self.config.calibrate(count, battery_mv),
            None => INVALID_MOISTURE,
        };
        debug!("Moisture {}", self.cached);
        Ok(self.cached)
    }

    /// Averaged count, or `None` when a measurement ran past its deadline.
    async fn measure<P: MoistureProbe, T: CaptureTimer>(
        &self,
        probe: &mut P,
        arbiter: &TimerArbiter,
        timer: &mut T,
    ) -> Result<Option<u16>, SensorError> {
        let mut reservation = arbiter.reserve(Client::Moisture)?;
        let config = TimerConfig::compare(ClockSource::ExternalCrystal, 1, self.config.max_count)
            .with_start_count(u16::MAX - self.config.discharge_wait)
            .with_capture(CaptureEdge::Falling);

        let measurements = self.config.measurements.max(1);
        let mut sum: u32 = 0;
        for i in 0..measurements {
            probe.discharge();
            probe.connect_comparator(i % 2 == 1);

            match reservation
                .await_event(timer, &config, Some(self.config.deadline))
                .await
            {
                WaitOutcome::Signaled(TimerEvent::Capture(count)) => sum += count as u32,
                WaitOutcome::Signaled(TimerEvent::Compare) => sum += self.config.max_count as u32,
                WaitOutcome::TimedOut => {
                    warn!("Moisture measurement {} timed out", i);
                    return Ok(None);
                }
            }
        }

        Ok(Some((sum / measurements as u32) as u16))
    }
}

impl PayloadReadings<2> for MoistureEngine {
    fn to_payload(&self) -> [u8; 2] {
        self.cached.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaPower;
    use crate::packet::IdEncoding;
    use crate::radio::cc1101::{GDO_HIGH_IMPEDANCE, IOCFG0};
    use crate::testing::{MockGdo, MockProbe, MockRadioBus, MockTimer, ProbeCall};
    use crate::timer_arbiter::ActiveWaiter;
    use embassy_futures::block_on;

    fn radio() -> RadioLink<MockRadioBus, MockGdo> {
        RadioLink::new(
            MockRadioBus::new(),
            MockGdo::toggling(),
            IdEncoding::Crc24,
            PaPower::Dbm6_0,
        )
    }

    #[test]
    fn test_reference_counts_follow_battery() {
        let config = MoistureConfig::default();
        assert_eq!(config.big.count_at(3000), 849);
        assert_eq!(config.small.count_at(3000), 259);
    }

    #[test]
    fn test_measurement_at_small_reference() {
        let config = MoistureConfig::default();
        assert_eq!(config.calibrate(259, 3000), 47);
    }

    #[test]
    fn test_calibration_interpolates_and_clamps() {
        let config = MoistureConfig::default();
        assert_eq!(config.calibrate(500, 3000), 101);
        assert_eq!(config.calibrate(100, 3000), 12);
        assert_eq!(config.calibrate(0, 3000), 0, "below scale clamps to the minimum");
        assert_eq!(config.calibrate(10_000, 3000), 500, "above scale clamps to the maximum");
    }

    #[test]
    fn test_flat_line_guard() {
        let mut config = MoistureConfig::default();
        config.big.low_battery.count = config.big.high_battery.count;
        assert_eq!(config.big.count_at(2500), 848);
    }

    #[test]
    fn test_sense_averages_and_restores() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        for count in [400, 420, 410, 430] {
            timer.script(Some(TimerEvent::Capture(count)));
        }
        let before = timer.save();
        let mut probe = MockProbe::new();
        let mut radio = radio();
        let mut engine = MoistureEngine::new(MoistureConfig::default());

        let value = block_on(engine.sense(true, &mut probe, &arbiter, &mut timer, &mut radio, 3000));

        assert_eq!(value, Ok(415));
        assert_eq!(timer.save(), before, "timer configuration restored");
        assert_eq!(timer.starts().len(), 4);
        assert!(timer.starts().iter().all(|(owner, _)| *owner == ActiveWaiter::Moisture));
        assert_eq!(timer.starts()[0].1.start_count, 0xFFFF - 130);
        assert_eq!(
            probe.calls(),
            &[
                ProbeCall::Discharge,
                ProbeCall::Connect(false),
                ProbeCall::Discharge,
                ProbeCall::Connect(true),
                ProbeCall::Discharge,
                ProbeCall::Connect(false),
                ProbeCall::Discharge,
                ProbeCall::Connect(true),
                ProbeCall::Disconnect,
            ]
        );
        assert_eq!(radio.bus().register(IOCFG0), GDO_HIGH_IMPEDANCE, "crystal output stopped");
        assert_eq!(engine.to_payload(), [0x01, 0x9F]);
    }

    #[test]
    fn test_compare_counts_as_full_scale() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        let mut config = MoistureConfig::default();
        config.measurements = 2;
        timer.script(Some(TimerEvent::Capture(1)));
        timer.script(Some(TimerEvent::Compare));
        let mut engine = MoistureEngine::new(config);

        let value = block_on(engine.sense(
            true,
            &mut MockProbe::new(),
            &arbiter,
            &mut timer,
            &mut radio(),
            3000,
        ));
        assert_eq!(value, Ok(0x8000));
    }

    #[test]
    fn test_timeout_reports_invalid_and_cleans_up() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        timer.script(Some(TimerEvent::Capture(300)));
        timer.script(None);
        let mut config = MoistureConfig::default();
        config.deadline = Duration::from_millis(5);
        let mut probe = MockProbe::new();
        let mut radio = radio();
        let mut engine = MoistureEngine::new(config);

        let value = block_on(engine.sense(true, &mut probe, &arbiter, &mut timer, &mut radio, 3000));

        assert_eq!(value, Ok(INVALID_MOISTURE));
        assert_eq!(probe.calls().last(), Some(&ProbeCall::Disconnect));
        assert_eq!(arbiter.active(), ActiveWaiter::None);
        assert_eq!(radio.bus().register(IOCFG0), GDO_HIGH_IMPEDANCE);
    }

    #[test]
    fn test_calibrated_output_and_cache() {
        let arbiter = TimerArbiter::new();
        let mut timer = MockTimer::new(&arbiter);
        timer.respond_to(ActiveWaiter::Moisture, Some(TimerEvent::Capture(500)));
        let mut config = MoistureConfig::default();
        config.raw_output = false;
        let mut engine = MoistureEngine::new(config);
        let mut probe = MockProbe::new();
        let mut radio = radio();

        assert_eq!(
            block_on(engine.sense(true, &mut probe, &arbiter, &mut timer, &mut radio, 3000)),
            Ok(101)
        );
        let starts = timer.starts().len();
        assert_eq!(
            block_on(engine.sense(false, &mut probe, &arbiter, &mut timer, &mut radio, 2000)),
            Ok(101)
        );
        assert_eq!(timer.starts().len(), starts, "cached read takes no measurement");
    }
}
