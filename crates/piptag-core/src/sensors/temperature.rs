//! Die temperature from the ADC's internal sensor.
//!
//! Readings are shifted up by 40 °C so the 7-bit encoding covers
//! -40 °C to +87 °C without a sign bit.

use log::error;

use super::{PayloadReadings, SensorError, round, to_16_fixed};
use crate::hal::{AdcChannel, AdcReference, AnalogFrontEnd};

/// Shift applied to every reading.
pub const TEMPERATURE_SHIFT_C: f32 = 40.0;

/// Per-board linear fit of the die sensor, patched at flashing time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureCalibration {
    pub slope: f32,
    pub offset: f32,
}

impl Default for TemperatureCalibration {
    fn default() -> Self {
        Self {
            slope: 0.41305,
            offset: -277.75,
        }
    }
}

impl TemperatureCalibration {
    pub fn celsius(&self, adc: u16) -> f32 {
        self.slope * adc as f32 + self.offset + TEMPERATURE_SHIFT_C
    }
}

/// 12.4 fixed-point temperature payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temp16(pub u16);

impl PayloadReadings<2> for Temp16 {
    fn to_payload(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

/// Latest die temperature and its derived encodings.
///
/// Also remembers the temperature at the last radio calibration, so the
/// scheduler can recalibrate when the crystal has drifted with temperature.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureTracker {
    calibration: TemperatureCalibration,
    last: f32,
    last_calibrated: f32,
    temp7: u8,
    temp16: u16,
    temp16_sensed: bool,
}

impl TemperatureTracker {
    pub const fn new(calibration: TemperatureCalibration) -> Self {
        Self {
            calibration,
            last: 0.0,
            last_calibrated: 0.0,
            temp7: 0,
            temp16: 0,
            temp16_sensed: false,
        }
    }

    /// Convert the die sensor once.
    pub async fn sense<A: AnalogFrontEnd>(&mut self, adc: &mut A) -> Result<f32, SensorError> {
        let raw = adc
            .sample(AdcChannel::DieTemperature, AdcReference::V1_5)
            .await
            .map_err(|e| {
                error!("Die temperature conversion failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: "die temperature",
                    operation: "sample ADC",
                }
            })?;
        self.last = self.calibration.celsius(raw);
        Ok(self.last)
    }

    pub fn last(&self) -> f32 {
        self.last
    }

    /// Adopt a temperature measured elsewhere (on-board humidity module).
    pub fn set_last(&mut self, celsius: f32) {
        self.last = celsius;
    }

    pub fn temp7(&self) -> u8 {
        self.temp7
    }

    /// Sense and refresh the 7-bit whole-degree value.
    pub async fn update_temp7<A: AnalogFrontEnd>(&mut self, adc: &mut A) -> Result<u8, SensorError> {
        let celsius = self.sense(adc).await?;
        self.temp7 = round(celsius) as u8 & 0x7F;
        Ok(self.temp7)
    }

    /// Refresh the fixed-point value, sensing again only when `fresh`.
    pub async fn update_temp16<A: AnalogFrontEnd>(
        &mut self,
        adc: &mut A,
        fresh: bool,
    ) -> Result<u16, SensorError> {
        if fresh {
            self.sense(adc).await?;
        }
        self.temp16 = to_16_fixed(self.last);
        self.temp16_sensed = true;
        Ok(self.temp16)
    }

    /// Fixed-point value for the payload; senses on first use.
    pub async fn temp16<A: AnalogFrontEnd>(&mut self, adc: &mut A) -> Result<Temp16, SensorError> {
        if !self.temp16_sensed {
            self.update_temp16(adc, true).await?;
        }
        Ok(Temp16(self.temp16))
    }

    /// True when the temperature moved more than `threshold_c` since the
    /// last time this returned true.
    pub fn needs_recalibration(&mut self, threshold_c: f32) -> bool {
        let diff = self.last - self.last_calibrated;
        if diff.abs() > threshold_c {
            self.last_calibrated += diff;
            return true;
        }
        false
    }

    /// Take the current temperature as the radio calibration reference.
    pub fn mark_calibrated(&mut self) {
        self.last_calibrated = self.last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdc;
    use embassy_futures::block_on;

    #[test]
    fn test_conversion_is_shifted() {
        let calibration = TemperatureCalibration::default();
        // 726 counts is about 22 °C
        let shifted = calibration.celsius(726);
        assert!((shifted - 62.12).abs() < 0.01, "got {}", shifted);
    }

    #[test]
    fn test_temp7_rounds() {
        let mut adc = MockAdc::new();
        let mut tracker = TemperatureTracker::new(TemperatureCalibration::default());

        assert_eq!(block_on(tracker.update_temp7(&mut adc)), Ok(62));
        assert_eq!(tracker.temp7(), 62);
        assert_eq!(
            adc.samples(),
            &[(AdcChannel::DieTemperature, AdcReference::V1_5)]
        );
    }

    #[test]
    fn test_temp16_senses_once_then_caches() {
        let mut adc = MockAdc::new();
        let mut tracker = TemperatureTracker::new(TemperatureCalibration::default());

        let first = block_on(tracker.temp16(&mut adc)).unwrap();
        adc.die = 800;
        let second = block_on(tracker.temp16(&mut adc)).unwrap();
        assert_eq!(first, second, "cached value must be reused");
        assert_eq!(adc.samples().len(), 1);

        let refreshed = block_on(tracker.update_temp16(&mut adc, true)).unwrap();
        assert_ne!(refreshed, first.0);
        assert_eq!(Temp16(0x03E2).to_payload(), [0x03, 0xE2]);
    }

    #[test]
    fn test_adc_failure_is_reported() {
        let mut adc = MockAdc::new();
        adc.fail = true;
        let mut tracker = TemperatureTracker::new(TemperatureCalibration::default());
        assert!(matches!(
            block_on(tracker.sense(&mut adc)),
            Err(SensorError::ReadFailed { .. })
        ));
    }

    #[test]
    fn test_recalibration_threshold() {
        let mut tracker = TemperatureTracker::new(TemperatureCalibration::default());
        tracker.set_last(2.5);
        assert!(!tracker.needs_recalibration(3.0));

        tracker.set_last(3.5);
        assert!(tracker.needs_recalibration(3.0));
        assert!(
            !tracker.needs_recalibration(3.0),
            "reference moves to the temperature that triggered"
        );

        tracker.set_last(0.0);
        assert!(tracker.needs_recalibration(3.0), "drops count as well");
    }
}
