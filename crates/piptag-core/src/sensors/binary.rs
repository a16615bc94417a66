//! Binary contact sensing (door reed switch, water detection).

use embassy_time::Timer;
use embedded_hal::digital::{InputPin, OutputPin};
use log::{debug, error};

use super::{PayloadReadings, SensorError};
use crate::hal::ContactSensor;

/// Time for the drive current to charge the input through the contact.
const CHARGE_TIME_US: u64 = 10;

/// Contact read by driving one side high and sampling the other.
pub struct PulledContact<O, I> {
    drive: O,
    input: I,
}

impl<O: OutputPin, I: InputPin> PulledContact<O, I> {
    pub fn new(drive: O, input: I) -> Self {
        Self { drive, input }
    }
}

impl<O: OutputPin, I: InputPin> ContactSensor for PulledContact<O, I> {
    type Error = SensorError;

    async fn sense(&mut self) -> Result<bool, SensorError> {
        self.drive.set_high().map_err(|e| {
            error!("Contact drive pin failed: {:?}", e);
            SensorError::ReadFailed {
                sensor: "contact",
                operation: "drive contact",
            }
        })?;
        Timer::after_micros(CHARGE_TIME_US).await;

        let closed = self.input.is_high().map_err(|e| {
            error!("Contact input pin failed: {:?}", e);
            SensorError::ReadFailed {
                sensor: "contact",
                operation: "sample contact",
            }
        });

        // Always stop driving, even when the sample failed
        let released = self.drive.set_low().map_err(|e| {
            error!("Contact drive pin failed: {:?}", e);
            SensorError::ReadFailed {
                sensor: "contact",
                operation: "release contact",
            }
        });

        let closed = closed?;
        released?;
        Ok(closed)
    }
}

/// Edge detector over a contact.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySensor {
    last: bool,
    sensed: bool,
}

impl BinarySensor {
    pub const fn new() -> Self {
        Self {
            last: false,
            sensed: false,
        }
    }

    pub fn state(&self) -> bool {
        self.last
    }

    /// Whether the contact has been sampled at least once.
    pub fn sensed(&self) -> bool {
        self.sensed
    }

    /// Sample the contact when `force` is set or on first use, and report
    /// whether the state changed.
    pub async fn update<C: ContactSensor>(
        &mut self,
        contact: &mut C,
        force: bool,
    ) -> Result<bool, SensorError> {
        let previous = self.last;
        if force || !self.sensed {
            self.last = contact.sense().await.map_err(|e| {
                error!("Contact sense failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: "contact",
                    operation: "sense",
                }
            })?;
            self.sensed = true;
        }

        let changed = previous != self.last;
        if changed {
            debug!("Contact changed to {}", if self.last { "closed" } else { "open" });
        }
        Ok(changed)
    }
}

/// One byte: 7-bit shifted temperature over the contact bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temp7Binary {
    pub temp7: u8,
    pub binary: bool,
}

impl PayloadReadings<1> for Temp7Binary {
    fn to_payload(&self) -> [u8; 1] {
        [(self.temp7 << 1) | self.binary as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockContact;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use embedded_hal::digital::ErrorType;

    struct Level(bool);

    impl ErrorType for Level {
        type Error = Infallible;
    }

    impl InputPin for Level {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.0)
        }
    }

    #[derive(Default)]
    struct Drive {
        levels: Vec<bool>,
    }

    impl ErrorType for Drive {
        type Error = Infallible;
    }

    impl OutputPin for Drive {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.levels.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.levels.push(true);
            Ok(())
        }
    }

    #[test]
    fn test_pulled_contact_drives_then_releases() {
        let mut contact = PulledContact::new(Drive::default(), Level(true));
        assert_eq!(block_on(contact.sense()), Ok(true));
        assert_eq!(contact.drive.levels, vec![true, false]);
    }

    #[test]
    fn test_first_update_always_senses() {
        let mut sensor = BinarySensor::new();
        let mut contact = MockContact::new(&[true]);

        assert_eq!(block_on(sensor.update(&mut contact, false)), Ok(true));
        assert!(sensor.sensed());
        assert!(sensor.state());
    }

    #[test]
    fn test_cached_update_does_not_sense() {
        let mut sensor = BinarySensor::new();
        let mut contact = MockContact::new(&[false, true]);

        assert_eq!(block_on(sensor.update(&mut contact, false)), Ok(false));
        assert_eq!(block_on(sensor.update(&mut contact, false)), Ok(false));
        assert_eq!(contact.senses(), 1, "only the first update may sense unforced");

        assert_eq!(block_on(sensor.update(&mut contact, true)), Ok(true));
        assert_eq!(block_on(sensor.update(&mut contact, true)), Ok(false), "held state is no edge");
    }

    #[test]
    fn test_temp7_binary_byte() {
        let reading = Temp7Binary {
            temp7: 62,
            binary: true,
        };
        assert_eq!(reading.to_payload(), [0x7D]);
    }
}
