//! Supply voltage and energy report.

use log::{debug, error};

use super::{PayloadReadings, SensorError};
use crate::hal::{AdcChannel, AdcReference, AnalogFrontEnd};

/// Full-scale count of the 10-bit ADC.
const ADC_SATURATED: u16 = 0x3FF;

/// Sample half the supply voltage and convert to millivolts.
///
/// The 1.5 V reference covers supplies up to 3 V; a saturated reading is
/// repeated against the 2.5 V reference.
pub async fn supply_millivolts<A: AnalogFrontEnd>(adc: &mut A) -> Result<u16, SensorError> {
    let raw = sample(adc, AdcReference::V1_5).await?;
    let millivolts = if raw >= ADC_SATURATED {
        let raw = sample(adc, AdcReference::V2_5).await?;
        raw as u32 * 5000 / 1024
    } else {
        raw as u32 * 3000 / 1024
    };
    debug!("Supply at {} mV", millivolts);
    Ok(millivolts as u16)
}

async fn sample<A: AnalogFrontEnd>(adc: &mut A, reference: AdcReference) -> Result<u16, SensorError> {
    adc.sample(AdcChannel::SupplyHalf, reference)
        .await
        .map_err(|e| {
            error!("Supply voltage conversion failed: {:?}", e);
            SensorError::ReadFailed {
                sensor: "battery",
                operation: "sample supply voltage",
            }
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub millivolts: u16,
    /// Estimated energy spent since power-on.
    pub used_joules: u16,
}

impl PayloadReadings<4> for BatteryReading {
    fn to_payload(&self) -> [u8; 4] {
        let mv = self.millivolts.to_be_bytes();
        let joules = self.used_joules.to_be_bytes();
        [mv[0], mv[1], joules[0], joules[1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdc;
    use embassy_futures::block_on;

    #[test]
    fn test_low_reference() {
        let mut adc = MockAdc::new();
        assert_eq!(block_on(supply_millivolts(&mut adc)), Ok(2800));
        assert_eq!(adc.samples().len(), 1);
    }

    #[test]
    fn test_saturated_falls_back_to_high_reference() {
        let mut adc = MockAdc::new();
        adc.supply_low_ref = 0x3FF;
        adc.supply_high_ref = 676;

        assert_eq!(block_on(supply_millivolts(&mut adc)), Ok(3300));
        assert_eq!(
            adc.samples(),
            &[
                (AdcChannel::SupplyHalf, AdcReference::V1_5),
                (AdcChannel::SupplyHalf, AdcReference::V2_5),
            ]
        );
    }

    #[test]
    fn test_payload_layout() {
        let reading = BatteryReading {
            millivolts: 2950,
            used_joules: 17,
        };
        assert_eq!(reading.to_payload(), [0x0B, 0x86, 0x00, 0x11]);
    }
}
