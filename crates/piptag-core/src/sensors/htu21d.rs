//! HTU21D temperature and relative humidity sensor.
//!
//! Reads use hold-master mode: the sensor stretches the clock until the
//! conversion is done. Every reading carries a CRC-8 (x^8 + x^5 + x^4 + 1)
//! over the two data bytes.
//!
//! Failures are reported in-band. A reading that fails its checksum becomes
//! [`HtuValue::CrcFail`]; a sensor that stops acknowledging becomes
//! [`HtuValue::ReadFail`] and must be initialized again before the next read.

use embassy_time::Duration;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use log::{debug, error, info, warn};

use super::i2c_link::{Ack, BitBangI2c, LinkError};
use super::{HumiditySensor, PayloadReadings, SensorError, to_16_fixed};
use crate::hal::{CaptureTimer, ClockSource, TimerConfig};
use crate::timer_arbiter::{Client, TimerArbiter, WaitOutcome};

pub const HTU_ADDRESS: u8 = 0x80;
pub const READ_FLAG: u8 = 0x01;
pub const HOLD_TEMPERATURE: u8 = 0xE3;
pub const HOLD_HUMIDITY: u8 = 0xE5;
pub const WRITE_USER_REGISTER: u8 = 0xE6;
pub const READ_USER_REGISTER: u8 = 0xE7;

/// Extra address attempts after the first NACK.
const ADDRESS_RETRIES: u32 = 3;

pub const READ_FAIL: u16 = 0x0FFE;
pub const CRC_FAIL: u16 = 0x0FFF;

// Datasheet conversions, 2^16 full scale
const TEMPERATURE_SLOPE: f32 = 0.002681;
const TEMPERATURE_OFFSET: f32 = -46.85;
const HUMIDITY_SLOPE: f32 = 0.001907349;
const HUMIDITY_OFFSET: f32 = -6.0;
const HUMIDITY_COMPENSATION: f32 = -0.15;

/// Power-up warm-up: 15 ms of the 6 MHz sub-main clock divided by 4.
const WARMUP: TimerConfig = TimerConfig::compare(ClockSource::Smclk, 4, 22_500);
const WARMUP_DEADLINE: Duration = Duration::from_millis(50);

/// Polynomial x^8 + x^5 + x^4 + 1 aligned under a 24-bit message.
const CRC_POLY_ALIGNED: u32 = 0x98_8000;

/// CRC-8 of a 16-bit reading, as the sensor computes it.
pub fn crc8(data: u16) -> u8 {
    let mut crc = 0u8;
    for byte in data.to_be_bytes() {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Remainder of `data` followed by `crc`, divided by the polynomial.
/// Zero when the checksum matches.
pub fn crc_remainder(data: u16, crc: u8) -> u8 {
    let mut message = (data as u32) << 8 | crc as u32;
    let mut poly = CRC_POLY_ALIGNED;
    let mut high_bit = 0x80_0000u32;
    while high_bit >= 0x100 {
        if message & high_bit != 0 {
            message ^= poly;
        }
        poly >>= 1;
        high_bit >>= 1;
    }
    (message & 0xFF) as u8
}

/// One converted value or the reason there is none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HtuValue {
    Measured(f32),
    ReadFail,
    CrcFail,
}

impl HtuValue {
    pub fn is_valid(self) -> bool {
        matches!(self, HtuValue::Measured(_))
    }

    /// Value with failures mapped to their status codes, which are far
    /// outside any physical reading.
    pub fn as_f32(self) -> f32 {
        match self {
            HtuValue::Measured(value) => value,
            HtuValue::ReadFail => READ_FAIL as f32,
            HtuValue::CrcFail => CRC_FAIL as f32,
        }
    }

    /// 12.4 fixed point, or the raw status code on failure.
    pub fn to_wire(self) -> u16 {
        match self {
            HtuValue::Measured(value) => to_16_fixed(value),
            HtuValue::ReadFail => READ_FAIL,
            HtuValue::CrcFail => CRC_FAIL,
        }
    }
}

/// Paired temperature (°C) and relative humidity (%) reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HtuReadings {
    pub temperature: HtuValue,
    pub humidity: HtuValue,
}

impl HtuReadings {
    pub const FAILED: HtuReadings = HtuReadings {
        temperature: HtuValue::ReadFail,
        humidity: HtuValue::ReadFail,
    };
}

impl PayloadReadings<4> for HtuReadings {
    fn to_payload(&self) -> [u8; 4] {
        let temperature = self.temperature.to_wire().to_be_bytes();
        let humidity = self.humidity.to_wire().to_be_bytes();
        [temperature[0], temperature[1], humidity[0], humidity[1]]
    }
}

pub struct Htu21d<SDA, SCL, D> {
    link: BitBangI2c<SDA, SCL, D>,
    initialized: bool,
}

impl<SDA, SCL, D> Htu21d<SDA, SCL, D>
where
    SDA: InputPin + OutputPin,
    SCL: InputPin + OutputPin + Wait,
    D: DelayNs,
{
    pub fn new(link: BitBangI2c<SDA, SCL, D>) -> Self {
        Self {
            link,
            initialized: false,
        }
    }

    pub fn release(self) -> BitBangI2c<SDA, SCL, D> {
        self.link
    }

    /// Read the 12-bit temperature.
    pub async fn read_temperature(&mut self) -> HtuValue {
        match self.measure(HOLD_TEMPERATURE).await {
            Ok(Some(raw)) => HtuValue::Measured(TEMPERATURE_SLOPE * raw as f32 + TEMPERATURE_OFFSET),
            Ok(None) => HtuValue::CrcFail,
            Err(_) => HtuValue::ReadFail,
        }
    }

    /// Read relative humidity, compensated with `temperature` when valid.
    pub async fn read_humidity(&mut self, temperature: HtuValue) -> HtuValue {
        match self.measure(HOLD_HUMIDITY).await {
            Ok(Some(raw)) => {
                let mut humidity = HUMIDITY_SLOPE * raw as f32 + HUMIDITY_OFFSET;
                if let HtuValue::Measured(celsius) = temperature {
                    humidity += HUMIDITY_COMPENSATION * (25.0 - celsius);
                }
                HtuValue::Measured(humidity)
            }
            Ok(None) => HtuValue::CrcFail,
            Err(_) => HtuValue::ReadFail,
        }
    }

    /// Run one hold-master measurement. `Ok(None)` means a checksum failure.
    async fn measure(&mut self, command: u8) -> Result<Option<u16>, SensorError> {
        if !self.initialized {
            return Err(SensorError::ReadFailed {
                sensor: "HTU21D",
                operation: "measure before initialization",
            });
        }

        match self.transfer_measurement(command).await {
            Ok((msb, lsb, checksum)) => {
                let data = (msb as u16) << 8 | lsb as u16;
                if crc_remainder(data, checksum) != 0 {
                    warn!(
                        "HTU21D checksum mismatch for command {:#04x}: data {:#06x} crc {:#04x}",
                        command, data, checksum
                    );
                    return Ok(None);
                }
                // Low two bits are status
                Ok(Some(data & 0xFFFC))
            }
            Err(e) => {
                self.initialized = false;
                let _ = self.link.stop();
                error!("HTU21D command {:#04x} failed: {:?}", command, e);
                Err(e)
            }
        }
    }

    async fn transfer_measurement(&mut self, command: u8) -> Result<(u8, u8, u8), SensorError> {
        self.address_with_retry().await?;
        self.write(command, "send measure command")?;
        self.link.start().map_err(link_error("restart"))?;
        self.write(HTU_ADDRESS | READ_FLAG, "address for read")?;

        let msb = self.link.read_byte(Ack::Ack).await.map_err(link_error("read msb"))?;
        let lsb = self.link.read_byte(Ack::Ack).await.map_err(link_error("read lsb"))?;
        let checksum = self
            .link
            .read_byte(Ack::Nack)
            .await
            .map_err(link_error("read checksum"))?;
        self.link.stop().map_err(link_error("stop"))?;
        Ok((msb, lsb, checksum))
    }

    /// Start and address the sensor, retrying while it does not answer.
    async fn address_with_retry(&mut self) -> Result<(), SensorError> {
        self.link.start().map_err(link_error("start"))?;
        let mut attempts = 0;
        while self
            .link
            .write_byte(HTU_ADDRESS)
            .map_err(link_error("address"))?
            == Ack::Nack
        {
            self.link.stop().map_err(link_error("stop"))?;
            attempts += 1;
            if attempts > ADDRESS_RETRIES {
                return Err(SensorError::ReadFailed {
                    sensor: "HTU21D",
                    operation: "address the sensor",
                });
            }
            self.link.start().map_err(link_error("start"))?;
        }
        Ok(())
    }

    fn write(&mut self, byte: u8, operation: &'static str) -> Result<(), SensorError> {
        match self.link.write_byte(byte).map_err(link_error(operation))? {
            Ack::Ack => Ok(()),
            Ack::Nack => {
                let _ = self.link.stop();
                Err(SensorError::ReadFailed {
                    sensor: "HTU21D",
                    operation,
                })
            }
        }
    }

    async fn configure(&mut self) -> Result<(), SensorError> {
        self.address_with_retry().await?;
        self.write(READ_USER_REGISTER, "select user register")?;
        self.link.start().map_err(link_error("restart"))?;
        self.write(HTU_ADDRESS | READ_FLAG, "address for read")?;
        let register = self
            .link
            .read_byte(Ack::Nack)
            .await
            .map_err(link_error("read user register"))?;

        // 12-bit temperature, 8-bit humidity; reserved bits written back
        let register = (register & 0x7F) | 0x01;

        self.link.start().map_err(link_error("restart"))?;
        self.write(HTU_ADDRESS, "address for write")?;
        self.write(WRITE_USER_REGISTER, "select user register")?;
        self.write(register, "write user register")?;
        self.link.stop().map_err(link_error("stop"))?;
        debug!("HTU21D user register set to {:#04x}", register);
        Ok(())
    }
}

impl<SDA, SCL, D> HumiditySensor for Htu21d<SDA, SCL, D>
where
    SDA: InputPin + OutputPin,
    SCL: InputPin + OutputPin + Wait,
    D: DelayNs,
{
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn initialize<T: CaptureTimer>(
        &mut self,
        arbiter: &TimerArbiter,
        timer: &mut T,
    ) -> Result<(), SensorError> {
        self.initialized = false;
        self.link.idle().map_err(link_error("release bus"))?;

        {
            let mut reservation = arbiter.reserve(Client::HumidityInit)?;
            if reservation.await_event(timer, &WARMUP, Some(WARMUP_DEADLINE)).await
                == WaitOutcome::TimedOut
            {
                return Err(SensorError::Timeout {
                    sensor: "HTU21D",
                    operation: "power-up warm-up",
                });
            }
        }

        if let Err(e) = self.configure().await {
            let _ = self.link.stop();
            warn!("HTU21D initialization failed: {:?}", e);
            return Err(SensorError::InitializationFailed {
                sensor: "HTU21D",
                details: "sensor did not acknowledge configuration",
            });
        }

        self.initialized = true;
        info!("HTU21D initialized");
        Ok(())
    }

    async fn read(&mut self) -> HtuReadings {
        let temperature = self.read_temperature().await;
        let humidity = self.read_humidity(temperature).await;
        HtuReadings {
            temperature,
            humidity,
        }
    }
}

fn link_error(operation: &'static str) -> impl Fn(LinkError) -> SensorError {
    move |e| match e {
        LinkError::StretchTimeout => SensorError::Timeout {
            sensor: "HTU21D",
            operation,
        },
        LinkError::Pin => SensorError::ReadFailed {
            sensor: "HTU21D",
            operation,
        },
    }
}
