//! Tag settings and runtime parameters.
//!
//! [`TagConfig`] holds the build-time settings of the tag (intervals, enable
//! flags, calibration tables). [`TagParameters`] holds the values a
//! provisioning link may override at boot: board ID, frequency, packet
//! interval and header.

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::header::{DataHeader, PayloadField};
use crate::packet::IdEncoding;
use crate::radio::link::{FREQ_MAX_HZ, FREQ_MIN_HZ};
use crate::sensors::moisture::MoistureConfig;
use crate::sensors::temperature::TemperatureCalibration;

// ---------------------------------------------------------------------------
// Time constants
// ---------------------------------------------------------------------------

pub const MS_EIGHTH_SECOND: u32 = 125;
pub const MS_QUARTER_SECOND: u32 = 250;
pub const MS_TEN_SECONDS: u32 = 10_000;
pub const MS_NINETY_SECONDS: u32 = 90_000;
pub const MS_ONE_HOUR: u32 = 3_600_000;

/// Default board ID.
pub const DEFAULT_BOARD_ID: u32 = 3377;

// ---------------------------------------------------------------------------
// Radio presets
// ---------------------------------------------------------------------------

/// Named carrier frequencies used by deployed receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Receivers tuned to 902.1 MHz
    Grail,
    /// Receivers tuned to 907.1 MHz
    Demo,
    /// Center of the ISM band
    MidBand,
    /// Upper band above GSM
    Fcc,
}

impl Band {
    pub const fn hz(self) -> u32 {
        match self {
            Band::Grail => 902_004_500,
            Band::Demo => 907_022_500,
            Band::MidBand => 915_000_000,
            Band::Fcc => 922_000_000,
        }
    }
}

/// Transmit power settings (PATABLE values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaPower {
    Dbm9_9,
    Dbm8_0,
    Dbm6_0,
    Dbm4_0,
    Dbm3_0,
    Dbm1_8,
    Dbm0_5,
    DbmMinus0_6,
    DbmMinus3_1,
    DbmMinus10_3,
    DbmMinus20_0,
    DbmMinus30_2,
    DbmMinus60_4,
}

impl PaPower {
    pub const fn patable(self) -> u8 {
        match self {
            PaPower::Dbm9_9 => 0xC0,
            PaPower::Dbm8_0 => 0xE5,
            PaPower::Dbm6_0 => 0xEB,
            PaPower::Dbm4_0 => 0x84,
            PaPower::Dbm3_0 => 0xA7,
            PaPower::Dbm1_8 => 0x8A,
            PaPower::Dbm0_5 => 0x8D,
            PaPower::DbmMinus0_6 => 0x8E,
            PaPower::DbmMinus3_1 => 0x5B,
            PaPower::DbmMinus10_3 => 0x6C,
            PaPower::DbmMinus20_0 => 0x0F,
            PaPower::DbmMinus30_2 => 0x03,
            PaPower::DbmMinus60_4 => 0x00,
        }
    }
}

// ---------------------------------------------------------------------------
// Build-time settings
// ---------------------------------------------------------------------------

/// Build-time tag settings.
///
/// Intervals are in milliseconds. The scheduler converts them to epoch steps
/// with [`TagConfig::steps`], so any interval shorter than the wake interval
/// means "every epoch".
#[derive(Debug, Clone, Copy)]
pub struct TagConfig {
    pub wake_interval_ms: u32,
    pub binary_interval_ms: u32,
    pub temperature_interval_ms: u32,
    pub light_interval_ms: u32,
    pub moisture_interval_ms: u32,
    pub htu_interval_ms: u32,
    pub battery_interval_ms: u32,
    pub history_interval_ms: u32,
    pub recalibration_interval_ms: u32,

    /// Extra transmissions after a binary change, counting the first one.
    pub repeat_count: u8,
    /// Gap before the second and third transmissions of a repeat burst.
    pub repeat_intervals_ms: [u32; 2],

    /// Die temperature change (°C) that forces a radio recalibration.
    pub recalibration_threshold_c: f32,
    /// Settle time granted to each enabled sensing engine.
    pub max_sense_delay_ms: u32,
    /// Gap between sensing engines so the supply capacitor can recharge.
    pub recharge_delay_ms: u32,

    pub history_enabled: bool,
    /// HTU21D mounted on the tag itself (its temperature can drive recalibration).
    pub htu_onboard: bool,
    pub htu_boot_init_attempts: u8,

    pub id_encoding: IdEncoding,
    pub pa_power: PaPower,
    pub moisture: MoistureConfig,
    pub temperature: TemperatureCalibration,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            wake_interval_ms: MS_TEN_SECONDS,
            binary_interval_ms: MS_TEN_SECONDS,
            temperature_interval_ms: MS_TEN_SECONDS,
            light_interval_ms: MS_TEN_SECONDS,
            moisture_interval_ms: MS_TEN_SECONDS,
            htu_interval_ms: MS_TEN_SECONDS,
            battery_interval_ms: MS_ONE_HOUR,
            history_interval_ms: MS_NINETY_SECONDS,
            recalibration_interval_ms: MS_ONE_HOUR,
            repeat_count: 3,
            repeat_intervals_ms: [MS_EIGHTH_SECOND, MS_QUARTER_SECOND],
            recalibration_threshold_c: 3.0,
            max_sense_delay_ms: 150,
            recharge_delay_ms: 10,
            history_enabled: false,
            htu_onboard: true,
            htu_boot_init_attempts: 5,
            id_encoding: IdEncoding::Crc24,
            pa_power: PaPower::Dbm6_0,
            moisture: MoistureConfig::default(),
            temperature: TemperatureCalibration::default(),
        }
    }
}

impl TagConfig {
    /// Number of wake-ups in `interval_ms`.
    pub const fn steps(&self, interval_ms: u32) -> i32 {
        (interval_ms / self.wake_interval_ms) as i32
    }

    /// Transmissions per radio hour for the given packet interval.
    pub const fn radios_per_hour(packet_interval_ms: u32) -> u32 {
        match MS_ONE_HOUR.checked_div(packet_interval_ms) {
            Some(0) | None => 1,
            Some(per_hour) => per_hour,
        }
    }

    /// Header enabled at boot before any provisioning.
    pub const fn default_header() -> DataHeader {
        DataHeader::EMPTY
            .with(PayloadField::RelativeLight)
            .with(PayloadField::HtuSensing)
    }
}

// ---------------------------------------------------------------------------
// Runtime parameters
// ---------------------------------------------------------------------------

pub const PROVISION_FRAME_LEN: usize = 14;
const PROVISION_UNLOCK: [u8; 2] = [0x11, 0x22];
const PROVISION_END: u8 = 0xAA;

const KEY_ID: u8 = 0x01;
const KEY_FREQ: u8 = 0x02;
const KEY_INTERVAL: u8 = 0x03;
const KEY_HEADER: u8 = 0x04;

/// Provisioned interval unit in milliseconds.
const INTERVAL_UNIT_MS: u32 = 600;

/// Encoded size of [`TagParameters`] never exceeds this.
pub const PARAMETERS_MAX_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Provisioning frame has wrong length {len}")]
    BadLength { len: usize },

    #[error("Provisioning frame lacks unlock or end code")]
    Locked,

    #[error("Unknown provisioning key {key:#04x}")]
    UnknownKey { key: u8 },

    #[error("Provisioning value for key {key:#04x} runs past the frame")]
    Truncated { key: u8 },

    #[error("Provisioned frequency {hz} Hz is outside the tunable range")]
    FrequencyOutOfRange { hz: u32 },

    #[error("Provisioned packet interval is zero")]
    ZeroInterval,

    #[error("Parameter encoding failed")]
    Encoding,
}

/// Runtime tag parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagParameters {
    /// 24-bit board ID (21-bit for the legacy ID encoding)
    pub board_id: u32,
    pub frequency_hz: u32,
    pub packet_interval_ms: u32,
    pub header: DataHeader,
}

impl Default for TagParameters {
    fn default() -> Self {
        Self {
            board_id: DEFAULT_BOARD_ID,
            frequency_hz: Band::Fcc.hz(),
            packet_interval_ms: MS_TEN_SECONDS,
            header: TagConfig::default_header(),
        }
    }
}

impl TagParameters {
    /// Apply a provisioning frame.
    ///
    /// Frame layout: unlock `0x11 0x22`, key/value pairs, `0xAA` padding up
    /// to 14 bytes. Fields not present are left unchanged. The frame is
    /// applied all-or-nothing.
    pub fn apply_provisioning_frame(&mut self, frame: &[u8]) -> Result<(), ProvisionError> {
        if frame.len() != PROVISION_FRAME_LEN {
            return Err(ProvisionError::BadLength { len: frame.len() });
        }
        if frame[..2] != PROVISION_UNLOCK || frame[PROVISION_FRAME_LEN - 1] != PROVISION_END {
            return Err(ProvisionError::Locked);
        }

        let mut updated = *self;
        let mut index = 2;
        while index < PROVISION_FRAME_LEN && frame[index] != PROVISION_END {
            let key = frame[index];
            let value_len = match key {
                KEY_ID => 3,
                KEY_FREQ => 1,
                KEY_INTERVAL => 2,
                KEY_HEADER => 1,
                _ => return Err(ProvisionError::UnknownKey { key }),
            };
            let value = frame
                .get(index + 1..index + 1 + value_len)
                .ok_or(ProvisionError::Truncated { key })?;

            match key {
                KEY_ID => {
                    updated.board_id =
                        (value[0] as u32) << 16 | (value[1] as u32) << 8 | value[2] as u32;
                }
                KEY_FREQ => {
                    let hz = 900_000_000 + value[0] as u32 * 1_000_000;
                    if !(FREQ_MIN_HZ..=FREQ_MAX_HZ).contains(&hz) {
                        return Err(ProvisionError::FrequencyOutOfRange { hz });
                    }
                    updated.frequency_hz = hz;
                }
                KEY_INTERVAL => {
                    let units = u16::from_be_bytes([value[0], value[1]]);
                    if units == 0 {
                        return Err(ProvisionError::ZeroInterval);
                    }
                    updated.packet_interval_ms = INTERVAL_UNIT_MS * units as u32;
                }
                _ => updated.header = DataHeader::from_byte(value[0]),
            }
            index += 1 + value_len;
        }

        log::info!(
            "Provisioned: id={} freq={} Hz interval={} ms header={:#04x}",
            updated.board_id,
            updated.frequency_hz,
            updated.packet_interval_ms,
            updated.header.to_byte()
        );
        *self = updated;
        Ok(())
    }

    /// Encode for storage across power cycles.
    pub fn to_bytes<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], ProvisionError> {
        postcard::to_slice(self, buf).map_err(|e| {
            log::error!("TagParameters encoding failed: {:?}", e);
            ProvisionError::Encoding
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProvisionError> {
        postcard::from_bytes(bytes).map_err(|e| {
            log::error!("TagParameters decoding failed: {:?}", e);
            ProvisionError::Encoding
        })
    }
}
