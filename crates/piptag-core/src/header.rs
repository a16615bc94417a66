//! Packet data header.
//!
//! The header is a single byte of flags sent ahead of the sensed payload. Each
//! flag selects one payload field, and the fields appear on the wire in the
//! fixed order of [`PayloadField::ORDER`].
//!
//! Bit layout (LSB first):
//!
//! | Bit | Flag           | Payload bytes |
//! |-----|----------------|---------------|
//! | 0   | temp7 + binary | 1             |
//! | 1   | temp16 fixed   | 2             |
//! | 2   | relative light | 1             |
//! | 3   | HTU21D T + RH  | 4             |
//! | 4   | moisture       | 2             |
//! | 5   | history        | 6             |
//! | 6   | battery        | 4             |
//! | 7   | decode mode    | 0             |

use serde::{Deserialize, Serialize};

/// One flag of the [`DataHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadField {
    Temp7Binary,
    Temp16Fixed,
    RelativeLight,
    HtuSensing,
    Moisture,
    History,
    Battery,
    Decode,
}

impl PayloadField {
    /// Wire order of the payload fields.
    pub const ORDER: [PayloadField; 8] = [
        PayloadField::Temp7Binary,
        PayloadField::Temp16Fixed,
        PayloadField::RelativeLight,
        PayloadField::HtuSensing,
        PayloadField::Moisture,
        PayloadField::History,
        PayloadField::Battery,
        PayloadField::Decode,
    ];

    /// Bit mask of this flag inside the header byte.
    pub const fn mask(self) -> u8 {
        match self {
            PayloadField::Temp7Binary => 1 << 0,
            PayloadField::Temp16Fixed => 1 << 1,
            PayloadField::RelativeLight => 1 << 2,
            PayloadField::HtuSensing => 1 << 3,
            PayloadField::Moisture => 1 << 4,
            PayloadField::History => 1 << 5,
            PayloadField::Battery => 1 << 6,
            PayloadField::Decode => 1 << 7,
        }
    }

    /// Number of payload bytes the field contributes when set.
    pub const fn payload_len(self) -> usize {
        match self {
            PayloadField::Temp7Binary => 1,
            PayloadField::Temp16Fixed => 2,
            PayloadField::RelativeLight => 1,
            PayloadField::HtuSensing => 4,
            PayloadField::Moisture => 2,
            PayloadField::History => 6,
            PayloadField::Battery => 4,
            PayloadField::Decode => 0,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            PayloadField::Temp7Binary => "temp7+binary",
            PayloadField::Temp16Fixed => "temp16",
            PayloadField::RelativeLight => "light",
            PayloadField::HtuSensing => "htu21d",
            PayloadField::Moisture => "moisture",
            PayloadField::History => "history",
            PayloadField::Battery => "battery",
            PayloadField::Decode => "decode",
        }
    }
}

/// Single-byte set of payload flags.
///
/// Encoding is explicit (`to_byte` / `from_byte`) and never depends on struct
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataHeader(u8);

impl DataHeader {
    pub const EMPTY: DataHeader = DataHeader(0);

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn to_byte(self) -> u8 {
        self.0
    }

    pub const fn contains(self, field: PayloadField) -> bool {
        self.0 & field.mask() != 0
    }

    pub fn set(&mut self, field: PayloadField, enabled: bool) {
        if enabled {
            self.0 |= field.mask();
        } else {
            self.0 &= !field.mask();
        }
    }

    pub const fn with(self, field: PayloadField) -> Self {
        Self(self.0 | field.mask())
    }

    pub const fn temp7_binary(self) -> bool {
        self.contains(PayloadField::Temp7Binary)
    }

    pub const fn temp16_fixed(self) -> bool {
        self.contains(PayloadField::Temp16Fixed)
    }

    pub const fn relative_light(self) -> bool {
        self.contains(PayloadField::RelativeLight)
    }

    pub const fn htu_sensing(self) -> bool {
        self.contains(PayloadField::HtuSensing)
    }

    pub const fn moisture(self) -> bool {
        self.contains(PayloadField::Moisture)
    }

    pub const fn history(self) -> bool {
        self.contains(PayloadField::History)
    }

    pub const fn battery(self) -> bool {
        self.contains(PayloadField::Battery)
    }

    pub const fn decode(self) -> bool {
        self.contains(PayloadField::Decode)
    }

    /// Whether a die or HTU temperature source is enabled.
    pub const fn has_die_temperature(self) -> bool {
        self.temp7_binary() || self.temp16_fixed()
    }

    /// Number of sensing engines that run every epoch.
    ///
    /// Used to size the post-sensing settle delay.
    pub const fn enabled_sense_types(self) -> u32 {
        self.temp7_binary() as u32
            + self.temp16_fixed() as u32
            + self.relative_light() as u32
            + self.moisture() as u32
            + self.htu_sensing() as u32
    }

    /// Total payload length implied by the set flags.
    pub fn payload_len(self) -> usize {
        PayloadField::ORDER
            .iter()
            .filter(|field| self.contains(**field))
            .map(|field| field.payload_len())
            .sum()
    }
}

impl From<u8> for DataHeader {
    fn from(value: u8) -> Self {
        Self::from_byte(value)
    }
}

impl From<DataHeader> for u8 {
    fn from(value: DataHeader) -> Self {
        value.to_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_positions_match_wire_layout() {
        let header = DataHeader::EMPTY
            .with(PayloadField::Temp7Binary)
            .with(PayloadField::HtuSensing)
            .with(PayloadField::Battery);
        assert_eq!(header.to_byte(), 0b0100_1001);
        assert!(header.temp7_binary());
        assert!(header.htu_sensing());
        assert!(header.battery());
        assert!(!header.decode());
    }

    #[test]
    fn test_set_and_clear() {
        let mut header = DataHeader::from_byte(0xFF);
        header.set(PayloadField::History, false);
        header.set(PayloadField::Battery, false);
        assert_eq!(header.to_byte(), 0b1001_1111);
        header.set(PayloadField::Battery, true);
        assert!(header.battery());
    }

    #[test]
    fn test_enabled_sense_types_ignores_one_shot_flags() {
        let header = DataHeader::EMPTY
            .with(PayloadField::RelativeLight)
            .with(PayloadField::HtuSensing)
            .with(PayloadField::History)
            .with(PayloadField::Battery);
        assert_eq!(header.enabled_sense_types(), 2);
    }

    #[test]
    fn test_full_payload_fits_pool() {
        let header = DataHeader::from_byte(0x7F);
        assert_eq!(
            header.payload_len(),
            crate::mem_pool::POOL_CAPACITY,
            "every field at once must exactly fill one arena"
        );
    }
}
