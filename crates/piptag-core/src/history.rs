//! Hourly min/max history ring.
//!
//! Keeps 28 hours of temperature, humidity and light extrema. An "hour" is a
//! radio hour: it advances after a fixed number of transmissions, not by wall
//! clock, because the tag has no real-time clock.
//!
//! ## Broadcast rotation
//!
//! History goes out one unit per history packet, 40 packets per hour. The
//! oldest hour is the most likely to be lost by a receiver that missed
//! earlier broadcasts, so it is repeated every third call and on the last
//! call of the cycle. The remaining calls walk hours 1 through 26 in order.
//!
//! | Call | Slot        |
//! |------|-------------|
//! | 0    | head + 1    |
//! | 1    | head + 2    |
//! | 2    | oldest      |
//! | 3    | head + 3    |
//! | ...  | ...         |
//! | 39   | oldest      |

/// Number of hourly slots in the ring.
pub const HISTORY_SLOTS: usize = 28;

/// History broadcasts per radio hour (one hour / 90 s history interval).
pub const BROADCASTS_PER_HOUR: u8 = 40;

/// Transmissions per radio hour at the default 10 s packet interval.
pub const DEFAULT_RADIOS_PER_HOUR: u32 = 3_600_000 / 10_000;

/// Serialized size of one [`HistoryUnit`].
pub const HISTORY_UNIT_LEN: usize = 5;

/// Extrema for one radio hour.
///
/// Light is stored in a single byte: maximum in the high nibble, minimum in
/// the low nibble. Only the top four bits of a light reading are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryUnit {
    pub min_temp: i8,
    pub max_temp: i8,
    pub min_humid: i8,
    pub max_humid: i8,
    pub min_max_light: u8,
}

impl Default for HistoryUnit {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl HistoryUnit {
    /// Sentinel extrema so the first sample always wins.
    pub const EMPTY: HistoryUnit = HistoryUnit {
        min_temp: 127,
        max_temp: -127,
        min_humid: 127,
        max_humid: -127,
        min_max_light: 0x0F,
    };

    fn seeded(temp: i8, humidity: i8, light: u8) -> Self {
        Self {
            min_temp: temp,
            max_temp: temp,
            min_humid: humidity,
            max_humid: humidity,
            min_max_light: (light & 0xF0) | ((light >> 4) & 0x0F),
        }
    }

    fn widen(&mut self, temp: i8, humidity: i8, light: u8) {
        self.max_temp = self.max_temp.max(temp);
        self.min_temp = self.min_temp.min(temp);
        self.max_humid = self.max_humid.max(humidity);
        self.min_humid = self.min_humid.min(humidity);

        if light > (self.min_max_light & 0xF0) {
            self.min_max_light = (self.min_max_light & 0x0F) | (light & 0xF0);
        }
        // Compare against the stored minimum nibble, not the whole byte
        if (light >> 4) < (self.min_max_light & 0x0F) {
            self.min_max_light = (self.min_max_light & 0xF0) | ((light >> 4) & 0x0F);
        }
    }

    /// Maximum light nibble, scaled back to 0..=0xF0.
    pub const fn max_light(&self) -> u8 {
        self.min_max_light & 0xF0
    }

    /// Minimum light nibble, scaled back to 0..=0xF0.
    pub const fn min_light(&self) -> u8 {
        (self.min_max_light & 0x0F) << 4
    }

    pub fn to_bytes(&self) -> [u8; HISTORY_UNIT_LEN] {
        [
            self.min_temp as u8,
            self.max_temp as u8,
            self.min_humid as u8,
            self.max_humid as u8,
            self.min_max_light,
        ]
    }

    pub fn from_bytes(bytes: &[u8; HISTORY_UNIT_LEN]) -> Self {
        Self {
            min_temp: bytes[0] as i8,
            max_temp: bytes[1] as i8,
            min_humid: bytes[2] as i8,
            max_humid: bytes[3] as i8,
            min_max_light: bytes[4],
        }
    }
}

/// One unit chosen for broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBroadcast {
    /// Position in the broadcast cycle, sent ahead of the unit.
    pub index: u8,
    /// Ring slot the unit was read from.
    pub slot: usize,
    pub unit: HistoryUnit,
}

impl HistoryBroadcast {
    /// Wire block: index byte followed by the serialized unit.
    pub fn to_bytes(&self) -> [u8; HISTORY_UNIT_LEN + 1] {
        let mut bytes = [0u8; HISTORY_UNIT_LEN + 1];
        bytes[0] = self.index;
        bytes[1..].copy_from_slice(&self.unit.to_bytes());
        bytes
    }
}

pub struct HistoryBuffer {
    slots: [HistoryUnit; HISTORY_SLOTS],
    head: usize,
    head_hour: u32,
    index: u8,
    reg_value: u8,
    radios_per_hour: u32,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RADIOS_PER_HOUR)
    }
}

impl HistoryBuffer {
    pub fn new(radios_per_hour: u32) -> Self {
        Self {
            slots: [HistoryUnit::EMPTY; HISTORY_SLOTS],
            head: HISTORY_SLOTS - 1,
            head_hour: 0,
            index: 0,
            reg_value: 1,
            radios_per_hour: radios_per_hour.max(1),
        }
    }

    /// Fold one sample into the current radio hour.
    ///
    /// `radio_count` is the number of transmissions since power-on. When it
    /// crosses into a new hour the head moves back one slot and is reseeded,
    /// overwriting the oldest hour.
    pub fn fold(&mut self, temp: i8, humidity: i8, light: u8, radio_count: u32) {
        let hour_now = radio_count / self.radios_per_hour;

        if hour_now != self.head_hour {
            self.head_hour = hour_now;
            self.head = (self.head + HISTORY_SLOTS - 1) % HISTORY_SLOTS;
            self.slots[self.head] = HistoryUnit::seeded(temp, humidity, light);
            log::debug!("History advanced to hour {} (slot {})", hour_now, self.head);
        } else {
            self.slots[self.head].widen(temp, humidity, light);
        }
    }

    /// Pick the next unit to broadcast and advance the rotation.
    pub fn next(&mut self) -> HistoryBroadcast {
        let index = self.index;

        let slot = if index % 3 == 2 || index == BROADCASTS_PER_HOUR - 1 {
            self.oldest_slot()
        } else {
            let slot = (self.head + self.reg_value as usize) % HISTORY_SLOTS;
            self.reg_value += 1;
            if self.reg_value as usize >= HISTORY_SLOTS - 1 {
                self.reg_value = 1;
            }
            slot
        };

        self.index += 1;
        if self.index >= BROADCASTS_PER_HOUR {
            self.index = 0;
        }

        HistoryBroadcast {
            index,
            slot,
            unit: self.slots[slot],
        }
    }

    /// Unit recorded `hours_ago` hours before the current one. No side effects.
    pub fn at(&self, hours_ago: usize) -> &HistoryUnit {
        &self.slots[(hours_ago + self.head) % HISTORY_SLOTS]
    }

    pub const fn head(&self) -> usize {
        self.head
    }

    /// Broadcast index the next call to [`HistoryBuffer::next`] will report.
    pub const fn broadcast_index(&self) -> u8 {
        self.index
    }

    const fn oldest_slot(&self) -> usize {
        (self.head + HISTORY_SLOTS - 1) % HISTORY_SLOTS
    }
}
