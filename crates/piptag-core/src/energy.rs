//! Energy accounting.
//!
//! Every sensing engine and radio transmission bumps a counter. The battery
//! payload reports an estimate of the energy spent since power-on, computed
//! from per-operation costs measured on the reference board.

/// Operation counters since power-on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnergyCounters {
    pub wakeup: u32,
    pub binary: u32,
    pub temperature: u32,
    pub light: u32,
    pub moisture: u32,
    pub htu: u32,
    pub battery: u32,
    pub history: u32,
    pub radio: u32,
}

impl EnergyCounters {
    pub const fn new() -> Self {
        Self {
            wakeup: 0,
            binary: 0,
            temperature: 0,
            light: 0,
            moisture: 0,
            htu: 0,
            battery: 0,
            history: 0,
            radio: 0,
        }
    }

    /// Estimated energy used since power-on, in joules.
    ///
    /// Costs are in microjoules per operation. Cheap operations are counted
    /// in batches (binary per 256, die temperature per 128) to stay inside
    /// 32-bit arithmetic.
    pub fn used_joules(&self, wake_interval_ms: u32) -> u16 {
        let micro_joules = (self.binary >> 8) as u64 * 97
            + (self.temperature >> 7) as u64 * 293
            + ((self.battery as u64 * 51) >> 9)
            + self.radio as u64 * 54
            + self.history as u64 * 13
            + self.light as u64 * 3
            + self.htu as u64 * 39
            + (self.wakeup / 1_200_000) as u64 * wake_interval_ms as u64 * 285;

        (micro_joules / 1_000_000).min(u16::MAX as u64) as u16
    }
}
