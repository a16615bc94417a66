//! Capability traits for the tag's on-chip peripherals.
//!
//! GPIO, SPI and delays come from `embedded-hal`. The traits here cover the
//! peripherals `embedded-hal` has no vocabulary for: the shared
//! capture/compare timer, the ADC and the pin choreography of the light,
//! moisture and contact front ends.

/// Clock feeding the capture/compare timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Internal very-low-power oscillator (~12 kHz, drifts with temperature)
    Vlo,
    /// Sub-main clock
    Smclk,
    /// Radio crystal divided down and routed out of GDO0
    ExternalCrystal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Count to the compare value, then interrupt
    Up,
    /// Count to 0xFFFF and wrap
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEdge {
    Rising,
    Falling,
}

/// Full timer configuration for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub source: ClockSource,
    pub divider: u8,
    pub mode: CountMode,
    pub compare: u16,
    /// Counter value loaded before starting.
    pub start_count: u16,
    /// Capture input edge, if the wait ends on a capture.
    pub capture: Option<CaptureEdge>,
}

impl TimerConfig {
    /// Up-mode wait that ends on the compare match.
    pub const fn compare(source: ClockSource, divider: u8, compare: u16) -> Self {
        Self {
            source,
            divider,
            mode: CountMode::Up,
            compare,
            start_count: 0,
            capture: None,
        }
    }

    pub const fn with_capture(mut self, edge: CaptureEdge) -> Self {
        self.capture = Some(edge);
        self
    }

    pub const fn with_start_count(mut self, count: u16) -> Self {
        self.start_count = count;
        self
    }

    pub const fn with_mode(mut self, mode: CountMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Saved timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerSnapshot {
    pub config: Option<TimerConfig>,
    pub count: u16,
    pub running: bool,
}

/// The single capture/compare timer.
///
/// The platform interrupt handler must forward every capture or compare
/// event to [`TimerArbiter::on_interrupt`](crate::TimerArbiter::on_interrupt)
/// and perform the returned action.
pub trait CaptureTimer {
    fn configure(&mut self, config: &TimerConfig);
    fn start(&mut self);
    fn stop(&mut self);
    fn save(&self) -> TimerSnapshot;
    fn restore(&mut self, snapshot: TimerSnapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcChannel {
    /// Supply voltage through the internal divide-by-two
    SupplyHalf,
    DieTemperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcReference {
    V1_5,
    V2_5,
}

/// 10-bit ADC with internal references.
pub trait AnalogFrontEnd {
    type Error: core::fmt::Debug;

    /// Power up the reference, convert once and power everything down.
    async fn sample(
        &mut self,
        channel: AdcChannel,
        reference: AdcReference,
    ) -> Result<u16, Self::Error>;
}

/// LED used as a photodiode.
pub trait LedSensor {
    /// Reverse-bias the LED to charge its junction capacitance.
    fn charge(&mut self);
    /// Float the cathode into the timer capture input.
    fn release_to_capture(&mut self);
    /// Return both pins to their low-power state.
    fn park(&mut self);
}

/// Capacitive moisture probe and its comparator.
pub trait MoistureProbe {
    /// Short the probe to ground.
    fn discharge(&mut self);
    /// Start charging and route the comparator output to the capture input.
    ///
    /// `swap` exchanges the comparator inputs to cancel its offset.
    fn connect_comparator(&mut self, swap: bool);
    /// Power the comparator down and float the probe.
    fn disconnect(&mut self);
}

/// Dry-contact input (reed switch, tilt switch).
pub trait ContactSensor {
    type Error: core::fmt::Debug;

    /// Current contact state, `true` when closed.
    async fn sense(&mut self) -> Result<bool, Self::Error>;
}
