//! Duty-cycled epoch scheduler.
//!
//! The tag spends almost all of its life asleep. Every wake interval it runs
//! one epoch: decrement the per-engine countdowns, run each enabled sensing
//! engine in payload order (fresh when its countdown expired, cached
//! otherwise), fold the hourly history, decide whether to transmit, then go
//! back to sleep. Engines are separated by a short low-power sleep so the
//! supply capacitor can recharge.

use embassy_time::{Duration, Timer};
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::config::{TagConfig, TagParameters};
use crate::energy::EnergyCounters;
use crate::hal::{AnalogFrontEnd, CaptureTimer, ContactSensor, LedSensor, MoistureProbe};
use crate::header::{DataHeader, PayloadField};
use crate::history::HistoryBuffer;
use crate::mem_pool::{MemoryPool, PoolError};
use crate::packet::{Frame, PacketError, build_frame};
use crate::radio::{RadioBus, RadioError, RadioLink};
use crate::sensors::moisture::MoistureError;
use crate::sensors::{
    self, AmbientLight, BatteryReading, BinarySensor, HtuReadings, HtuValue, HumiditySensor,
    MoistureEngine, SensorError, Temp7Binary, TemperatureTracker, battery,
};
use crate::timer_arbiter::{ArbiterError, TimerArbiter};
use crate::vlo::VloClock;

#[derive(Debug, Error, PartialEq)]
pub enum TagError<E> {
    #[error("Radio error: {0}")]
    Radio(RadioError<E>),

    #[error("Timer error: {0}")]
    Timer(ArbiterError),

    #[error("Sensor error: {0}")]
    Sensor(SensorError),

    #[error("Payload error: {0}")]
    Pool(PoolError),

    #[error("Packet error: {0}")]
    Packet(PacketError),
}

impl<E> From<RadioError<E>> for TagError<E> {
    fn from(value: RadioError<E>) -> Self {
        TagError::Radio(value)
    }
}

impl<E> From<ArbiterError> for TagError<E> {
    fn from(value: ArbiterError) -> Self {
        TagError::Timer(value)
    }
}

impl<E> From<SensorError> for TagError<E> {
    fn from(value: SensorError) -> Self {
        TagError::Sensor(value)
    }
}

impl<E> From<PoolError> for TagError<E> {
    fn from(value: PoolError) -> Self {
        TagError::Pool(value)
    }
}

impl<E> From<PacketError> for TagError<E> {
    fn from(value: PacketError) -> Self {
        TagError::Packet(value)
    }
}

impl<E> From<MoistureError<E>> for TagError<E> {
    fn from(value: MoistureError<E>) -> Self {
        match value {
            MoistureError::Sensor(e) => TagError::Sensor(e),
            MoistureError::Radio(e) => TagError::Radio(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware and state
// ---------------------------------------------------------------------------

/// Peripherals the scheduler drives.
pub struct TagHardware<T, A, L, P, C, H, B, G> {
    pub timer: T,
    pub adc: A,
    pub led: L,
    pub probe: P,
    pub contact: C,
    pub humidity: H,
    pub radio: RadioLink<B, G>,
}

/// Per-engine countdowns, in epochs.
///
/// An engine runs fresh when its countdown reaches zero (or has run past it)
/// and reloads it from its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdowns {
    pub transmit: i32,
    pub recalibration: i32,
    pub binary: i32,
    pub temperature: i32,
    pub light: i32,
    pub moisture: i32,
    pub htu: i32,
    pub battery: i32,
    pub history: i32,
    /// Epochs until the next repeat of a binary change.
    pub repeat: i32,
    /// Transmissions left in the current repeat burst.
    pub repeat_remaining: u8,
}

impl Countdowns {
    fn new(config: &TagConfig) -> Self {
        Self {
            transmit: 1,
            recalibration: 0,
            binary: config.steps(config.binary_interval_ms),
            temperature: 1,
            light: 1,
            moisture: 1,
            htu: 1,
            battery: 1,
            history: 1,
            repeat: 0,
            repeat_remaining: 0,
        }
    }

    fn tick(&mut self) {
        self.transmit -= 1;
        self.recalibration -= 1;
        self.binary -= 1;
        self.temperature -= 1;
        self.light -= 1;
        self.moisture -= 1;
        self.htu -= 1;
        self.battery -= 1;
        self.history -= 1;
        if self.repeat > 0 {
            self.repeat -= 1;
        }
    }
}

/// Everything the tag remembers between epochs.
pub struct TagState {
    pub params: TagParameters,
    pub countdowns: Countdowns,
    pub energy: EnergyCounters,
    pub pool: MemoryPool,
    pub history: HistoryBuffer,
    pub temperature: TemperatureTracker,
    pub binary: BinarySensor,
    pub light: AmbientLight,
    pub moisture: MoistureEngine,
    pub vlo: VloClock,
    pub htu: HtuReadings,
    htu_sensed: bool,
    pub battery_mv: u16,
    /// Set when this epoch already refreshed the recalibration temperature.
    updated_temperature: bool,
}

impl TagState {
    pub fn new(config: &TagConfig, params: TagParameters) -> Self {
        Self {
            params,
            countdowns: Countdowns::new(config),
            energy: EnergyCounters::new(),
            pool: MemoryPool::new(),
            history: HistoryBuffer::new(TagConfig::radios_per_hour(params.packet_interval_ms)),
            temperature: TemperatureTracker::new(config.temperature),
            binary: BinarySensor::new(),
            light: AmbientLight::new(),
            moisture: MoistureEngine::new(config.moisture),
            vlo: VloClock::new(),
            htu: HtuReadings::FAILED,
            htu_sensed: false,
            battery_mv: 0,
            updated_temperature: false,
        }
    }

    /// Header for the next epoch.
    ///
    /// Battery and History are one-shot: they are only set for the epoch
    /// that queues their block, never carried over from the parameters.
    pub fn header(&self) -> DataHeader {
        let mut header = self.params.header;
        header.set(PayloadField::Battery, false);
        header.set(PayloadField::History, false);
        header
    }
}

/// Outcome of one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    /// Frame sent this epoch, if any.
    pub frame: Option<Frame>,
    /// Sleep before the next epoch.
    pub sleep: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<'a, T, A, L, P, C, H, B, G> {
    config: TagConfig,
    state: TagState,
    hw: TagHardware<T, A, L, P, C, H, B, G>,
    arbiter: &'a TimerArbiter,
}

impl<'a, T, A, L, P, C, H, B, G> Scheduler<'a, T, A, L, P, C, H, B, G>
where
    T: CaptureTimer,
    A: AnalogFrontEnd,
    L: LedSensor,
    P: MoistureProbe,
    C: ContactSensor,
    H: HumiditySensor,
    B: RadioBus,
    G: InputPin + Wait,
{
    pub fn new(
        config: TagConfig,
        params: TagParameters,
        hw: TagHardware<T, A, L, P, C, H, B, G>,
        arbiter: &'a TimerArbiter,
    ) -> Self {
        Self {
            state: TagState::new(&config, params),
            config,
            hw,
            arbiter,
        }
    }

    pub fn config(&self) -> &TagConfig {
        &self.config
    }

    pub fn state(&self) -> &TagState {
        &self.state
    }

    pub fn hardware(&self) -> &TagHardware<T, A, L, P, C, H, B, G> {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut TagHardware<T, A, L, P, C, H, B, G> {
        &mut self.hw
    }

    /// Power-on sequence.
    ///
    /// Configures and calibrates the radio, calibrates the VLO against the
    /// radio crystal, takes a first supply reading and brings up the
    /// humidity module when it is enabled.
    pub async fn boot(&mut self) -> Result<(), TagError<B::Error>> {
        let params = self.state.params;
        info!(
            "Booting tag {} at {} Hz, header {:#04x}",
            params.board_id,
            params.frequency_hz,
            params.header.to_byte()
        );

        self.hw.radio.setup_and_power_down(params.frequency_hz).await?;
        if let Err(e) = self
            .state
            .vlo
            .calibrate(self.arbiter, &mut self.hw.timer, &mut self.hw.radio)
            .await
        {
            warn!("Keeping nominal VLO rate: {}", e);
        }
        self.hw.radio.power_down().await?;

        self.state.battery_mv = battery::supply_millivolts(&mut self.hw.adc).await?;

        if params.header.htu_sensing() {
            for attempt in 1..=self.config.htu_boot_init_attempts {
                match self.hw.humidity.initialize(self.arbiter, &mut self.hw.timer).await {
                    Ok(()) => {
                        info!("Humidity sensor ready after {} attempt(s)", attempt);
                        break;
                    }
                    Err(e) => warn!("Humidity sensor attempt {} failed: {}", attempt, e),
                }
            }
        }
        Ok(())
    }

    /// Run epochs forever.
    pub async fn run(&mut self) -> ! {
        loop {
            let sleep = match self.run_epoch().await {
                Ok(report) => report.sleep,
                Err(e) => {
                    error!("Epoch failed: {}", e);
                    self.epoch_sleep()
                }
            };
            Timer::after(sleep).await;
        }
    }

    /// One wake-up.
    ///
    /// The payload arena is rotated and the recalibration flag cleared even
    /// when the epoch fails part way.
    pub async fn run_epoch(&mut self) -> Result<EpochReport, TagError<B::Error>> {
        let result = self.epoch().await;
        self.state.pool.reset_epoch();
        self.state.updated_temperature = false;

        let frame = result?;
        Ok(EpochReport {
            frame,
            sleep: self.epoch_sleep(),
        })
    }

    /// Wake interval less the settle time already spent.
    fn epoch_sleep(&self) -> Duration {
        let spent = self.settle_ms();
        Duration::from_millis(self.config.wake_interval_ms.saturating_sub(spent) as u64)
    }

    fn settle_ms(&self) -> u32 {
        self.config.max_sense_delay_ms * self.state.header().enabled_sense_types()
    }

    async fn epoch(&mut self) -> Result<Option<Frame>, TagError<B::Error>> {
        let mut header = self.state.header();
        self.state.countdowns.tick();
        self.state.energy.wakeup += 1;

        let countdowns = self.state.countdowns;
        let mut transmit = (countdowns.repeat_remaining > 0 && countdowns.repeat == 0)
            || countdowns.transmit <= 0;

        if !header.decode() {
            transmit |= self.sense(header).await?;
        }

        let settle = self.settle_ms();
        if settle > 0 {
            Timer::after_millis(settle as u64).await;
        }

        if header.htu_sensing() || header.relative_light() {
            self.fold_history(header);
        }

        if self.config.history_enabled
            && self.state.countdowns.history < 1
            && (transmit || self.state.countdowns.battery < 1)
        {
            self.state.countdowns.history = self.config.steps(self.config.history_interval_ms);
            let broadcast = self.state.history.next();
            debug!("History slot {} as broadcast {}", broadcast.slot, broadcast.index);
            self.state.pool.push(&broadcast.to_bytes())?;
            header.set(PayloadField::History, true);
            self.state.energy.history += 1;
        }

        if self.state.countdowns.battery < 1 {
            self.state.countdowns.battery = self.config.steps(self.config.battery_interval_ms);
            self.state.battery_mv = battery::supply_millivolts(&mut self.hw.adc).await?;
            self.state.energy.battery += 1;
            let reading = BatteryReading {
                millivolts: self.state.battery_mv,
                used_joules: self.state.energy.used_joules(self.config.wake_interval_ms),
            };
            sensors::append(&mut self.state.pool, &reading)?;
            header.set(PayloadField::Battery, true);
            transmit = true;
        }

        if !transmit {
            return Ok(None);
        }
        self.transmit(header).await.map(Some)
    }

    /// Run the enabled engines in payload order. Returns true when a binary
    /// change demands an immediate transmission.
    async fn sense(&mut self, header: DataHeader) -> Result<bool, TagError<B::Error>> {
        let mut urgent = false;

        if self.state.countdowns.temperature <= 0 {
            if header.temp7_binary() {
                self.state.temperature.update_temp7(&mut self.hw.adc).await?;
                self.state.energy.temperature += 1;
                self.state.updated_temperature = true;
            }
            if header.temp16_fixed() {
                let fresh = !self.state.updated_temperature;
                self.state.temperature.update_temp16(&mut self.hw.adc, fresh).await?;
                if fresh {
                    self.state.energy.temperature += 1;
                }
                self.state.updated_temperature = true;
            }
            self.state.countdowns.temperature = self.config.steps(self.config.temperature_interval_ms);
            self.recharge().await?;
        }

        if header.temp7_binary() {
            let forced = self.state.countdowns.binary <= 0;
            let first = !self.state.binary.sensed();
            let changed = self.state.binary.update(&mut self.hw.contact, forced).await?;
            if forced || first {
                self.state.energy.binary += 1;
            }
            if first {
                self.state.temperature.update_temp7(&mut self.hw.adc).await?;
            }
            if changed {
                info!("Contact changed, sending a burst of {}", self.config.repeat_count);
                self.state.countdowns.repeat_remaining = self.config.repeat_count;
                urgent = true;
            }
            if forced {
                self.state.countdowns.binary = self.config.steps(self.config.binary_interval_ms);
            }

            let reading = Temp7Binary {
                temp7: self.state.temperature.temp7(),
                binary: self.state.binary.state(),
            };
            sensors::append(&mut self.state.pool, &reading)?;
            self.recharge().await?;
        }

        if header.temp16_fixed() {
            let reading = self.state.temperature.temp16(&mut self.hw.adc).await?;
            sensors::append(&mut self.state.pool, &reading)?;
            self.recharge().await?;
        }

        if header.relative_light() {
            let fresh = self.state.countdowns.light <= 0;
            self.state
                .light
                .sense(fresh, &mut self.hw.led, self.arbiter, &mut self.hw.timer)
                .await?;
            if fresh {
                self.state.countdowns.light = self.config.steps(self.config.light_interval_ms);
                self.state.energy.light += 1;
            }
            sensors::append(&mut self.state.pool, &self.state.light)?;
            self.recharge().await?;
        }

        if header.htu_sensing() {
            self.sense_humidity(header).await?;
            sensors::append(&mut self.state.pool, &self.state.htu)?;
            self.recharge().await?;
        }

        if header.moisture() {
            let fresh = self.state.countdowns.moisture <= 0;
            self.state
                .moisture
                .sense(
                    fresh,
                    &mut self.hw.probe,
                    self.arbiter,
                    &mut self.hw.timer,
                    &mut self.hw.radio,
                    self.state.battery_mv,
                )
                .await?;
            if fresh {
                self.state.countdowns.moisture = self.config.steps(self.config.moisture_interval_ms);
                self.state.energy.moisture += 1;
            }
            sensors::append(&mut self.state.pool, &self.state.moisture)?;
            self.recharge().await?;
        }

        Ok(urgent)
    }

    async fn sense_humidity(&mut self, header: DataHeader) -> Result<(), TagError<B::Error>> {
        if !self.hw.humidity.is_initialized() {
            // Read anyway; a dead module reports in-band failure values
            if let Err(e) = self.hw.humidity.initialize(self.arbiter, &mut self.hw.timer).await {
                warn!("Humidity sensor still down: {}", e);
            }
        }

        if self.state.countdowns.htu > 0 && self.state.htu_sensed {
            return Ok(());
        }

        self.state.htu = self.hw.humidity.read().await;
        self.state.htu_sensed = true;
        self.state.countdowns.htu = self.config.steps(self.config.htu_interval_ms);
        self.state.energy.htu += 1;

        if self.config.htu_onboard {
            if !header.has_die_temperature() {
                if let HtuValue::Measured(celsius) = self.state.htu.temperature {
                    self.state.temperature.set_last(celsius);
                }
            }
            self.state.updated_temperature = true;
        }
        Ok(())
    }

    /// Fold this epoch's climate into the current history hour.
    ///
    /// Without the humidity module the climate fields stay zero; with it, a
    /// failed reading is left out of the hour entirely.
    fn fold_history(&mut self, header: DataHeader) {
        let climate = if header.htu_sensing() {
            match (self.state.htu.temperature, self.state.htu.humidity) {
                // Float casts saturate at the i8 range
                (HtuValue::Measured(t), HtuValue::Measured(rh)) => Some((t as i8, rh as i8)),
                _ => None,
            }
        } else {
            Some((0, 0))
        };

        match climate {
            Some((temp, humidity)) => self.state.history.fold(
                temp,
                humidity,
                self.state.light.cached(),
                self.state.energy.radio,
            ),
            None => debug!("Skipping history fold on a failed humidity reading"),
        }
    }

    async fn transmit(&mut self, header: DataHeader) -> Result<Frame, TagError<B::Error>> {
        let countdowns = &mut self.state.countdowns;
        countdowns.transmit = self.config.steps(self.state.params.packet_interval_ms);
        self.state.energy.radio += 1;

        if countdowns.repeat_remaining > 0 {
            countdowns.repeat_remaining -= 1;
            let gap = match countdowns.repeat_remaining {
                2 => Some(self.config.repeat_intervals_ms[0]),
                1 => Some(self.config.repeat_intervals_ms[1]),
                _ => None,
            };
            if let Some(gap_ms) = gap {
                countdowns.repeat = self.config.steps(gap_ms);
            }
        }

        // The recalibration check needs a temperature from some source
        let has_source = header.has_die_temperature()
            || (self.config.htu_onboard && header.htu_sensing());
        if !self.state.updated_temperature && !has_source {
            self.state.temperature.sense(&mut self.hw.adc).await?;
            self.state.energy.temperature += 1;
        }

        let radio = &mut self.hw.radio;
        radio.wake().await?;
        radio.rewrite_registers().await?;

        let recalibrate = self.state.countdowns.recalibration <= 1
            || self
                .state
                .temperature
                .needs_recalibration(self.config.recalibration_threshold_c);
        if recalibrate {
            info!("Recalibrating radio at {:.1} C", self.state.temperature.last());
            radio.recalibrate(self.state.params.frequency_hz).await?;
            if let Err(e) = self
                .state
                .vlo
                .calibrate(self.arbiter, &mut self.hw.timer, &mut self.hw.radio)
                .await
            {
                warn!("VLO calibration skipped: {}", e);
            }
            self.state.temperature.mark_calibrated();
            self.state.countdowns.recalibration =
                self.config.steps(self.config.recalibration_interval_ms);
        } else {
            radio.restore_snapshot().await?;
        }

        let radio = &mut self.hw.radio;
        radio.set_power().await?;
        let id = self.config.id_encoding.encode(self.state.params.board_id);
        let frame = build_frame(id, header, self.state.pool.base())?;
        radio.transmit_and_power_down(&frame).await?;
        debug!(
            "Sent {} payload bytes with header {:#04x}",
            self.state.pool.size(),
            header.to_byte()
        );
        Ok(frame)
    }

    /// Low-power pause between engines.
    async fn recharge(&mut self) -> Result<(), ArbiterError> {
        self.state
            .vlo
            .sleep_ms(self.arbiter, &mut self.hw.timer, self.config.recharge_delay_ms)
            .await
    }
}
