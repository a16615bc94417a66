//! Desktop simulator for the PIPtag sensor tag.
//!
//! Runs the real piptag-core epoch scheduler against simulated hardware: a
//! capture timer that answers each arbiter client from a synthetic
//! environment, an ADC, the light LED, the moisture probe, a door contact,
//! an HTU21D and a register-file radio. Every transmitted frame is decoded
//! and logged.
//!
//! Simulated time advances one wake interval per epoch; nothing sleeps.
//!
//! # Usage
//!
//! ```text
//! RUST_LOG=debug piptag-simulator [EPOCHS]
//! ```
//!
//! `EPOCHS` defaults to one simulated hour.

use std::cell::RefCell;
use std::convert::Infallible;
use std::f64::consts::TAU;
use std::rc::Rc;

use embassy_futures::block_on;
use embassy_time::Duration;
use embedded_hal::digital::{ErrorType, InputPin};
use embedded_hal_async::digital::Wait;
use log::{error, info, warn};

use piptag_core::hal::{
    AdcChannel, AdcReference, AnalogFrontEnd, CaptureTimer, ClockSource, ContactSensor, LedSensor,
    MoistureProbe, TimerConfig, TimerSnapshot,
};
use piptag_core::header::PayloadField;
use piptag_core::radio::{RadioBus, RadioLink};
use piptag_core::radio::cc1101::{MARCSTATE, MARCSTATE_IDLE, PATABLE, SFTX, SPWD, TXFIFO};
use piptag_core::sensors::{
    HtuReadings, HtuValue, HumiditySensor, SensorError, TemperatureCalibration,
};
use piptag_core::timer_arbiter::{ActiveWaiter, Client, TimerArbiter, TimerEvent, WaitOutcome};
use piptag_core::{DataHeader, Scheduler, TagConfig, TagHardware, TagParameters};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Epochs run when no count is given (one hour at the default wake interval).
const DEFAULT_EPOCHS: u32 = 360;

/// Seconds between door open/close toggles.
const DOOR_PERIOD_SECS: f64 = 420.0;

/// Crystal/192 counts in a 100-tick window of a 10 kHz VLO.
const VLO_WINDOW_COUNT: f64 = 1354.0;

/// Every n-th humidity read comes back with a bad checksum.
const CRC_FAILURE_EVERY: u32 = 97;

// ---------------------------------------------------------------------------
// Synthetic environment
// ---------------------------------------------------------------------------

/// Slowly varying conditions around the tag.
struct Environment {
    /// Simulated seconds since power-on.
    elapsed_secs: f64,
}

impl Environment {
    fn new() -> Self {
        Self { elapsed_secs: 0.0 }
    }

    fn advance(&mut self, dt: Duration) {
        self.elapsed_secs += dt.as_millis() as f64 / 1000.0;
    }

    /// Day-shaped temperature between roughly 18 and 28 °C.
    fn temperature_c(&self) -> f64 {
        let t = self.elapsed_secs;
        23.0 + 5.0 * (TAU * t / 86_400.0).sin() + 0.4 * (t / 53.0).cos()
    }

    fn humidity_pct(&self) -> f64 {
        let t = self.elapsed_secs;
        55.0 - 12.0 * (TAU * t / 86_400.0).sin() + 2.0 * (t / 31.0).sin()
    }

    /// Light level 0 (dark) to 255, with a cloud now and then.
    fn light_level(&self) -> u8 {
        let t = self.elapsed_secs;
        let daylight = (TAU * t / 86_400.0).sin().max(0.0);
        let clouds = 0.8 + 0.2 * (t / 97.0).sin();
        (60.0 + 180.0 * daylight * clouds).clamp(0.0, 255.0) as u8
    }

    /// Supply droops under load and recovers.
    fn supply_mv(&self) -> f64 {
        2900.0 + 60.0 * (self.elapsed_secs / 600.0).sin()
    }

    /// Soil dries out over a few hours, between the two calibration points.
    fn moisture_count(&self) -> u16 {
        let wetness = 0.5 + 0.5 * (TAU * self.elapsed_secs / 14_400.0).cos();
        (260.0 + 590.0 * wetness) as u16
    }

    fn door_closed(&self) -> bool {
        (self.elapsed_secs / DOOR_PERIOD_SECS) as u64 % 2 == 1
    }

    /// The VLO runs slower as the tag warms up.
    fn vlo_window_count(&self) -> u16 {
        let drift = 1.0 + 0.004 * (self.temperature_c() - 23.0);
        (VLO_WINDOW_COUNT * drift) as u16
    }
}

type SharedEnvironment = Rc<RefCell<Environment>>;

// ---------------------------------------------------------------------------
// Simulated peripherals
// ---------------------------------------------------------------------------

/// Capture timer that completes each wait immediately with the event the
/// current owner would see on hardware.
struct SimTimer<'a> {
    arbiter: &'a TimerArbiter,
    env: SharedEnvironment,
    configured: Option<TimerConfig>,
    running: bool,
}

impl<'a> SimTimer<'a> {
    fn new(arbiter: &'a TimerArbiter, env: SharedEnvironment) -> Self {
        Self {
            arbiter,
            env,
            configured: None,
            running: false,
        }
    }

    fn event_for(&self, owner: ActiveWaiter, config: &TimerConfig) -> Option<TimerEvent> {
        let env = self.env.borrow();
        match owner {
            ActiveWaiter::None => None,
            ActiveWaiter::AmbientLight => match env.light_level() {
                0 => Some(TimerEvent::Compare),
                level => Some(TimerEvent::Capture(256 - level as u16)),
            },
            ActiveWaiter::Moisture => Some(TimerEvent::Capture(env.moisture_count())),
            ActiveWaiter::TimedSleep if config.source == ClockSource::ExternalCrystal => {
                Some(TimerEvent::Capture(env.vlo_window_count()))
            }
            ActiveWaiter::TimedSleep | ActiveWaiter::HumidityInit => Some(TimerEvent::Compare),
        }
    }
}

impl CaptureTimer for SimTimer<'_> {
    fn configure(&mut self, config: &TimerConfig) {
        self.configured = Some(*config);
    }

    fn start(&mut self) {
        self.running = true;
        let Some(config) = self.configured else {
            return;
        };
        if let Some(event) = self.event_for(self.arbiter.active(), &config) {
            self.arbiter.on_interrupt(event);
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn save(&self) -> TimerSnapshot {
        TimerSnapshot {
            config: self.configured,
            count: 0,
            running: self.running,
        }
    }

    fn restore(&mut self, snapshot: TimerSnapshot) {
        self.configured = snapshot.config;
        self.running = snapshot.running;
    }
}

struct SimAdc {
    env: SharedEnvironment,
    calibration: TemperatureCalibration,
}

impl AnalogFrontEnd for SimAdc {
    type Error = Infallible;

    async fn sample(
        &mut self,
        channel: AdcChannel,
        reference: AdcReference,
    ) -> Result<u16, Infallible> {
        let env = self.env.borrow();
        let raw = match (channel, reference) {
            (AdcChannel::SupplyHalf, AdcReference::V1_5) => env.supply_mv() * 1024.0 / 3000.0,
            (AdcChannel::SupplyHalf, AdcReference::V2_5) => env.supply_mv() * 1024.0 / 5000.0,
            (AdcChannel::DieTemperature, _) => {
                // The die runs a little warmer than the air
                let die_c = env.temperature_c() as f32 + 2.5;
                ((die_c - self.calibration.offset) / self.calibration.slope) as f64
            }
        };
        Ok(raw.clamp(0.0, 1023.0) as u16)
    }
}

/// Front ends whose effect is modelled by [`SimTimer`].
struct SimPins;

impl LedSensor for SimPins {
    fn charge(&mut self) {}

    fn release_to_capture(&mut self) {}

    fn park(&mut self) {}
}

impl MoistureProbe for SimPins {
    fn discharge(&mut self) {}

    fn connect_comparator(&mut self, _swap: bool) {}

    fn disconnect(&mut self) {}
}

struct SimDoor {
    env: SharedEnvironment,
}

impl ContactSensor for SimDoor {
    type Error = Infallible;

    async fn sense(&mut self) -> Result<bool, Infallible> {
        Ok(self.env.borrow().door_closed())
    }
}

/// HTU21D at the measurement level.
struct SimHtu {
    env: SharedEnvironment,
    initialized: bool,
    reads: u32,
}

impl HumiditySensor for SimHtu {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn initialize<T: CaptureTimer>(
        &mut self,
        arbiter: &TimerArbiter,
        timer: &mut T,
    ) -> Result<(), SensorError> {
        let mut warmup = arbiter.reserve(Client::HumidityInit)?;
        let config = TimerConfig::compare(ClockSource::Smclk, 4, 22_500);
        match warmup
            .await_event(timer, &config, Some(Duration::from_millis(50)))
            .await
        {
            WaitOutcome::Signaled(_) => {
                self.initialized = true;
                Ok(())
            }
            WaitOutcome::TimedOut => Err(SensorError::Timeout {
                sensor: "sim htu",
                operation: "warm-up",
            }),
        }
    }

    async fn read(&mut self) -> HtuReadings {
        self.reads += 1;
        if !self.initialized {
            return HtuReadings::FAILED;
        }
        let env = self.env.borrow();
        let humidity = if self.reads % CRC_FAILURE_EVERY == 0 {
            HtuValue::CrcFail
        } else {
            HtuValue::Measured(env.humidity_pct() as f32)
        };
        HtuReadings {
            temperature: HtuValue::Measured(env.temperature_c() as f32),
            humidity,
        }
    }
}

/// Register file with a transmit FIFO.
struct SimRadioBus {
    registers: [u8; 0x40],
    tx_fifo: Vec<u8>,
    patable: u8,
}

impl SimRadioBus {
    fn new() -> Self {
        Self {
            registers: [0; 0x40],
            tx_fifo: Vec::new(),
            patable: 0,
        }
    }
}

impl RadioBus for SimRadioBus {
    type Error = Infallible;

    async fn write_register(&mut self, address: u8, value: u8) -> Result<(), Infallible> {
        self.registers[address as usize & 0x3F] = value;
        Ok(())
    }

    async fn read_register(&mut self, address: u8) -> Result<u8, Infallible> {
        Ok(self.registers[address as usize & 0x3F])
    }

    async fn write_burst(&mut self, address: u8, data: &[u8]) -> Result<(), Infallible> {
        match address {
            TXFIFO => self.tx_fifo.extend_from_slice(data),
            PATABLE => self.patable = data.first().copied().unwrap_or_default(),
            _ => {
                for (offset, value) in data.iter().enumerate() {
                    self.registers[(address as usize + offset) & 0x3F] = *value;
                }
            }
        }
        Ok(())
    }

    async fn read_burst(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Infallible> {
        for (offset, slot) in buf.iter_mut().enumerate() {
            *slot = self.registers[(address as usize + offset) & 0x3F];
        }
        Ok(())
    }

    async fn strobe(&mut self, command: u8) -> Result<u8, Infallible> {
        if command == SPWD || command == SFTX {
            self.tx_fifo.clear();
        }
        Ok(0)
    }

    async fn read_status(&mut self, address: u8) -> Result<u8, Infallible> {
        Ok(if address == MARCSTATE { MARCSTATE_IDLE } else { 0 })
    }

    async fn wake(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// GDO0 that follows every wait at once.
struct SimGdo;

impl ErrorType for SimGdo {
    type Error = Infallible;
}

impl InputPin for SimGdo {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(false)
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(true)
    }
}

impl Wait for SimGdo {
    async fn wait_for_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// One-line summary of a transmitted frame.
fn describe(frame: &[u8]) -> String {
    let id = frame
        .get(1..4)
        .map(|id| u32::from_be_bytes([0, id[0], id[1], id[2]]))
        .unwrap_or_default();
    let Some(&header) = frame.get(4) else {
        return format!("id {} (no payload)", id);
    };

    let header = DataHeader::from_byte(header);
    let mut payload = &frame[5..];
    let mut fields = Vec::new();
    for field in PayloadField::ORDER {
        if !header.contains(field) || field.payload_len() == 0 {
            continue;
        }
        let Some((bytes, rest)) = payload.split_at_checked(field.payload_len()) else {
            fields.push(format!("{}=<truncated>", field.label()));
            break;
        };
        payload = rest;
        fields.push(format!("{}={}", field.label(), describe_field(field, bytes)));
    }
    format!("id {} header {:#04x}: {}", id, header.to_byte(), fields.join(" "))
}

fn describe_field(field: PayloadField, bytes: &[u8]) -> String {
    let word = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
    let fixed = |raw: u16| match raw {
        0x0FFE => "READ_FAIL".to_string(),
        0x0FFF => "CRC_FAIL".to_string(),
        raw => format!("{:.2}", raw as i16 as f32 / 16.0),
    };
    match field {
        PayloadField::Temp7Binary => format!(
            "{}C/{}",
            (bytes[0] >> 1) as i32 - 40,
            if bytes[0] & 1 == 1 { "closed" } else { "open" }
        ),
        PayloadField::Temp16Fixed => format!("{:.2}C", word(0) as i16 as f32 / 16.0 - 40.0),
        PayloadField::RelativeLight => bytes[0].to_string(),
        PayloadField::HtuSensing => format!("{}C/{}%", fixed(word(0)), fixed(word(2))),
        PayloadField::Moisture => word(0).to_string(),
        PayloadField::History => format!(
            "#{}[T {}..{} RH {}..{} L {:#04x}]",
            bytes[0], bytes[1] as i8, bytes[2] as i8, bytes[3] as i8, bytes[4] as i8, bytes[5]
        ),
        PayloadField::Battery => format!("{}mV/{}J", word(0), word(2)),
        PayloadField::Decode => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let epochs = match std::env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(epochs) => epochs,
            Err(e) => {
                error!("Invalid epoch count {:?}: {}", arg, e);
                return;
            }
        },
        None => DEFAULT_EPOCHS,
    };

    // Simulated time does not need the settle delay
    let config = TagConfig {
        max_sense_delay_ms: 0,
        history_enabled: true,
        ..TagConfig::default()
    };
    let params = TagParameters {
        header: TagConfig::default_header()
            .with(PayloadField::Temp7Binary)
            .with(PayloadField::Moisture),
        ..TagParameters::default()
    };
    let wake_interval = Duration::from_millis(config.wake_interval_ms as u64);

    info!("Starting PIPtag simulator for {} epochs", epochs);
    info!(
        "Tag {} at {} Hz, header {:#04x}, {} payload bytes per full frame",
        params.board_id,
        params.frequency_hz,
        params.header.to_byte(),
        params.header.payload_len()
    );

    let arbiter = TimerArbiter::new();
    let env: SharedEnvironment = Rc::new(RefCell::new(Environment::new()));

    let hw = TagHardware {
        timer: SimTimer::new(&arbiter, env.clone()),
        adc: SimAdc {
            env: env.clone(),
            calibration: config.temperature,
        },
        led: SimPins,
        probe: SimPins,
        contact: SimDoor { env: env.clone() },
        humidity: SimHtu {
            env: env.clone(),
            initialized: false,
            reads: 0,
        },
        radio: RadioLink::new(SimRadioBus::new(), SimGdo, config.id_encoding, config.pa_power),
    };
    let mut tag = Scheduler::new(config, params, hw, &arbiter);

    block_on(async {
        if let Err(e) = tag.boot().await {
            error!("Boot failed: {}", e);
            return;
        }

        let mut sent = 0u32;
        for epoch in 1..=epochs {
            env.borrow_mut().advance(wake_interval);
            match tag.run_epoch().await {
                Ok(report) => {
                    if let Some(frame) = report.frame {
                        sent += 1;
                        info!("[{:>5}] {}", epoch, describe(&frame));
                    }
                }
                Err(e) => warn!("[{:>5}] epoch failed: {}", epoch, e),
            }
        }

        let state = tag.state();
        info!(
            "Sent {} frames in {} epochs, {} J used, VLO at {:.2} ticks/ms",
            sent,
            epochs,
            state.energy.used_joules(tag.config().wake_interval_ms),
            state.vlo.ticks_per_ms()
        );
    });

    info!("Simulator exiting");
}
