//! Test doubles shared by the unit tests.

use core::convert::Infallible;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::hal::{
    AdcChannel, AdcReference, AnalogFrontEnd, CaptureTimer, ContactSensor, LedSensor,
    MoistureProbe, TimerConfig, TimerSnapshot,
};
use crate::radio::RadioBus;
use crate::radio::cc1101::{MARCSTATE, MARCSTATE_IDLE, PATABLE, RXBYTES, RXFIFO, SFRX, SFTX, SPWD, TXFIFO};
use crate::sensors::htu21d::{
    HOLD_HUMIDITY, HOLD_TEMPERATURE, HTU_ADDRESS, READ_FLAG, READ_USER_REGISTER,
    WRITE_USER_REGISTER, crc8,
};
use crate::sensors::{HtuReadings, HumiditySensor, SensorError};
use crate::timer_arbiter::{ActiveWaiter, TimerArbiter, TimerEvent};

// ---------------------------------------------------------------------------
// Capture timer
// ---------------------------------------------------------------------------

/// Timer that raises its interrupt as soon as it is started.
///
/// Events come from the one-shot script first, then from the per-owner
/// responses, and default to a compare match. `None` means the interrupt
/// never fires.
pub struct MockTimer<'a> {
    arbiter: &'a TimerArbiter,
    script: VecDeque<Option<TimerEvent>>,
    responses: Vec<(ActiveWaiter, Option<TimerEvent>)>,
    configured: Option<TimerConfig>,
    running: bool,
    count: u16,
    starts: Vec<(ActiveWaiter, TimerConfig)>,
}

impl<'a> MockTimer<'a> {
    pub fn new(arbiter: &'a TimerArbiter) -> Self {
        Self {
            arbiter,
            script: VecDeque::new(),
            responses: Vec::new(),
            configured: None,
            running: false,
            count: 0,
            starts: Vec::new(),
        }
    }

    pub fn script(&mut self, event: Option<TimerEvent>) {
        self.script.push_back(event);
    }

    pub fn respond_to(&mut self, waiter: ActiveWaiter, event: Option<TimerEvent>) {
        self.responses.retain(|(owner, _)| *owner != waiter);
        self.responses.push((waiter, event));
    }

    pub fn configured(&self) -> Option<TimerConfig> {
        self.configured
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn starts(&self) -> &[(ActiveWaiter, TimerConfig)] {
        &self.starts
    }
}

impl CaptureTimer for MockTimer<'_> {
    fn configure(&mut self, config: &TimerConfig) {
        self.configured = Some(*config);
        self.count = config.start_count;
    }

    fn start(&mut self) {
        self.running = true;
        let owner = self.arbiter.active();
        if let Some(config) = self.configured {
            self.starts.push((owner, config));
        }

        let event = match self.script.pop_front() {
            Some(event) => event,
            None => self
                .responses
                .iter()
                .find(|(waiter, _)| *waiter == owner)
                .map(|(_, event)| *event)
                .unwrap_or(Some(TimerEvent::Compare)),
        };
        if let Some(event) = event {
            self.arbiter.on_interrupt(event);
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn save(&self) -> TimerSnapshot {
        TimerSnapshot {
            config: self.configured,
            count: self.count,
            running: self.running,
        }
    }

    fn restore(&mut self, snapshot: TimerSnapshot) {
        self.configured = snapshot.config;
        self.count = snapshot.count;
        self.running = snapshot.running;
    }
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Write(u8, u8),
    Read(u8),
    WriteBurst(u8, Vec<u8>),
    ReadBurst(u8, usize),
    Strobe(u8),
    Status(u8),
    Wake,
}

/// Register file with FIFOs that records every bus operation.
pub struct MockRadioBus {
    registers: [u8; 0x40],
    ops: Vec<BusOp>,
    marcstate: VecDeque<u8>,
    rx_fifo: VecDeque<u8>,
    tx_fifo: Vec<u8>,
    frames: Vec<Vec<u8>>,
    patable: u8,
}

impl MockRadioBus {
    pub fn new() -> Self {
        Self {
            registers: [0; 0x40],
            ops: Vec::new(),
            marcstate: VecDeque::new(),
            rx_fifo: VecDeque::new(),
            tx_fifo: Vec::new(),
            frames: Vec::new(),
            patable: 0,
        }
    }

    pub fn ops(&self) -> &[BusOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Preload a register without recording an operation.
    pub fn set_register(&mut self, address: u8, value: u8) {
        self.registers[address as usize & 0x3F] = value;
    }

    pub fn register(&self, address: u8) -> u8 {
        self.registers[address as usize & 0x3F]
    }

    /// MARCSTATE values returned by successive polls; idle afterwards.
    pub fn script_marcstate(&mut self, states: &[u8]) {
        self.marcstate.extend(states.iter().copied());
    }

    pub fn load_rx_fifo(&mut self, bytes: &[u8]) {
        self.rx_fifo.extend(bytes.iter().copied());
    }

    pub fn rx_fifo_is_empty(&self) -> bool {
        self.rx_fifo.is_empty()
    }

    /// Frames flushed to the air by a power-down after loading the TX FIFO.
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn patable(&self) -> u8 {
        self.patable
    }
}

impl RadioBus for MockRadioBus {
    type Error = Infallible;

    async fn write_register(&mut self, address: u8, value: u8) -> Result<(), Infallible> {
        self.ops.push(BusOp::Write(address, value));
        self.set_register(address, value);
        Ok(())
    }

    async fn read_register(&mut self, address: u8) -> Result<u8, Infallible> {
        self.ops.push(BusOp::Read(address));
        if address == RXFIFO {
            return Ok(self.rx_fifo.pop_front().unwrap_or(0));
        }
        Ok(self.register(address))
    }

    async fn write_burst(&mut self, address: u8, data: &[u8]) -> Result<(), Infallible> {
        self.ops.push(BusOp::WriteBurst(address, data.to_vec()));
        match address {
            TXFIFO => self.tx_fifo.extend_from_slice(data),
            PATABLE => self.patable = data.first().copied().unwrap_or(0),
            _ => {
                for (offset, value) in data.iter().enumerate() {
                    self.set_register(address + offset as u8, *value);
                }
            }
        }
        Ok(())
    }

    async fn read_burst(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Infallible> {
        self.ops.push(BusOp::ReadBurst(address, buf.len()));
        for (offset, slot) in buf.iter_mut().enumerate() {
            *slot = if address == RXFIFO {
                self.rx_fifo.pop_front().unwrap_or(0)
            } else {
                self.register(address + offset as u8)
            };
        }
        Ok(())
    }

    async fn strobe(&mut self, command: u8) -> Result<u8, Infallible> {
        self.ops.push(BusOp::Strobe(command));
        match command {
            SFRX => self.rx_fifo.clear(),
            SFTX => self.tx_fifo.clear(),
            SPWD if !self.tx_fifo.is_empty() => {
                self.frames.push(core::mem::take(&mut self.tx_fifo));
            }
            _ => {}
        }
        Ok(0)
    }

    async fn read_status(&mut self, address: u8) -> Result<u8, Infallible> {
        self.ops.push(BusOp::Status(address));
        Ok(match address {
            MARCSTATE => self.marcstate.pop_front().unwrap_or(MARCSTATE_IDLE),
            RXBYTES => self.rx_fifo.len() as u8,
            _ => 0,
        })
    }

    async fn wake(&mut self) -> Result<(), Infallible> {
        self.ops.push(BusOp::Wake);
        Ok(())
    }
}

/// GDO0 line that follows every wait at once, or is held at one level.
pub struct MockGdo {
    held: Option<bool>,
}

impl MockGdo {
    pub fn toggling() -> Self {
        Self { held: None }
    }

    /// Never rises: no sync word arrives.
    pub fn stuck_low() -> Self {
        Self { held: Some(false) }
    }

    /// Never falls: sync arrives but the packet never ends.
    pub fn stuck_high() -> Self {
        Self { held: Some(true) }
    }

    async fn reach(&self, high: bool) {
        if self.held.is_some_and(|level| level != high) {
            core::future::pending::<()>().await;
        }
    }

    /// A held line never produces an edge.
    async fn edge(&self) {
        if self.held.is_some() {
            core::future::pending::<()>().await;
        }
    }
}

impl ErrorType for MockGdo {
    type Error = Infallible;
}

impl InputPin for MockGdo {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.held.unwrap_or(true))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.held.unwrap_or(true))
    }
}

impl Wait for MockGdo {
    async fn wait_for_high(&mut self) -> Result<(), Infallible> {
        self.reach(true).await;
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Infallible> {
        self.reach(false).await;
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
        self.edge().await;
        Ok(())
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
        self.edge().await;
        Ok(())
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
        self.edge().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sensing front ends
// ---------------------------------------------------------------------------

/// ADC returning fixed raw counts per channel and reference.
pub struct MockAdc {
    pub supply_low_ref: u16,
    pub supply_high_ref: u16,
    pub die: u16,
    pub fail: bool,
    samples: Vec<(AdcChannel, AdcReference)>,
}

impl MockAdc {
    /// 2800 mV supply, die at 22 °C.
    pub fn new() -> Self {
        Self {
            supply_low_ref: 956,
            supply_high_ref: 0,
            die: 726,
            fail: false,
            samples: Vec::new(),
        }
    }

    pub fn samples(&self) -> &[(AdcChannel, AdcReference)] {
        &self.samples
    }
}

impl AnalogFrontEnd for MockAdc {
    type Error = &'static str;

    async fn sample(
        &mut self,
        channel: AdcChannel,
        reference: AdcReference,
    ) -> Result<u16, Self::Error> {
        self.samples.push((channel, reference));
        if self.fail {
            return Err("conversion failed");
        }
        Ok(match (channel, reference) {
            (AdcChannel::SupplyHalf, AdcReference::V1_5) => self.supply_low_ref,
            (AdcChannel::SupplyHalf, AdcReference::V2_5) => self.supply_high_ref,
            (AdcChannel::DieTemperature, _) => self.die,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCall {
    Charge,
    Release,
    Park,
}

#[derive(Default)]
pub struct MockLed {
    calls: Vec<LedCall>,
}

impl MockLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[LedCall] {
        &self.calls
    }
}

impl LedSensor for MockLed {
    fn charge(&mut self) {
        self.calls.push(LedCall::Charge);
    }

    fn release_to_capture(&mut self) {
        self.calls.push(LedCall::Release);
    }

    fn park(&mut self) {
        self.calls.push(LedCall::Park);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCall {
    Discharge,
    Connect(bool),
    Disconnect,
}

#[derive(Default)]
pub struct MockProbe {
    calls: Vec<ProbeCall>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[ProbeCall] {
        &self.calls
    }
}

impl MoistureProbe for MockProbe {
    fn discharge(&mut self) {
        self.calls.push(ProbeCall::Discharge);
    }

    fn connect_comparator(&mut self, swap: bool) {
        self.calls.push(ProbeCall::Connect(swap));
    }

    fn disconnect(&mut self) {
        self.calls.push(ProbeCall::Disconnect);
    }
}

/// Contact that plays back scripted states and then holds the last one.
#[derive(Default)]
pub struct MockContact {
    states: VecDeque<bool>,
    last: bool,
    senses: usize,
}

impl MockContact {
    pub fn new(states: &[bool]) -> Self {
        Self {
            states: states.iter().copied().collect(),
            last: false,
            senses: 0,
        }
    }

    pub fn senses(&self) -> usize {
        self.senses
    }
}

impl ContactSensor for MockContact {
    type Error = Infallible;

    async fn sense(&mut self) -> Result<bool, Infallible> {
        self.senses += 1;
        if let Some(state) = self.states.pop_front() {
            self.last = state;
        }
        Ok(self.last)
    }
}

/// Humidity module with scripted initialization results.
pub struct MockHumidity {
    pub readings: HtuReadings,
    init_results: VecDeque<bool>,
    initialized: bool,
    reads: usize,
    inits: usize,
}

impl MockHumidity {
    pub fn new(readings: HtuReadings) -> Self {
        Self {
            readings,
            init_results: VecDeque::new(),
            initialized: false,
            reads: 0,
            inits: 0,
        }
    }

    /// Fail the next `count` initialization attempts.
    pub fn fail_inits(&mut self, count: usize) {
        self.init_results.extend(core::iter::repeat_n(false, count));
    }

    pub fn disconnect(&mut self) {
        self.initialized = false;
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn inits(&self) -> usize {
        self.inits
    }
}

impl HumiditySensor for MockHumidity {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn initialize<T: CaptureTimer>(
        &mut self,
        arbiter: &TimerArbiter,
        _timer: &mut T,
    ) -> Result<(), SensorError> {
        self.inits += 1;
        // Hold the warm-up reservation the way the real driver does
        let _warmup = arbiter.reserve(crate::timer_arbiter::Client::HumidityInit)?;
        if self.init_results.pop_front().unwrap_or(true) {
            self.initialized = true;
            Ok(())
        } else {
            Err(SensorError::InitializationFailed {
                sensor: "mock humidity",
                details: "scripted failure",
            })
        }
    }

    async fn read(&mut self) -> HtuReadings {
        self.reads += 1;
        if self.initialized {
            self.readings
        } else {
            HtuReadings::FAILED
        }
    }
}

// ---------------------------------------------------------------------------
// HTU21D slave on an open-drain pin pair
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Sda,
    Scl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlavePhase {
    /// Not addressed; waiting for a start condition.
    Idle,
    Receive { bits: u8, byte: u8 },
    /// Holding the acknowledge until the clock falls.
    SlaveAck,
    /// Driving `bit` of `byte`.
    Transmit { byte: u8, bit: u8 },
    MasterAck { acked: bool },
}

/// Bit-level HTU21D emulation.
///
/// Each line is the wired AND of what the master and the slave release.
/// The slave reacts to clock edges and start/stop conditions as the master
/// drives the pins, and holds the clock low before answering a measurement
/// until the master waits for it to rise.
pub struct Htu21dSlave {
    master_sda: bool,
    master_scl: bool,
    slave_sda: bool,
    slave_scl: bool,
    phase: SlavePhase,
    expect_address: bool,
    reading: bool,
    register_write_next: bool,
    tx_queue: VecDeque<u8>,
    stretch_pending: bool,
    user_register: u8,
    temperature_raw: u16,
    humidity_raw: u16,
    corrupt_crc: bool,
    nack_address: usize,
    hold_forever: bool,
    stretches: usize,
    received: Vec<u8>,
}

impl Htu21dSlave {
    fn new() -> Self {
        Self {
            master_sda: true,
            master_scl: true,
            slave_sda: true,
            slave_scl: true,
            phase: SlavePhase::Idle,
            expect_address: false,
            reading: false,
            register_write_next: false,
            tx_queue: VecDeque::new(),
            stretch_pending: false,
            user_register: 0x02,
            temperature_raw: 0x6A5C,
            humidity_raw: 0x7C80,
            corrupt_crc: false,
            nack_address: 0,
            hold_forever: false,
            stretches: 0,
            received: Vec::new(),
        }
    }

    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn user_register(&self) -> u8 {
        self.user_register
    }

    pub fn set_user_register(&mut self, value: u8) {
        self.user_register = value;
    }

    pub fn set_temperature_raw(&mut self, raw: u16) {
        self.temperature_raw = raw;
    }

    pub fn set_humidity_raw(&mut self, raw: u16) {
        self.humidity_raw = raw;
    }

    pub fn corrupt_crc(&mut self, corrupt: bool) {
        self.corrupt_crc = corrupt;
    }

    /// Refuse the next `count` address bytes.
    pub fn nack_address(&mut self, count: usize) {
        self.nack_address = count;
    }

    pub fn hold_clock_forever(&mut self, hold: bool) {
        self.hold_forever = hold;
    }

    pub fn stretches(&self) -> usize {
        self.stretches
    }

    fn level(&self, line: Line) -> bool {
        match line {
            Line::Sda => self.master_sda && self.slave_sda,
            Line::Scl => self.master_scl && self.slave_scl,
        }
    }

    fn drive(&mut self, line: Line, high: bool) {
        let before = (self.level(Line::Sda), self.level(Line::Scl));
        match line {
            Line::Sda => self.master_sda = high,
            Line::Scl => self.master_scl = high,
        }
        self.settle(before);
    }

    fn release_clock(&mut self) {
        let before = (self.level(Line::Sda), self.level(Line::Scl));
        self.slave_scl = true;
        self.stretches += 1;
        self.settle(before);
    }

    fn settle(&mut self, (old_sda, old_scl): (bool, bool)) {
        let sda = self.level(Line::Sda);
        let scl = self.level(Line::Scl);
        if old_scl && scl && old_sda != sda {
            if sda {
                self.on_stop();
            } else {
                self.on_start();
            }
        } else if !old_scl && scl {
            self.on_clock_rise();
        } else if old_scl && !scl {
            self.on_clock_fall();
        }
    }

    fn on_start(&mut self) {
        self.phase = SlavePhase::Receive { bits: 0, byte: 0 };
        self.expect_address = true;
        self.register_write_next = false;
        self.slave_sda = true;
    }

    fn on_stop(&mut self) {
        self.phase = SlavePhase::Idle;
        self.slave_sda = true;
    }

    fn on_clock_rise(&mut self) {
        let sda = self.level(Line::Sda);
        match self.phase {
            SlavePhase::Receive { bits, byte } if bits < 8 => {
                self.phase = SlavePhase::Receive {
                    bits: bits + 1,
                    byte: (byte << 1) | sda as u8,
                };
            }
            SlavePhase::MasterAck { .. } => {
                self.phase = SlavePhase::MasterAck { acked: !sda };
            }
            _ => {}
        }
    }

    fn on_clock_fall(&mut self) {
        match self.phase {
            SlavePhase::Receive { bits: 8, byte } => {
                self.received.push(byte);
                if self.accept(byte) {
                    self.slave_sda = false;
                    self.phase = SlavePhase::SlaveAck;
                } else {
                    self.phase = SlavePhase::Idle;
                }
            }
            SlavePhase::SlaveAck => {
                self.slave_sda = true;
                if self.reading {
                    self.begin_transmit();
                } else {
                    self.phase = SlavePhase::Receive { bits: 0, byte: 0 };
                }
            }
            SlavePhase::Transmit { bit: 0, .. } => {
                self.slave_sda = true;
                self.phase = SlavePhase::MasterAck { acked: false };
            }
            SlavePhase::Transmit { byte, bit } => {
                let next = bit - 1;
                self.slave_sda = byte & (1 << next) != 0;
                self.phase = SlavePhase::Transmit { byte, bit: next };
            }
            SlavePhase::MasterAck { acked: true } => self.begin_transmit(),
            SlavePhase::MasterAck { acked: false } => self.phase = SlavePhase::Idle,
            _ => {}
        }
    }

    fn accept(&mut self, byte: u8) -> bool {
        if self.expect_address {
            self.expect_address = false;
            if byte & !READ_FLAG != HTU_ADDRESS {
                return false;
            }
            if self.nack_address > 0 {
                self.nack_address -= 1;
                return false;
            }
            self.reading = byte & READ_FLAG != 0;
            return true;
        }

        if self.register_write_next {
            self.register_write_next = false;
            self.user_register = byte;
            return true;
        }

        match byte {
            HOLD_TEMPERATURE => self.queue_measurement(self.temperature_raw),
            HOLD_HUMIDITY => self.queue_measurement(self.humidity_raw),
            READ_USER_REGISTER => {
                self.tx_queue.clear();
                self.tx_queue.push_back(self.user_register);
            }
            WRITE_USER_REGISTER => self.register_write_next = true,
            _ => return false,
        }
        true
    }

    fn queue_measurement(&mut self, raw: u16) {
        let [msb, lsb] = raw.to_be_bytes();
        let mut checksum = crc8(raw);
        if self.corrupt_crc {
            checksum ^= 0x01;
        }
        self.tx_queue.clear();
        self.tx_queue.extend([msb, lsb, checksum]);
        self.stretch_pending = true;
    }

    fn begin_transmit(&mut self) {
        if self.stretch_pending {
            self.stretch_pending = false;
            self.slave_scl = false;
        }
        let byte = self.tx_queue.pop_front().unwrap_or(0xFF);
        self.slave_sda = byte & 0x80 != 0;
        self.phase = SlavePhase::Transmit { byte, bit: 7 };
    }
}

/// Master side of one bus line.
pub struct SlavePin {
    bus: Rc<RefCell<Htu21dSlave>>,
    line: Line,
}

impl ErrorType for SlavePin {
    type Error = Infallible;
}

impl OutputPin for SlavePin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.bus.borrow_mut().drive(self.line, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.bus.borrow_mut().drive(self.line, true);
        Ok(())
    }
}

impl InputPin for SlavePin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.bus.borrow().level(self.line))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.bus.borrow().level(self.line))
    }
}

impl Wait for SlavePin {
    async fn wait_for_high(&mut self) -> Result<(), Infallible> {
        let held_forever = {
            let mut bus = self.bus.borrow_mut();
            if bus.level(self.line) {
                return Ok(());
            }
            if self.line == Line::Scl && !bus.slave_scl {
                if bus.hold_forever {
                    true
                } else {
                    bus.release_clock();
                    false
                }
            } else {
                false
            }
        };
        if held_forever {
            core::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
        self.wait_for_high().await
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// An idle bus with an HTU21D attached, and the master's two pins.
pub fn htu_bus() -> (Rc<RefCell<Htu21dSlave>>, SlavePin, SlavePin) {
    let bus = Rc::new(RefCell::new(Htu21dSlave::new()));
    let sda = SlavePin {
        bus: bus.clone(),
        line: Line::Sda,
    };
    let scl = SlavePin {
        bus: bus.clone(),
        line: Line::Scl,
    };
    (bus, sda, scl)
}
