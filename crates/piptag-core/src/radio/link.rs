//! Packet transmit/receive and frequency tuning on top of a [`RadioBus`].
//!
//! ## Frequency word
//!
//! The synthesizer frequency is `f_xosc / 2^16 * FREQ[23:0]`. With the
//! 26 MHz crystal one step is 396.7 Hz, so the word for a carrier is
//! `hz / 396.7`, kept as integer math (`hz * 10 / 3967`). FREQ2 only has six
//! usable bits.
//!
//! ## Calibration snapshot
//!
//! Calibrating the synthesizer costs far more than rewriting its results.
//! After a full calibration the TEST and FSCAL registers are read back and
//! stored; later transmissions restore them instead of calibrating again.

use embassy_time::{Duration, Instant, Timer, block_for, with_timeout};
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;
use log::{debug, info, warn};

use super::cc1101::*;
use super::{RadioBus, RadioError};
use crate::config::PaPower;
use crate::packet::{Frame, IdEncoding};

/// Tunable carrier range.
pub const FREQ_MIN_HZ: u32 = 340_000_000;
pub const FREQ_MAX_HZ: u32 = 950_000_000;

/// MARCSTATE polls while waiting for calibration to finish (500 us apart).
const CALIBRATION_POLLS: u32 = 40;

/// Spin after STX for the low-latency transmit.
const LOW_LATENCY_SPIN: Duration = Duration::from_micros(30);

/// Serialized size of a [`CalibrationSnapshot`].
pub const SNAPSHOT_LEN: usize = 10;

/// Synthesizer calibration results and the word they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationSnapshot {
    /// TEST0, TEST1, TEST2
    pub test: [u8; 3],
    /// FSCAL0 through FSCAL3
    pub fscal: [u8; 4],
    pub freq_word: u32,
}

impl CalibrationSnapshot {
    pub fn to_bytes(&self) -> [u8; SNAPSHOT_LEN] {
        let word = self.freq_word.to_be_bytes();
        [
            self.test[0],
            self.test[1],
            self.test[2],
            self.fscal[0],
            self.fscal[1],
            self.fscal[2],
            self.fscal[3],
            word[1],
            word[2],
            word[3],
        ]
    }

    pub fn from_bytes(bytes: &[u8; SNAPSHOT_LEN]) -> Self {
        Self {
            test: [bytes[0], bytes[1], bytes[2]],
            fscal: [bytes[3], bytes[4], bytes[5], bytes[6]],
            freq_word: u32::from_be_bytes([0, bytes[7], bytes[8], bytes[9]]),
        }
    }
}

/// Appended status bytes of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStatus {
    pub rssi: u8,
    pub lqi: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    Received { len: usize, status: RxStatus },
    /// Declared length did not fit the buffer; the FIFO was flushed.
    Oversize { len: usize },
    Empty,
}

pub struct RadioLink<B, G> {
    bus: B,
    gdo0: G,
    freq_word: u32,
    snapshot: CalibrationSnapshot,
    id_encoding: IdEncoding,
    pa_power: PaPower,
}

/// Synthesizer word for a carrier frequency.
pub const fn frequency_word(hz: u32) -> u32 {
    (hz as u64 * 10 / 3967) as u32
}

impl<B, G> RadioLink<B, G>
where
    B: RadioBus,
    G: InputPin + Wait,
{
    pub fn new(bus: B, gdo0: G, id_encoding: IdEncoding, pa_power: PaPower) -> Self {
        Self {
            bus,
            gdo0,
            freq_word: 0,
            snapshot: CalibrationSnapshot::default(),
            id_encoding,
            pa_power,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn freq_word(&self) -> u32 {
        self.freq_word
    }

    /// Carrier the current word produces.
    pub fn frequency_hz(&self) -> u32 {
        (self.freq_word as u64 * 3967 / 10) as u32
    }

    pub fn snapshot(&self) -> &CalibrationSnapshot {
        &self.snapshot
    }

    // -----------------------------------------------------------------------
    // Transmit
    // -----------------------------------------------------------------------

    /// Transmit and wait for GDO0 to assert (sync sent) and de-assert (end
    /// of packet). Requires GDO0 configured for sync-word output.
    pub async fn send_packet(&mut self, frame: &[u8]) -> Result<(), RadioError<B::Error>> {
        self.load_and_start(frame).await?;
        self.gdo0.wait_for_high().await.map_err(|_| RadioError::Pin)?;
        self.gdo0.wait_for_low().await.map_err(|_| RadioError::Pin)?;
        Ok(())
    }

    pub async fn send_packet_nonblocking(
        &mut self,
        frame: &[u8],
    ) -> Result<(), RadioError<B::Error>> {
        self.load_and_start(frame).await
    }

    /// Transmit with a short fixed spin instead of waiting on GDO0.
    pub async fn send_packet_low_latency(
        &mut self,
        frame: &[u8],
    ) -> Result<(), RadioError<B::Error>> {
        self.load_and_start(frame).await?;
        block_for(LOW_LATENCY_SPIN);
        Ok(())
    }

    async fn load_and_start(&mut self, frame: &[u8]) -> Result<(), RadioError<B::Error>> {
        self.burst(TXFIFO, frame).await?;
        self.strobe(STX).await?;
        Ok(())
    }

    /// Stream a tag frame and power the chip down.
    ///
    /// The length byte goes first and STX is strobed before the rest of the
    /// frame is loaded; the SPI transfer outruns the air time.
    pub async fn transmit_and_power_down(
        &mut self,
        frame: &Frame,
    ) -> Result<(), RadioError<B::Error>> {
        let (length, rest) = frame.split_at(1);
        self.burst(TXFIFO, length).await?;
        self.strobe(STX).await?;
        self.burst(TXFIFO, rest).await?;
        self.strobe(SPWD).await?;
        debug!("Transmitted {} byte frame", frame.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    /// Receive a fixed-length packet into `buf`.
    ///
    /// `wait` bounds the whole receive including the sync word; `rx_wait`
    /// bounds the packet body once sync was seen. On timeout the radio is
    /// forced idle and the RX FIFO flushed.
    pub async fn receive_fixed(
        &mut self,
        buf: &mut [u8],
        wait: Duration,
        rx_wait: Duration,
    ) -> Result<RxStatus, RadioError<B::Error>> {
        let start = Instant::now();
        self.strobe(SRX).await?;

        match with_timeout(wait, self.gdo0.wait_for_high()).await {
            Ok(pin) => pin.map_err(|_| RadioError::Pin)?,
            Err(_) => return self.abort_receive("sync word").await,
        }

        let remaining = wait.checked_sub(start.elapsed()).unwrap_or(Duration::from_ticks(0));
        let body_wait = if rx_wait < remaining { rx_wait } else { remaining };
        match with_timeout(body_wait, self.gdo0.wait_for_low()).await {
            Ok(pin) => pin.map_err(|_| RadioError::Pin)?,
            Err(_) => return self.abort_receive("end of packet").await,
        }

        if self.status(RXBYTES).await? & BYTES_IN_RXFIFO == 0 {
            return Err(RadioError::FifoEmpty);
        }

        self.read_burst(RXFIFO, buf).await?;
        self.read_rx_status().await
    }

    /// Receive a variable-length packet. Waits without a bound.
    pub async fn receive_variable(
        &mut self,
        buf: &mut [u8],
    ) -> Result<RxOutcome, RadioError<B::Error>> {
        self.strobe(SRX).await?;
        self.gdo0.wait_for_high().await.map_err(|_| RadioError::Pin)?;
        self.gdo0.wait_for_low().await.map_err(|_| RadioError::Pin)?;

        if self.status(RXBYTES).await? & BYTES_IN_RXFIFO == 0 {
            self.idle_and_flush().await?;
            return Ok(RxOutcome::Empty);
        }

        let len = self.read(RXFIFO).await? as usize;
        let outcome = match buf.get_mut(..len) {
            Some(payload) => {
                self.read_burst(RXFIFO, payload).await?;
                let status = self.read_rx_status().await?;
                RxOutcome::Received { len, status }
            }
            None => {
                warn!("Received {} byte packet for a {} byte buffer", len, buf.len());
                RxOutcome::Oversize { len }
            }
        };
        self.idle_and_flush().await?;
        Ok(outcome)
    }

    async fn read_rx_status(&mut self) -> Result<RxStatus, RadioError<B::Error>> {
        let mut status = [0u8; 2];
        self.read_burst(RXFIFO, &mut status).await?;
        Ok(RxStatus {
            rssi: status[0],
            lqi: status[1],
        })
    }

    async fn abort_receive<T>(&mut self, stage: &'static str) -> Result<T, RadioError<B::Error>> {
        warn!("Receive timed out waiting for {}", stage);
        self.idle_and_flush().await?;
        Err(RadioError::RxTimeout { stage })
    }

    async fn idle_and_flush(&mut self) -> Result<(), RadioError<B::Error>> {
        self.strobe(SIDLE).await?;
        self.strobe(SFRX).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tuning
    // -----------------------------------------------------------------------

    /// Tune to `hz` and strobe a calibration.
    pub async fn set_frequency(&mut self, hz: u32) -> Result<(), RadioError<B::Error>> {
        if !(FREQ_MIN_HZ..=FREQ_MAX_HZ).contains(&hz) {
            return Err(RadioError::InvalidFrequency { hz });
        }
        self.freq_word = frequency_word(hz);
        self.retune(0).await
    }

    /// Shift the word by `delta` steps of 396.7 Hz and recalibrate.
    pub async fn retune(&mut self, delta: i32) -> Result<(), RadioError<B::Error>> {
        self.freq_word = self.freq_word.wrapping_add_signed(delta);
        self.idle_and_flush().await?;
        self.write_frequency_word().await?;
        self.strobe(SCAL).await?;
        Ok(())
    }

    /// Full calibration at `hz`, then snapshot the results.
    pub async fn recalibrate(&mut self, hz: u32) -> Result<(), RadioError<B::Error>> {
        self.set_frequency(hz).await?;

        let mut polls = 0;
        while self.status(MARCSTATE).await? != MARCSTATE_IDLE {
            polls += 1;
            if polls >= CALIBRATION_POLLS {
                warn!("Synthesizer calibration stuck after {} polls", polls);
                return Err(RadioError::CalibrationTimeout);
            }
            Timer::after_micros(500).await;
        }

        self.store_snapshot().await?;
        info!(
            "Radio calibrated at {} Hz (word {:#08x})",
            self.frequency_hz(),
            self.freq_word
        );
        Ok(())
    }

    async fn store_snapshot(&mut self) -> Result<(), RadioError<B::Error>> {
        self.snapshot = CalibrationSnapshot {
            test: [
                self.read(TEST0).await?,
                self.read(TEST1).await?,
                self.read(TEST2).await?,
            ],
            fscal: [
                self.read(FSCAL0).await?,
                self.read(FSCAL1).await?,
                self.read(FSCAL2).await?,
                self.read(FSCAL3).await?,
            ],
            freq_word: self.freq_word,
        };
        Ok(())
    }

    /// Write back the last calibration instead of calibrating again.
    pub async fn restore_snapshot(&mut self) -> Result<(), RadioError<B::Error>> {
        let snapshot = self.snapshot;
        self.write(TEST0, snapshot.test[0]).await?;
        self.write(TEST1, snapshot.test[1]).await?;
        self.write(TEST2, snapshot.test[2]).await?;
        self.write(FSCAL0, snapshot.fscal[0]).await?;
        self.write(FSCAL1, snapshot.fscal[1]).await?;
        self.write(FSCAL2, snapshot.fscal[2]).await?;
        self.write(FSCAL3, snapshot.fscal[3]).await?;
        self.freq_word = snapshot.freq_word;
        self.write_frequency_word().await
    }

    /// Adopt a snapshot loaded from storage.
    pub fn load_snapshot(&mut self, snapshot: CalibrationSnapshot) {
        self.snapshot = snapshot;
        self.freq_word = snapshot.freq_word;
    }

    async fn write_frequency_word(&mut self) -> Result<(), RadioError<B::Error>> {
        let word = self.freq_word;
        self.write(FREQ0, (word & 0xFF) as u8).await?;
        self.write(FREQ1, ((word >> 8) & 0xFF) as u8).await?;
        self.write(FREQ2, ((word >> 16) % 0x40) as u8).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Power and configuration
    // -----------------------------------------------------------------------

    pub async fn wake(&mut self) -> Result<(), RadioError<B::Error>> {
        self.bus.wake().await.map_err(RadioError::Bus)
    }

    pub async fn power_down(&mut self) -> Result<(), RadioError<B::Error>> {
        self.strobe(SPWD).await?;
        Ok(())
    }

    /// Boot sequence: reset, full register table, PA table, calibration at
    /// `hz`, snapshot and power-down.
    pub async fn setup_and_power_down(&mut self, hz: u32) -> Result<(), RadioError<B::Error>> {
        self.wake().await?;
        self.strobe(SRES).await?;
        self.wake().await?;

        for (address, value) in RF_SETTINGS {
            self.write(address, value).await?;
        }
        self.write(PKTCTRL0, self.pktctrl0()).await?;
        self.set_power().await?;
        self.recalibrate(hz).await?;
        self.power_down().await
    }

    /// Rewrite the registers power-down does not retain.
    pub async fn rewrite_registers(&mut self) -> Result<(), RadioError<B::Error>> {
        for (address, value) in TRANSMIT_REGISTERS {
            self.write(address, value).await?;
        }
        self.write(IOCFG0, GDO_HIGH_IMPEDANCE).await?;
        self.write(PKTCTRL1, 0x04).await?;
        self.write(PKTCTRL0, self.pktctrl0()).await?;
        self.write(ADDR, 0x00).await?;
        self.write(PKTLEN, 0x03).await?;
        Ok(())
    }

    pub async fn set_power(&mut self) -> Result<(), RadioError<B::Error>> {
        self.burst(PATABLE, &[self.pa_power.patable()]).await
    }

    /// Wake the chip and route its crystal, divided, out of GDO0.
    pub async fn crystal_on(&mut self, divider: CrystalDivider) -> Result<(), RadioError<B::Error>> {
        self.wake().await?;
        self.write(IOCFG0, divider.iocfg()).await
    }

    /// Return GDO0 to high impedance without powering down.
    pub async fn release_gdo0(&mut self) -> Result<(), RadioError<B::Error>> {
        self.write(IOCFG0, GDO_HIGH_IMPEDANCE).await
    }

    pub async fn crystal_off(&mut self) -> Result<(), RadioError<B::Error>> {
        self.release_gdo0().await?;
        self.strobe(SXOFF).await?;
        self.strobe(SPWD).await?;
        Ok(())
    }

    fn pktctrl0(&self) -> u8 {
        match self.id_encoding {
            IdEncoding::Crc24 => PKT_LEN_VAR | PKT_CRC_EN | PKT_DAT_WHT,
            IdEncoding::Legacy21 => PKT_LEN_VAR | PKT_DAT_WHT,
        }
    }

    async fn write(&mut self, address: u8, value: u8) -> Result<(), RadioError<B::Error>> {
        self.bus
            .write_register(address, value)
            .await
            .map_err(RadioError::Bus)
    }

    async fn read(&mut self, address: u8) -> Result<u8, RadioError<B::Error>> {
        self.bus.read_register(address).await.map_err(RadioError::Bus)
    }

    async fn burst(&mut self, address: u8, data: &[u8]) -> Result<(), RadioError<B::Error>> {
        self.bus
            .write_burst(address, data)
            .await
            .map_err(RadioError::Bus)
    }

    async fn read_burst(&mut self, address: u8, buf: &mut [u8]) -> Result<(), RadioError<B::Error>> {
        self.bus
            .read_burst(address, buf)
            .await
            .map_err(RadioError::Bus)
    }

    async fn strobe(&mut self, command: u8) -> Result<u8, RadioError<B::Error>> {
        self.bus.strobe(command).await.map_err(RadioError::Bus)
    }

    async fn status(&mut self, address: u8) -> Result<u8, RadioError<B::Error>> {
        self.bus.read_status(address).await.map_err(RadioError::Bus)
    }
}
