//! [`RadioBus`] over an `embedded-hal-async` SPI device.

use embassy_time::Timer;
use embedded_hal_async::spi::{Operation, SpiDevice};
use log::warn;

use super::RadioBus;
use super::cc1101::{READ_BURST, READ_SINGLE, SNOP, STATUS_CHIP_RDYN, WRITE_BURST};

/// Status polls before giving up on the crystal (about 1 ms).
const WAKE_POLLS: u32 = 50;

pub struct SpiRadioBus<S> {
    spi: S,
}

impl<S: SpiDevice> SpiRadioBus<S> {
    pub fn new(spi: S) -> Self {
        Self { spi }
    }

    pub fn release(self) -> S {
        self.spi
    }
}

impl<S: SpiDevice> RadioBus for SpiRadioBus<S> {
    type Error = S::Error;

    async fn write_register(&mut self, address: u8, value: u8) -> Result<(), S::Error> {
        self.spi.write(&[address, value]).await
    }

    async fn read_register(&mut self, address: u8) -> Result<u8, S::Error> {
        let mut frame = [address | READ_SINGLE, 0];
        self.spi.transfer_in_place(&mut frame).await?;
        Ok(frame[1])
    }

    async fn write_burst(&mut self, address: u8, data: &[u8]) -> Result<(), S::Error> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[address | WRITE_BURST]),
                Operation::Write(data),
            ])
            .await
    }

    async fn read_burst(&mut self, address: u8, buf: &mut [u8]) -> Result<(), S::Error> {
        self.spi
            .transaction(&mut [
                Operation::Write(&[address | READ_BURST]),
                Operation::Read(buf),
            ])
            .await
    }

    async fn strobe(&mut self, command: u8) -> Result<u8, S::Error> {
        let mut frame = [command];
        self.spi.transfer_in_place(&mut frame).await?;
        Ok(frame[0])
    }

    async fn read_status(&mut self, address: u8) -> Result<u8, S::Error> {
        let mut frame = [address | READ_BURST, 0];
        self.spi.transfer_in_place(&mut frame).await?;
        Ok(frame[1])
    }

    async fn wake(&mut self) -> Result<(), S::Error> {
        // Chip select wakes the chip; CHIP_RDYn clears once the crystal runs
        for _ in 0..WAKE_POLLS {
            if self.strobe(SNOP).await? & STATUS_CHIP_RDYN == 0 {
                return Ok(());
            }
            Timer::after_micros(20).await;
        }
        warn!("Radio crystal not stable after {} polls", WAKE_POLLS);
        Ok(())
    }
}
