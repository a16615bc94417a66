//! CC1101 register map and the tag's register tables.

// Configuration registers
pub const IOCFG2: u8 = 0x00;
pub const IOCFG1: u8 = 0x01;
pub const IOCFG0: u8 = 0x02;
pub const FIFOTHR: u8 = 0x03;
pub const SYNC1: u8 = 0x04;
pub const SYNC0: u8 = 0x05;
pub const PKTLEN: u8 = 0x06;
pub const PKTCTRL1: u8 = 0x07;
pub const PKTCTRL0: u8 = 0x08;
pub const ADDR: u8 = 0x09;
pub const CHANNR: u8 = 0x0A;
pub const FSCTRL1: u8 = 0x0B;
pub const FSCTRL0: u8 = 0x0C;
pub const FREQ2: u8 = 0x0D;
pub const FREQ1: u8 = 0x0E;
pub const FREQ0: u8 = 0x0F;
pub const MDMCFG4: u8 = 0x10;
pub const MDMCFG3: u8 = 0x11;
pub const MDMCFG2: u8 = 0x12;
pub const MDMCFG1: u8 = 0x13;
pub const MDMCFG0: u8 = 0x14;
pub const DEVIATN: u8 = 0x15;
pub const MCSM2: u8 = 0x16;
pub const MCSM1: u8 = 0x17;
pub const MCSM0: u8 = 0x18;
pub const FOCCFG: u8 = 0x19;
pub const BSCFG: u8 = 0x1A;
pub const AGCCTRL2: u8 = 0x1B;
pub const AGCCTRL1: u8 = 0x1C;
pub const AGCCTRL0: u8 = 0x1D;
pub const FREND1: u8 = 0x21;
pub const FREND0: u8 = 0x22;
pub const FSCAL3: u8 = 0x23;
pub const FSCAL2: u8 = 0x24;
pub const FSCAL1: u8 = 0x25;
pub const FSCAL0: u8 = 0x26;
pub const FSTEST: u8 = 0x29;
pub const TEST2: u8 = 0x2C;
pub const TEST1: u8 = 0x2D;
pub const TEST0: u8 = 0x2E;

// Command strobes
pub const SRES: u8 = 0x30;
pub const SXOFF: u8 = 0x32;
pub const SCAL: u8 = 0x33;
pub const SRX: u8 = 0x34;
pub const STX: u8 = 0x35;
pub const SIDLE: u8 = 0x36;
pub const SPWD: u8 = 0x39;
pub const SFRX: u8 = 0x3A;
pub const SFTX: u8 = 0x3B;
pub const SNOP: u8 = 0x3D;

// Status registers (read with the burst bit set)
pub const PARTNUM: u8 = 0x30;
pub const VERSION: u8 = 0x31;
pub const LQI: u8 = 0x33;
pub const RSSI: u8 = 0x34;
pub const MARCSTATE: u8 = 0x35;
pub const TXBYTES: u8 = 0x3A;
pub const RXBYTES: u8 = 0x3B;

pub const PATABLE: u8 = 0x3E;
pub const TXFIFO: u8 = 0x3F;
pub const RXFIFO: u8 = 0x3F;

// SPI header bits
pub const WRITE_BURST: u8 = 0x40;
pub const READ_SINGLE: u8 = 0x80;
pub const READ_BURST: u8 = 0xC0;

/// Chip status byte: CHIP_RDYn.
pub const STATUS_CHIP_RDYN: u8 = 0x80;

pub const MARCSTATE_IDLE: u8 = 0x01;
pub const BYTES_IN_RXFIFO: u8 = 0x7F;

// PKTCTRL0 fields
pub const PKT_LEN_VAR: u8 = 0x01;
pub const PKT_CRC_EN: u8 = 0x04;
pub const PKT_DAT_WHT: u8 = 0x40;

// IOCFG0 values
pub const GDO_HIGH_IMPEDANCE: u8 = 0x2E;
pub const GDO_SYNC_WORD: u8 = 0x06;

/// GDO0 clock output dividers (IOCFG0 values) for the 26 MHz crystal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrystalDivider {
    /// 26 MHz
    Div1 = 0x30,
    /// 13 MHz
    Div2 = 0x32,
    /// 6.5 MHz
    Div4 = 0x34,
    /// 3.25 MHz
    Div8 = 0x36,
    /// 1.625 MHz
    Div16 = 0x38,
    /// 812.5 kHz
    Div32 = 0x3A,
    /// 406.25 kHz
    Div64 = 0x3C,
    /// 203.125 kHz
    Div128 = 0x3E,
    /// 135.416 kHz
    Div192 = 0x3F,
}

impl CrystalDivider {
    pub const fn iocfg(self) -> u8 {
        self as u8
    }
}

/// Registers rewritten before every transmission (the chip loses them in
/// power-down). Ends with IOCFG0 high impedance and PKTCTRL1; PKTCTRL0
/// depends on the ID encoding and is written separately.
pub const TRANSMIT_REGISTERS: [(u8, u8); 19] = [
    (FSCTRL1, 0x0B),
    (FSCTRL0, 0x00),
    (MDMCFG4, 0x2D),
    (MDMCFG3, 0x3B),
    (MDMCFG2, 0x73),
    (MDMCFG1, 0x22),
    (MDMCFG0, 0xF8),
    (CHANNR, 0x00),
    (DEVIATN, 0x00),
    (FREND1, 0xB6),
    (FREND0, 0x10),
    (MCSM1, 0x00),
    (MCSM0, 0x08),
    (FOCCFG, 0x1D),
    (BSCFG, 0x1C),
    (AGCCTRL2, 0xC7),
    (AGCCTRL1, 0x00),
    (AGCCTRL0, 0xB2),
    (FSTEST, 0x59),
];

/// Full register table written once after power-on reset.
pub const RF_SETTINGS: [(u8, u8); 27] = [
    (IOCFG2, 0x0B),
    (IOCFG0, GDO_SYNC_WORD),
    (PKTLEN, 0x03),
    (PKTCTRL1, 0x04),
    (PKTCTRL0, PKT_LEN_VAR | PKT_CRC_EN | PKT_DAT_WHT),
    (ADDR, 0x00),
    (CHANNR, 0x00),
    (FSCTRL1, 0x0B),
    (FSCTRL0, 0x00),
    (MDMCFG4, 0x2D),
    (MDMCFG3, 0x3B),
    (MDMCFG2, 0x73),
    (MDMCFG1, 0x22),
    (MDMCFG0, 0xF8),
    (DEVIATN, 0x00),
    (MCSM1, 0x00),
    (MCSM0, 0x08),
    (FOCCFG, 0x1D),
    (BSCFG, 0x1C),
    (AGCCTRL2, 0xC7),
    (AGCCTRL1, 0x00),
    (AGCCTRL0, 0xB2),
    (FREND1, 0xB6),
    (FREND0, 0x10),
    (FSTEST, 0x59),
    (TEST2, 0x88),
    (TEST1, 0x31),
];
