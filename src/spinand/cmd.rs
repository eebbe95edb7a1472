//! The SPI-NAND command set: opcodes, feature registers, and the framing of each command's header
//!
//! A command header is everything clocked out before the data phase. The data phase (ID bytes,
//! feature values, cache contents) follows in the same chip-select and is handled by the caller.

use bytes::{Buf, BufMut, BytesMut};

pub const OP_RESET: u8 = 0xFF;
pub const OP_READ_ID: u8 = 0x9F;
pub const OP_GET_FEATURE: u8 = 0x0F;
pub const OP_SET_FEATURE: u8 = 0x1F;
pub const OP_WRITE_ENABLE: u8 = 0x06;
pub const OP_WRITE_DISABLE: u8 = 0x04;
pub const OP_PAGE_READ: u8 = 0x13;
pub const OP_READ_FROM_CACHE: u8 = 0x03;
pub const OP_PROGRAM_LOAD: u8 = 0x02;
pub const OP_PROGRAM_EXECUTE: u8 = 0x10;
pub const OP_BLOCK_ERASE: u8 = 0xD8;
pub const OP_DIE_SELECT: u8 = 0xC2;

/// Feature register addresses
pub mod reg {
    /// Block protection; all zeroes unlocks every block
    pub const PROTECTION: u8 = 0xA0;

    /// Configuration; see [CONFIG_ECC_EN](super::CONFIG_ECC_EN)
    pub const CONFIG: u8 = 0xB0;

    /// Status; see [status](super::status)
    pub const STATUS: u8 = 0xC0;
}

/// Enables on-die ECC, in the configuration register
pub const CONFIG_ECC_EN: u8 = 1 << 4;

/// Bits of the status register
pub mod status {
    /// Operation in progress
    pub const OIP: u8 = 1 << 0;

    /// Write-enable latch
    pub const WEL: u8 = 1 << 1;

    pub const ERASE_FAIL: u8 = 1 << 2;
    pub const PROGRAM_FAIL: u8 = 1 << 3;

    pub const ECC_SHIFT: u8 = 4;
    pub const ECC_MASK: u8 = 0b11 << ECC_SHIFT;
}

/// What the on-die ECC reported for the last page read into the cache
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum EccStatus {
    /// No bitflips
    Clean,

    /// Bitflips were found and corrected
    Corrected,

    /// Too many bitflips to correct; the cache content is unreliable
    Uncorrectable,
}

impl EccStatus {
    /// Decode from a status register value
    pub fn from_status(value: u8) -> Self {
        match (value & status::ECC_MASK) >> status::ECC_SHIFT {
            0 => Self::Clean,
            2 => Self::Uncorrectable,
            _ => Self::Corrected,
        }
    }

    /// Encode into the ECC bits of a status register value
    pub fn to_status_bits(self) -> u8 {
        let bits = match self {
            Self::Clean => 0,
            Self::Corrected => 1,
            Self::Uncorrectable => 2,
        };
        bits << status::ECC_SHIFT
    }
}

/// The header of one SPI-NAND command
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Command {
    Reset,

    /// Followed by the ID bytes
    ReadId,

    /// Followed by the register's value
    GetFeature(u8),

    SetFeature(u8, u8),
    WriteEnable,
    WriteDisable,

    /// Load a page (by row address) into the cache
    PageRead(u32),

    /// Followed by the cache contents, starting at the column address
    ReadFromCache(u16),

    /// Reset the cache to all-1s; followed by bytes to place at the column address
    ProgramLoad(u16),

    /// Program the cache into a page (by row address)
    ProgramExecute(u32),

    /// Erase a block (by the row address of any of its pages)
    BlockErase(u32),

    DieSelect(u8),
}

impl Command {
    /// The number of bytes in this command's header
    pub fn header_len(self) -> usize {
        match self {
            Self::Reset | Self::WriteEnable | Self::WriteDisable => 1,
            Self::ReadId | Self::GetFeature(_) | Self::DieSelect(_) => 2,
            Self::SetFeature(..) | Self::ProgramLoad(_) => 3,
            Self::PageRead(_) | Self::ProgramExecute(_) | Self::BlockErase(_) => 4,
            Self::ReadFromCache(_) => 4,
        }
    }

    /// Serialize the header
    pub fn encode(self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header_len());

        match self {
            Self::Reset => buf.put_u8(OP_RESET),
            Self::ReadId => {
                buf.put_u8(OP_READ_ID);
                buf.put_u8(0); // dummy
            }
            Self::GetFeature(reg) => {
                buf.put_u8(OP_GET_FEATURE);
                buf.put_u8(reg);
            }
            Self::SetFeature(reg, value) => {
                buf.put_u8(OP_SET_FEATURE);
                buf.put_u8(reg);
                buf.put_u8(value);
            }
            Self::WriteEnable => buf.put_u8(OP_WRITE_ENABLE),
            Self::WriteDisable => buf.put_u8(OP_WRITE_DISABLE),
            Self::PageRead(row) => {
                buf.put_u8(OP_PAGE_READ);
                buf.put_uint(row.into(), 3);
            }
            Self::ReadFromCache(column) => {
                buf.put_u8(OP_READ_FROM_CACHE);
                buf.put_u16(column);
                buf.put_u8(0); // dummy
            }
            Self::ProgramLoad(column) => {
                buf.put_u8(OP_PROGRAM_LOAD);
                buf.put_u16(column);
            }
            Self::ProgramExecute(row) => {
                buf.put_u8(OP_PROGRAM_EXECUTE);
                buf.put_uint(row.into(), 3);
            }
            Self::BlockErase(row) => {
                buf.put_u8(OP_BLOCK_ERASE);
                buf.put_uint(row.into(), 3);
            }
            Self::DieSelect(die) => {
                buf.put_u8(OP_DIE_SELECT);
                buf.put_u8(die);
            }
        }

        buf
    }

    /// Parse a header from the start of `frame`
    ///
    /// Returns None if the opcode is unknown or `frame` is too short to hold the header.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let mut buf = frame;
        if !buf.has_remaining() {
            return None;
        }

        let opcode = buf.get_u8();
        let needs = |len: usize| (frame.len() >= len).then_some(());

        Some(match opcode {
            OP_RESET => Self::Reset,
            OP_WRITE_ENABLE => Self::WriteEnable,
            OP_WRITE_DISABLE => Self::WriteDisable,
            OP_READ_ID => {
                needs(2)?;
                Self::ReadId
            }
            OP_GET_FEATURE => {
                needs(2)?;
                Self::GetFeature(buf.get_u8())
            }
            OP_DIE_SELECT => {
                needs(2)?;
                Self::DieSelect(buf.get_u8())
            }
            OP_SET_FEATURE => {
                needs(3)?;
                Self::SetFeature(buf.get_u8(), buf.get_u8())
            }
            OP_PROGRAM_LOAD => {
                needs(3)?;
                Self::ProgramLoad(buf.get_u16())
            }
            OP_READ_FROM_CACHE => {
                needs(4)?;
                Self::ReadFromCache(buf.get_u16())
            }
            OP_PAGE_READ | OP_PROGRAM_EXECUTE | OP_BLOCK_ERASE => {
                needs(4)?;
                let row = buf.get_uint(3) as u32;
                match opcode {
                    OP_PAGE_READ => Self::PageRead(row),
                    OP_PROGRAM_EXECUTE => Self::ProgramExecute(row),
                    _ => Self::BlockErase(row),
                }
            }
            _ => return None,
        })
    }
}

#[test]
fn test_encode_frames() {
    assert_eq!(&Command::Reset.encode()[..], [0xFF]);
    assert_eq!(&Command::ReadId.encode()[..], [0x9F, 0x00]);
    assert_eq!(&Command::GetFeature(reg::STATUS).encode()[..], [0x0F, 0xC0]);
    assert_eq!(
        &Command::SetFeature(reg::PROTECTION, 0).encode()[..],
        [0x1F, 0xA0, 0x00]
    );
    assert_eq!(
        &Command::PageRead(0x012345).encode()[..],
        [0x13, 0x01, 0x23, 0x45]
    );
    assert_eq!(
        &Command::ReadFromCache(0x0800).encode()[..],
        [0x03, 0x08, 0x00, 0x00]
    );
    assert_eq!(&Command::ProgramLoad(0x0840).encode()[..], [0x02, 0x08, 0x40]);
    assert_eq!(&Command::DieSelect(1).encode()[..], [0xC2, 0x01]);

    for cmd in [
        Command::Reset,
        Command::ReadId,
        Command::SetFeature(reg::CONFIG, CONFIG_ECC_EN),
        Command::ReadFromCache(7),
        Command::BlockErase(0xFFFFFF),
    ] {
        assert_eq!(cmd.encode().len(), cmd.header_len());
    }
}

#[test]
fn test_decode_frames() {
    // Trailing data-phase bytes are ignored
    assert_eq!(
        Command::decode(&[0x02, 0x00, 0x10, 0xAA, 0xBB]),
        Some(Command::ProgramLoad(0x10))
    );
    assert_eq!(
        Command::decode(&[0xD8, 0x00, 0x01, 0x40]),
        Some(Command::BlockErase(0x140))
    );
    assert_eq!(Command::decode(&[0x0F, 0xC0, 0x00]), Some(Command::GetFeature(0xC0)));

    // Truncated or unknown
    assert_eq!(Command::decode(&[]), None);
    assert_eq!(Command::decode(&[0x13, 0x00, 0x01]), None);
    assert_eq!(Command::decode(&[0x0F]), None);
    assert_eq!(Command::decode(&[0x55]), None);
}

#[test]
fn test_ecc_status() {
    use status::*;

    assert_eq!(EccStatus::from_status(OIP | WEL), EccStatus::Clean);
    assert_eq!(EccStatus::from_status(0x10), EccStatus::Corrected);
    assert_eq!(EccStatus::from_status(0x20), EccStatus::Uncorrectable);
    assert_eq!(EccStatus::from_status(0x30), EccStatus::Corrected);
    assert_eq!(EccStatus::Uncorrectable.to_status_bits(), 0x20);
}
