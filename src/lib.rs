//! Bad-block table management and physical-layer I/O for SPI-NAND flash.
//!
//! The crate is layered bottom-up:
//!
//! - [spi]: the [spi::SpiBus] trait, the [spi::SpiHelper] transfer wrappers (with their optional
//!   atomic mode and bounce buffering), and the bus backends.
//! - [bbt]: the per-chip bad-block table.
//! - [spinand]: the SPI-NAND command set and physical layer, which owns a [bbt::Bbt] and drives a
//!   bus through a [spi::SpiHelper].
//! - [nand]: the block-oriented [nand::Nand] abstraction that upper layers consume.

pub mod bbt;
pub mod nand;
pub mod spi;
pub mod spinand;
