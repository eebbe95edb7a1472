//! The SPI-NAND physical layer
//!
//! [SpiNand] drives one chip through a [SpiHelper]: it resets and identifies the chip, unlocks it,
//! and then reads, programs and erases on behalf of upper layers. Each chip owns its [Bbt], which
//! is consulted (and, for blocks that were never probed, filled in from the factory markers) on
//! every block-level decision.
//!
//! Bad-block markers follow the common SPI-NAND convention: the first OOB byte of the first two
//! pages of a block is 0xFF on a good block. That byte is therefore reserved; upper layers must not
//! program anything else into it.

pub mod cmd;
pub mod ids;
pub mod sim;

use self::cmd::{reg, status, Command, CONFIG_ECC_EN};
pub use self::cmd::EccStatus;
use crate::bbt::{Bbt, BbtError, BlockStatus};
use crate::nand::{Nand, NandBlock, NandLayout};
use crate::spi::{SpiBus, SpiError, SpiHelper, Transfer};

use anyhow::ensure;
use retry::{delay::Fixed, retry, OperationResult};
use thiserror::Error;

/// Pages whose first OOB byte holds the bad-block marker
const MARKER_PAGES: [u32; 2] = [0, 1];
const MARKER_GOOD: u8 = 0xFF;
const MARKER_BAD: u8 = 0x00;

/// How many READ_ID bytes are kept
pub const ID_LEN: usize = 3;

/// The ways a [SpiNand] operation may fail
#[derive(Error, Debug, Eq, PartialEq, Clone)]
pub enum SpinandError {
    #[error(transparent)]
    Spi(#[from] SpiError),

    #[error(transparent)]
    Bbt(#[from] BbtError),

    #[error("timed out waiting for the chip to become ready")]
    Timeout,

    #[error("erase of block {0} failed")]
    EraseFailed(u32),

    #[error("program of block {block}, page {page} failed")]
    ProgramFailed { block: u32, page: u32 },

    #[error("uncorrectable ECC error in block {block}, page {page}")]
    Uncorrectable { block: u32, page: u32 },

    #[error("block {block}, page {page} out of range")]
    OutOfRange { block: u32, page: u32 },

    #[error("unknown chip ID {0:02X?}; a layout must be supplied")]
    UnknownChip([u8; ID_LEN]),

    #[error("unusable layout: {0}")]
    BadLayout(&'static str),

    #[error("buffer of {got} bytes where {expected} were expected")]
    BufferSize { expected: usize, got: usize },
}

/// Options for [SpiNand::attach]
#[derive(Debug, Clone)]
pub struct SpinandConfig {
    /// Use this layout instead of looking the chip up by its ID
    pub layout: Option<NandLayout>,

    /// Whether the bus can hold itself exclusively for a whole message
    pub atomic: bool,

    /// Probe every block's bad-block marker during attach
    pub scan: bool,

    /// Delay between status polls while the chip is busy
    pub poll_interval_ms: u64,

    /// How many times to re-poll a busy chip before giving up
    pub poll_attempts: usize,
}

impl Default for SpinandConfig {
    fn default() -> Self {
        Self {
            layout: None,
            atomic: false,
            scan: true,
            poll_interval_ms: 1,
            poll_attempts: 100,
        }
    }
}

/// An attached SPI-NAND chip
#[derive(Debug)]
pub struct SpiNand<B> {
    spi: SpiHelper<B>,
    config: SpinandConfig,
    id: [u8; ID_LEN],
    name: Option<&'static str>,
    layout: NandLayout,
    bbt: Bbt,

    /// The die most recently selected, if any
    die: Option<u32>,
}

impl<B: SpiBus> SpiNand<B> {
    /// Bring up the chip on `bus`: reset it, identify it, unlock every block, enable on-die ECC,
    /// and allocate its bad-block table. With `config.scan`, every block is then probed.
    pub fn attach(bus: B, config: SpinandConfig) -> Result<Self, SpinandError> {
        let mut spi = SpiHelper::new(bus, config.atomic);

        spi.write_atomic(&Command::Reset.encode())?;
        wait_ready(&mut spi, &config)?;

        let mut id = [0u8; ID_LEN];
        spi.write_then_read_atomic(&Command::ReadId.encode(), &mut id)?;

        let chip = ids::lookup(&id);
        let layout = match (config.layout, chip) {
            (Some(layout), _) => layout,
            (None, Some(chip)) => chip.layout,
            (None, None) => return Err(SpinandError::UnknownChip(id)),
        };
        layout.check().map_err(SpinandError::BadLayout)?;

        log::info!(
            "SPI-NAND {:02X?} ({}): {} blocks of {} x {}+{} bytes",
            id,
            chip.map_or("unknown part", |x| x.name),
            layout.blocks(),
            layout.pages_per_block,
            layout.bytes_per_page,
            layout.oob_bytes,
        );

        let bbt = Bbt::new(layout.blocks())?;
        let mut nand = Self {
            spi,
            config,
            id,
            name: chip.map(|x| x.name),
            layout,
            bbt,
            die: None,
        };

        for die in 0..layout.dies {
            nand.select_die(die)?;
            nand.set_feature(reg::PROTECTION, 0)?;
            let config = nand.get_feature(reg::CONFIG)?;
            nand.set_feature(reg::CONFIG, config | CONFIG_ECC_EN)?;
        }

        if nand.config.scan {
            nand.scan_bbt()?;
        }

        Ok(nand)
    }

    /// Release the chip, dropping its bad-block table, and hand back the bus
    pub fn detach(self) -> B {
        self.spi.into_inner()
    }

    /// The bytes the chip answered READ_ID with
    pub fn id(&self) -> [u8; ID_LEN] {
        self.id
    }

    /// The part name, if the chip was found in the ID table
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    pub fn bbt(&self) -> &Bbt {
        &self.bbt
    }

    pub fn bus(&self) -> &B {
        self.spi.bus()
    }

    pub fn bus_mut(&mut self) -> &mut B {
        self.spi.bus_mut()
    }

    pub fn get_feature(&mut self, register: u8) -> Result<u8, SpinandError> {
        get_feature(&mut self.spi, register)
    }

    pub fn set_feature(&mut self, register: u8, value: u8) -> Result<(), SpinandError> {
        self.spi
            .write_atomic(&Command::SetFeature(register, value).encode())?;
        Ok(())
    }

    /// Poll until the chip finishes its current operation, returning the final status register
    pub fn wait_ready(&mut self) -> Result<u8, SpinandError> {
        wait_ready(&mut self.spi, &self.config)
    }

    /// Read one page into `data`, and its OOB area into `oob` if given
    ///
    /// Bitflips that the on-die ECC corrected are reported as [EccStatus::Corrected]; ones it
    /// could not correct are an error.
    pub fn read_page(
        &mut self,
        block: u32,
        page: u32,
        data: &mut [u8],
        oob: Option<&mut [u8]>,
    ) -> Result<EccStatus, SpinandError> {
        check_len(data.len(), self.layout.bytes_per_page)?;
        if let Some(oob) = &oob {
            check_len(oob.len(), self.layout.oob_bytes)?;
        }

        let ecc = self.load_page(block, page)?;
        if ecc == EccStatus::Uncorrectable {
            return Err(SpinandError::Uncorrectable { block, page });
        }

        let header = Command::ReadFromCache(0).encode();
        match oob {
            Some(oob) => self.spi.sync_atomic(&mut [
                Transfer::write(&header),
                Transfer::read(data),
                Transfer::read(oob),
            ])?,
            None => self
                .spi
                .sync_atomic(&mut [Transfer::write(&header), Transfer::read(data)])?,
        }

        if ecc == EccStatus::Corrected {
            log::debug!("corrected bitflips in block {block}, page {page}");
        }

        Ok(ecc)
    }

    /// Program one page from `data`, and its OOB area from `oob` if given
    ///
    /// The first OOB byte is the bad-block marker and should be left 0xFF.
    pub fn program_page(
        &mut self,
        block: u32,
        page: u32,
        data: &[u8],
        oob: Option<&[u8]>,
    ) -> Result<(), SpinandError> {
        check_len(data.len(), self.layout.bytes_per_page)?;
        match oob {
            Some(oob) => {
                check_len(oob.len(), self.layout.oob_bytes)?;
                self.program_cache(block, page, 0, &[data, oob])
            }
            None => self.program_cache(block, page, 0, &[data]),
        }
    }

    /// Erase one block
    pub fn erase_block(&mut self, block: u32) -> Result<(), SpinandError> {
        let (die, row) = self.address(block, 0)?;
        self.select_die(die)?;

        self.spi.write_atomic(&Command::WriteEnable.encode())?;
        self.spi.write_atomic(&Command::BlockErase(row).encode())?;

        let sr = self.wait_ready()?;
        if sr & status::ERASE_FAIL != 0 {
            return Err(SpinandError::EraseFailed(block));
        }

        Ok(())
    }

    /// Is `block` bad?
    ///
    /// The answer comes from the bad-block table when it is known; otherwise the block's markers
    /// are read and the table is updated.
    pub fn is_bad(&mut self, block: u32) -> Result<bool, SpinandError> {
        match self.bbt.query(block)? {
            BlockStatus::Bad => return Ok(true),
            BlockStatus::Good => return Ok(false),
            BlockStatus::NotMarked => (),
        }

        let mut bad = false;
        for page in MARKER_PAGES {
            if self.read_marker(block, page)? != MARKER_GOOD {
                bad = true;
                break;
            }
        }

        if bad {
            log::info!("block {block} carries a bad-block marker");
        }
        self.bbt.mark(block, bad)?;

        Ok(bad)
    }

    /// Mark `block` bad, both on the chip and in the bad-block table
    ///
    /// The block is erased and then has its markers cleared; as the block is going out of use
    /// anyway, failure of either step is only logged. The table is updated regardless.
    pub fn mark_bad(&mut self, block: u32) -> Result<(), SpinandError> {
        // Range check, before touching the chip
        self.bbt.query(block)?;

        if let Err(error) = self.erase_block(block) {
            tolerate_device_failure(error)?;
        }

        let column = self.layout.bytes_per_page as u16;
        for page in MARKER_PAGES {
            if let Err(error) = self.program_cache(block, page, column, &[&[MARKER_BAD]]) {
                tolerate_device_failure(error)?;
            }
        }

        self.bbt.mark(block, true)?;
        log::info!("marked block {block} bad");

        Ok(())
    }

    /// Probe every block's markers, discarding whatever the bad-block table held before.
    ///
    /// Returns the number of bad blocks found.
    pub fn scan_bbt(&mut self) -> Result<u32, SpinandError> {
        let blocks = self.layout.blocks();
        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(blocks));

        for block in 0..blocks {
            self.bbt.forget(block)?;
            self.is_bad(block)?;
            rpt.inc();
        }

        rpt.close();

        let bad = self.bbt.count_bad();
        log::info!("{bad} of {blocks} blocks are bad");
        Ok(bad)
    }

    /// Validate a block/page pair and convert it to the die and row address
    fn address(&self, block: u32, page: u32) -> Result<(u32, u32), SpinandError> {
        if block >= self.layout.blocks() || page >= self.layout.pages_per_block {
            return Err(SpinandError::OutOfRange { block, page });
        }

        let (die, row) = self.layout.locate(block);
        Ok((die, row + page))
    }

    fn select_die(&mut self, die: u32) -> Result<(), SpinandError> {
        if self.layout.dies > 1 && self.die != Some(die) {
            // `check()` bounds the die count to what fits in a byte
            self.spi
                .write_atomic(&Command::DieSelect(die as u8).encode())?;
            self.die = Some(die);
        }
        Ok(())
    }

    /// Load a page into the chip's cache, returning what the ECC engine made of it
    fn load_page(&mut self, block: u32, page: u32) -> Result<EccStatus, SpinandError> {
        let (die, row) = self.address(block, page)?;
        self.select_die(die)?;

        self.spi.write_atomic(&Command::PageRead(row).encode())?;
        let sr = self.wait_ready()?;

        Ok(EccStatus::from_status(sr))
    }

    /// Read the bad-block marker of a page, ignoring ECC (the marker is not covered by it)
    fn read_marker(&mut self, block: u32, page: u32) -> Result<u8, SpinandError> {
        self.load_page(block, page)?;

        let column = self.layout.bytes_per_page as u16;
        let mut marker = [0u8];
        self.spi
            .write_then_read_atomic(&Command::ReadFromCache(column).encode(), &mut marker)?;

        Ok(marker[0])
    }

    /// Load `segments` into the cache, back to back from `column` (the rest of the cache is
    /// all-1s), and program it into a page
    fn program_cache(
        &mut self,
        block: u32,
        page: u32,
        column: u16,
        segments: &[&[u8]],
    ) -> Result<(), SpinandError> {
        let (die, row) = self.address(block, page)?;
        self.select_die(die)?;

        self.spi.write_atomic(&Command::WriteEnable.encode())?;

        let header = Command::ProgramLoad(column).encode();
        let mut xfers: Vec<Transfer<'_>> = std::iter::once(Transfer::write(&header))
            .chain(segments.iter().map(|&x| Transfer::write(x)))
            .collect();
        self.spi.sync_atomic(&mut xfers)?;

        self.spi
            .write_atomic(&Command::ProgramExecute(row).encode())?;

        let sr = self.wait_ready()?;
        if sr & status::PROGRAM_FAIL != 0 {
            return Err(SpinandError::ProgramFailed { block, page });
        }

        Ok(())
    }
}

fn get_feature<B: SpiBus>(spi: &mut SpiHelper<B>, register: u8) -> Result<u8, SpinandError> {
    let mut value = [0u8];
    spi.write_then_read_atomic(&Command::GetFeature(register).encode(), &mut value)?;
    Ok(value[0])
}

fn wait_ready<B: SpiBus>(
    spi: &mut SpiHelper<B>,
    config: &SpinandConfig,
) -> Result<u8, SpinandError> {
    let delays = Fixed::from_millis(config.poll_interval_ms).take(config.poll_attempts);

    retry(delays, || match get_feature(spi, reg::STATUS) {
        Ok(sr) if sr & status::OIP != 0 => OperationResult::Retry(SpinandError::Timeout),
        Ok(sr) => OperationResult::Ok(sr),
        Err(error) => OperationResult::Err(error),
    })
    .map_err(|x| x.error)
}

/// Swallow (with a log message) the errors a failing block can produce; pass the rest through
fn tolerate_device_failure(error: SpinandError) -> Result<(), SpinandError> {
    match error {
        SpinandError::EraseFailed(_)
        | SpinandError::ProgramFailed { .. }
        | SpinandError::Timeout => {
            log::warn!("ignoring failure on a block being retired: {error}");
            Ok(())
        }
        error => Err(error),
    }
}

fn check_len(got: usize, expected: usize) -> Result<(), SpinandError> {
    if got == expected {
        Ok(())
    } else {
        Err(SpinandError::BufferSize { expected, got })
    }
}

impl<B: SpiBus> Nand for SpiNand<B> {
    type Block<'a> = SpiNandBlock<'a, B> where Self: 'a;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<SpiNandBlock<'_, B>>> {
        if self.is_bad(index)? {
            Ok(None)
        } else {
            Ok(Some(SpiNandBlock { nand: self, index }))
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

/// A good block of a [SpiNand]
pub struct SpiNandBlock<'a, B> {
    nand: &'a mut SpiNand<B>,
    index: u32,
}

impl<B: SpiBus> NandBlock for SpiNandBlock<'_, B> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }

    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }

    fn read(&mut self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(
            content.len() % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let page_size = self.page_size();
        for (page, chunk) in (start_page..).zip(content.chunks_mut(page_size)) {
            self.nand.read_page(self.index, page, chunk, None)?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(
            content.len() % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        for (page, chunk) in (start_page..).zip(content.chunks(self.page_size())) {
            self.nand.program_page(self.index, page, chunk, None)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        Ok(self.nand.erase_block(self.index)?)
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        Ok(self.nand.mark_bad(self.index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimSpiNand;
    use super::*;
    use crate::nand::{dump, PageUtil, BAD_BLOCK_FILL};

    const TEST_ID: [u8; 3] = [0xAA, 0x55, 0x01];

    const TEST_LAYOUT: NandLayout = NandLayout {
        dies: 1,
        blocks_per_die: 16,
        pages_per_block: 8,
        bytes_per_page: 256,
        oob_bytes: 16,
    };

    fn test_config(layout: NandLayout) -> SpinandConfig {
        SpinandConfig {
            layout: Some(layout),
            poll_interval_ms: 0,
            ..Default::default()
        }
    }

    fn attach(chip: SimSpiNand) -> SpiNand<SimSpiNand> {
        SpiNand::attach(chip, test_config(TEST_LAYOUT)).unwrap()
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[test]
    fn test_attach_unlocks_and_enables_ecc() {
        let nand = attach(SimSpiNand::new(TEST_LAYOUT, &TEST_ID));
        assert_eq!(nand.id(), TEST_ID);
        assert_eq!(nand.name(), None);
        assert_eq!(nand.bus().feature(reg::PROTECTION), 0);
        assert_ne!(nand.bus().feature(reg::CONFIG) & CONFIG_ECC_EN, 0);
        assert_eq!(nand.bus().commands()[0], Command::Reset);
    }

    #[test]
    fn test_attach_by_id() -> anyhow::Result<()> {
        let info = &ids::CHIPS[0];
        let chip = SimSpiNand::new(info.layout, info.id);
        let config = SpinandConfig {
            scan: false,
            poll_interval_ms: 0,
            ..Default::default()
        };

        let nand = SpiNand::attach(chip, config)?;
        assert_eq!(nand.layout(), info.layout);
        assert_eq!(nand.name(), Some(info.name));
        assert_eq!(nand.bbt().len(), info.layout.blocks());
        assert_eq!(nand.bbt().count_unmarked(), info.layout.blocks());
        Ok(())
    }

    #[test]
    fn test_attach_unknown_chip() {
        let chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID);
        let config = SpinandConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            SpiNand::attach(chip, config).err(),
            Some(SpinandError::UnknownChip(TEST_ID))
        );
    }

    #[test]
    fn test_attach_bad_layout() {
        let layout = NandLayout {
            oob_bytes: 0,
            ..TEST_LAYOUT
        };
        let chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID);
        assert_eq!(
            SpiNand::attach(chip, test_config(layout)).err(),
            Some(SpinandError::BadLayout("bad-block markers need an OOB area"))
        );
    }

    #[test]
    fn test_read_program_page() -> anyhow::Result<()> {
        let mut nand = attach(SimSpiNand::new(TEST_LAYOUT, &TEST_ID));

        let data = pattern(0x5A, TEST_LAYOUT.bytes_per_page);
        let mut oob = pattern(0x11, TEST_LAYOUT.oob_bytes);
        oob[0] = 0xFF;

        nand.program_page(3, 2, &data, Some(&oob))?;
        nand.program_page(3, 3, &data, None)?;

        let mut data_out = vec![0; TEST_LAYOUT.bytes_per_page];
        let mut oob_out = vec![0; TEST_LAYOUT.oob_bytes];

        assert_eq!(
            nand.read_page(3, 2, &mut data_out, Some(&mut oob_out))?,
            EccStatus::Clean
        );
        assert_eq!(data_out, data);
        assert_eq!(oob_out, oob);

        nand.read_page(3, 3, &mut data_out, Some(&mut oob_out))?;
        assert_eq!(data_out, data);
        assert!(oob_out.is_erased());

        nand.read_page(3, 4, &mut data_out, None)?;
        assert!(data_out.is_erased());

        nand.erase_block(3)?;
        nand.read_page(3, 2, &mut data_out, None)?;
        assert!(data_out.is_erased());

        Ok(())
    }

    #[test]
    fn test_buffer_and_range_checks() {
        let mut nand = attach(SimSpiNand::new(TEST_LAYOUT, &TEST_ID));
        let mut short = vec![0; 10];
        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];

        assert_eq!(
            nand.read_page(0, 0, &mut short, None),
            Err(SpinandError::BufferSize {
                expected: TEST_LAYOUT.bytes_per_page,
                got: 10
            })
        );
        assert_eq!(
            nand.read_page(16, 0, &mut page, None),
            Err(SpinandError::OutOfRange { block: 16, page: 0 })
        );
        assert_eq!(
            nand.program_page(0, 8, &page, None),
            Err(SpinandError::OutOfRange { block: 0, page: 8 })
        );
        assert_eq!(
            nand.is_bad(16),
            Err(SpinandError::Bbt(BbtError::Overflow {
                block: 16,
                blocks: 16
            }))
        );
        assert!(nand.mark_bad(99).is_err());
        assert_eq!(nand.bbt().count_bad(), 0);
    }

    #[test]
    fn test_scan_finds_factory_bad() -> anyhow::Result<()> {
        let chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID)
            .factory_bad(0)?
            .factory_bad(9)?
            .factory_bad(15)?;
        let mut nand = attach(chip);

        assert_eq!(nand.bbt().bad_blocks().collect::<Vec<_>>(), [0, 9, 15]);
        assert_eq!(nand.bbt().count_unmarked(), 0);
        assert!(nand.is_bad(9)?);
        assert!(!nand.is_bad(8)?);

        assert_eq!(nand.scan_bbt()?, 3);
        Ok(())
    }

    #[test]
    fn test_probe_on_demand() -> anyhow::Result<()> {
        let chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID).factory_bad(4)?;
        let config = SpinandConfig {
            scan: false,
            ..test_config(TEST_LAYOUT)
        };
        let mut nand = SpiNand::attach(chip, config)?;

        assert_eq!(nand.bbt().query(4)?, BlockStatus::NotMarked);
        assert_eq!(nand.bbt().query(5)?, BlockStatus::NotMarked);

        assert!(nand.is_bad(4)?);
        assert!(!nand.is_bad(5)?);
        assert_eq!(nand.bbt().query(4)?, BlockStatus::Bad);
        assert_eq!(nand.bbt().query(5)?, BlockStatus::Good);

        // Known blocks are answered from the table, without touching the chip
        let sent = nand.bus().commands().len();
        assert!(nand.is_bad(4)?);
        assert_eq!(nand.bus().commands().len(), sent);

        Ok(())
    }

    #[test]
    fn test_mark_bad_persists() -> anyhow::Result<()> {
        let mut nand = attach(SimSpiNand::new(TEST_LAYOUT, &TEST_ID));

        let data = pattern(1, TEST_LAYOUT.bytes_per_page);
        nand.program_page(6, 0, &data, None)?;
        nand.mark_bad(6)?;
        assert_eq!(nand.bbt().query(6)?, BlockStatus::Bad);

        let chip = nand.detach();
        let marker = chip.raw_page(6, 0)[TEST_LAYOUT.bytes_per_page];
        assert_eq!(marker, MARKER_BAD);
        assert_eq!(chip.raw_page(6, 1)[TEST_LAYOUT.bytes_per_page], MARKER_BAD);

        // A fresh attach finds the marker again
        let nand = attach(chip);
        assert_eq!(nand.bbt().bad_blocks().collect::<Vec<_>>(), [6]);

        Ok(())
    }

    #[test]
    fn test_mark_bad_on_failing_block() -> anyhow::Result<()> {
        let mut chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID);
        chip.fail_block(2);
        let mut nand = attach(chip);

        let data = vec![0; TEST_LAYOUT.bytes_per_page];
        assert_eq!(nand.erase_block(2), Err(SpinandError::EraseFailed(2)));
        assert_eq!(
            nand.program_page(2, 0, &data, None),
            Err(SpinandError::ProgramFailed { block: 2, page: 0 })
        );

        // The marker can't be written, but the table still records the block
        nand.mark_bad(2)?;
        assert!(nand.is_bad(2)?);

        Ok(())
    }

    #[test]
    fn test_ecc_reporting() -> anyhow::Result<()> {
        let mut chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID);
        chip.set_ecc(1, 0, EccStatus::Corrected)?;
        chip.set_ecc(1, 1, EccStatus::Uncorrectable)?;
        let mut nand = attach(chip);

        let mut data = vec![0; TEST_LAYOUT.bytes_per_page];
        assert_eq!(nand.read_page(1, 0, &mut data, None)?, EccStatus::Corrected);
        assert_eq!(
            nand.read_page(1, 1, &mut data, None),
            Err(SpinandError::Uncorrectable { block: 1, page: 1 })
        );

        // Markers are read regardless of ECC
        assert!(!nand.is_bad(1)?);

        Ok(())
    }

    #[test]
    fn test_busy_polling() -> anyhow::Result<()> {
        let mut chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID);
        chip.set_busy_polls(3);
        let mut nand = attach(chip);

        let data = pattern(7, TEST_LAYOUT.bytes_per_page);
        nand.program_page(0, 0, &data, None)?;

        // Outlast the retry budget
        nand.bus_mut().set_busy_polls(1000);
        assert_eq!(nand.erase_block(0), Err(SpinandError::Timeout));

        Ok(())
    }

    #[test]
    fn test_die_select() -> anyhow::Result<()> {
        let layout = NandLayout {
            dies: 2,
            blocks_per_die: 4,
            ..TEST_LAYOUT
        };
        let chip = SimSpiNand::new(layout, &TEST_ID).factory_bad(5)?;
        let mut nand = SpiNand::attach(chip, test_config(layout))?;

        assert_eq!(nand.bbt().bad_blocks().collect::<Vec<_>>(), [5]);

        let data = pattern(9, layout.bytes_per_page);
        nand.program_page(6, 1, &data, None)?;
        nand.program_page(2, 1, &pattern(3, layout.bytes_per_page), None)?;

        let chip = nand.bus();
        assert_eq!(chip.raw_page(6, 1)[..layout.bytes_per_page], data[..]);
        assert!(chip.commands().contains(&Command::DieSelect(1)));

        Ok(())
    }

    #[test]
    fn test_atomic_config_uses_same_commands() -> anyhow::Result<()> {
        let config = SpinandConfig {
            atomic: true,
            ..test_config(TEST_LAYOUT)
        };
        let mut nand = SpiNand::attach(SimSpiNand::new(TEST_LAYOUT, &TEST_ID), config)?;

        let data = pattern(2, TEST_LAYOUT.bytes_per_page);
        nand.program_page(0, 0, &data, None)?;
        let mut out = vec![0; TEST_LAYOUT.bytes_per_page];
        nand.read_page(0, 0, &mut out, None)?;
        assert_eq!(out, data);

        Ok(())
    }

    #[test]
    fn test_nand_trait() -> anyhow::Result<()> {
        let chip = SimSpiNand::new(TEST_LAYOUT, &TEST_ID).factory_bad(1)?;
        let mut nand = attach(chip);
        let page_size = TEST_LAYOUT.bytes_per_page;

        assert!(nand.block(1)?.is_none());
        assert!(nand.block(TEST_LAYOUT.blocks()).is_err());

        let content = pattern(0x42, page_size * 2);
        let mut block = nand.block(0)?.unwrap();
        block.program(1, &content)?;
        assert!(block.program(0, &content[1..]).is_err());

        let mut out = vec![0; page_size * 3];
        block.read(0, &mut out)?;
        assert!(out[..page_size].is_erased());
        assert_eq!(out[page_size..], content[..]);

        block.mark_bad()?;
        assert!(nand.block(0)?.is_none());

        let mut image = Vec::new();
        dump(&mut nand, &mut image)?;
        assert_eq!(image.len(), TEST_LAYOUT.blocks() as usize * TEST_LAYOUT.block_size());
        assert!(image[..TEST_LAYOUT.block_size() * 2]
            .iter()
            .all(|&x| x == BAD_BLOCK_FILL));
        assert!(image[TEST_LAYOUT.block_size() * 2..].is_erased());

        Ok(())
    }
}
