//! A simulated in-memory SPI-NAND chip, for testing purposes
//!
//! [SimSpiNand] sits on the far side of the [SpiBus] trait and decodes the same command set that
//! [SpiNand](super::SpiNand) sends, so the physical layer can be exercised without hardware.

use super::cmd::{reg, status, Command, EccStatus, CONFIG_ECC_EN};
use crate::nand::{NandLayout, PageUtil};
use crate::spi::{SpiBus, SpiError, Transfer};

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use nix::errno::Errno;

/// Block protection bits as the chip powers up: every block locked
const PROTECTION_LOCKED: u8 = 0x38;

/// A simulated SPI-NAND chip
#[derive(Debug, Clone)]
pub struct SimSpiNand {
    layout: NandLayout,

    /// What READ_ID answers with
    id: Vec<u8>,

    /// Content (data area, then OOB) of every programmed page, by chip-wide page index; pages
    /// missing here are erased
    pages: HashMap<u32, Box<[u8]>>,

    /// The page cache
    cache: Box<[u8]>,

    /// Currently selected die
    die: u32,

    /// Status register, minus OIP (which is derived from `busy_remaining`)
    status: u8,
    config: u8,
    protection: u8,

    /// Blocks whose erase and program operations fail
    failing: HashSet<u32>,

    /// What the ECC engine reports when a given chip-wide page index is read
    ecc: HashMap<u32, EccStatus>,

    /// How many status reads report OIP after each array operation
    busy_polls: u32,
    busy_remaining: u32,

    /// Every command header received, in order
    commands: Vec<Command>,
}

impl SimSpiNand {
    /// Create a fully-erased chip with the specified layout, answering READ_ID with `id`
    pub fn new(layout: NandLayout, id: &[u8]) -> Self {
        Self {
            layout,
            id: id.to_vec(),
            pages: HashMap::new(),
            cache: vec![0xFF; layout.cache_size()].into_boxed_slice(),
            die: 0,
            status: 0,
            config: 0,
            protection: PROTECTION_LOCKED,
            failing: HashSet::new(),
            ecc: HashMap::new(),
            busy_polls: 0,
            busy_remaining: 0,
            commands: Vec::new(),
        }
    }

    /// Make `block` a factory-bad block: its marker byte is cleared, and it fails every erase
    /// and program
    pub fn factory_bad(mut self, block: u32) -> anyhow::Result<Self> {
        let page = self.page_index(block, 0)?;
        let mut content = vec![0xFF; self.layout.cache_size()];
        content[self.layout.bytes_per_page] = 0x00;
        self.pages.insert(page, content.into());
        self.failing.insert(block);
        Ok(self)
    }

    /// Make erase and program operations on `block` fail
    pub fn fail_block(&mut self, block: u32) {
        self.failing.insert(block);
    }

    /// Set what the ECC engine reports for a page
    pub fn set_ecc(&mut self, block: u32, page: u32, ecc: EccStatus) -> anyhow::Result<()> {
        let page = self.page_index(block, page)?;
        self.ecc.insert(page, ecc);
        Ok(())
    }

    /// Report busy for `polls` status reads after each array operation
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Every command header received so far
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The current value of a feature register
    pub fn feature(&self, register: u8) -> u8 {
        match register {
            reg::STATUS => self.status,
            reg::CONFIG => self.config,
            reg::PROTECTION => self.protection,
            _ => 0,
        }
    }

    /// The raw content (data area, then OOB) of a page; pages outside the chip read as erased
    pub fn raw_page(&self, block: u32, page: u32) -> Vec<u8> {
        let content = self
            .page_index(block, page)
            .ok()
            .and_then(|page| self.pages.get(&page));

        match content {
            Some(content) => content.to_vec(),
            None => vec![0xFF; self.layout.cache_size()],
        }
    }

    /// Initialize the chip contents from a raw image (every page's data area and OOB, in order)
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.cache_size()];
        let pages = self.layout.blocks() * self.layout.pages_per_block;

        self.pages.clear();
        for page in 0..pages {
            read.read_exact(&mut buf)?;
            if !buf.is_erased() {
                self.pages.insert(page, buf.clone().into());
            }
        }

        Ok(())
    }

    /// Write the chip contents out as a raw image, in the format [SimSpiNand::load] reads
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased = vec![0xFF; self.layout.cache_size()];
        let pages = self.layout.blocks() * self.layout.pages_per_block;

        for page in 0..pages {
            let content = self.pages.get(&page).map_or(&erased[..], |x| &x[..]);
            write.write_all(content)?;
        }

        Ok(())
    }

    /// Convert a block and page to a chip-wide page index
    fn page_index(&self, block: u32, page: u32) -> anyhow::Result<u32> {
        anyhow::ensure!(
            block < self.layout.blocks() && page < self.layout.pages_per_block,
            "block {block}, page {page} is outside the simulated chip"
        );
        Ok(block * self.layout.pages_per_block + page)
    }

    /// Convert a row address on the selected die to a chip-wide page index
    fn row_to_page(&self, row: u32) -> Option<u32> {
        let rows_per_die = self.layout.blocks_per_die * self.layout.pages_per_block;
        (row < rows_per_die).then(|| self.die * rows_per_die + row)
    }

    /// Begin an array operation (read, program, erase)
    fn start_busy(&mut self) {
        self.busy_remaining = self.busy_polls;
    }

    /// Can the block holding `page` be programmed or erased right now?
    fn writable(&self, page: u32) -> bool {
        let block = page / self.layout.pages_per_block;
        self.protection == 0 && !self.failing.contains(&block)
    }

    /// Perform `cmd`, with `payload` being whatever was clocked out after the header, and return
    /// what the chip clocks back during the data phase
    fn execute(&mut self, cmd: Command, payload: &[u8]) -> Vec<u8> {
        match cmd {
            Command::Reset => {
                self.cache.fill(0xFF);
                self.status = 0;
                self.die = 0;
            }

            Command::ReadId => return self.id.clone(),

            Command::GetFeature(reg::STATUS) => {
                let mut value = self.status;
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    value |= status::OIP;
                }
                return vec![value];
            }
            Command::GetFeature(register) => return vec![self.feature(register)],

            Command::SetFeature(reg::CONFIG, value) => self.config = value,
            Command::SetFeature(reg::PROTECTION, value) => self.protection = value,
            Command::SetFeature(..) => (),

            Command::WriteEnable => self.status |= status::WEL,
            Command::WriteDisable => self.status &= !status::WEL,

            Command::DieSelect(die) => {
                if u32::from(die) < self.layout.dies {
                    self.die = die.into();
                }
            }

            Command::PageRead(row) => {
                self.start_busy();
                self.status &= !status::ECC_MASK;

                let Some(page) = self.row_to_page(row) else {
                    self.cache.fill(0xFF);
                    return Vec::new();
                };

                match self.pages.get(&page) {
                    Some(content) => self.cache.copy_from_slice(content),
                    None => self.cache.fill(0xFF),
                }

                if self.config & CONFIG_ECC_EN != 0 {
                    let ecc = self.ecc.get(&page).copied().unwrap_or(EccStatus::Clean);
                    self.status |= ecc.to_status_bits();
                }
            }

            Command::ReadFromCache(column) => {
                return self.cache.get(usize::from(column)..).unwrap_or(&[]).to_vec();
            }

            Command::ProgramLoad(column) => {
                self.cache.fill(0xFF);
                if let Some(dest) = self.cache.get_mut(usize::from(column)..) {
                    let len = dest.len().min(payload.len());
                    dest[..len].copy_from_slice(&payload[..len]);
                }
            }

            Command::ProgramExecute(row) => {
                if self.status & status::WEL == 0 {
                    return Vec::new();
                }
                self.start_busy();
                self.status &= !(status::WEL | status::PROGRAM_FAIL);

                match self.row_to_page(row).filter(|&page| self.writable(page)) {
                    Some(page) => {
                        let cache_size = self.layout.cache_size();
                        let content = self
                            .pages
                            .entry(page)
                            .or_insert_with(|| vec![0xFF; cache_size].into());

                        // Programming can only clear bits
                        for (cell, &bit) in content.iter_mut().zip(self.cache.iter()) {
                            *cell &= bit;
                        }
                    }
                    None => self.status |= status::PROGRAM_FAIL,
                }
            }

            Command::BlockErase(row) => {
                if self.status & status::WEL == 0 {
                    return Vec::new();
                }
                self.start_busy();
                self.status &= !(status::WEL | status::ERASE_FAIL);

                match self.row_to_page(row).filter(|&page| self.writable(page)) {
                    Some(page) => {
                        let ppb = self.layout.pages_per_block;
                        let first = page - page % ppb;
                        for page in first..first + ppb {
                            self.pages.remove(&page);
                        }
                    }
                    None => self.status |= status::ERASE_FAIL,
                }
            }
        }

        Vec::new()
    }
}

impl SpiBus for SimSpiNand {
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        // Reconstruct what was clocked out; receive-only segments clock out filler
        let mut mosi = Vec::new();
        for xfer in xfers.iter() {
            match xfer.tx {
                Some(tx) => mosi.extend_from_slice(tx),
                None => mosi.resize(mosi.len() + xfer.len, 0xFF),
            }
        }

        let cmd = Command::decode(&mosi).ok_or(Errno::EINVAL)?;
        self.commands.push(cmd);

        let header_len = cmd.header_len();
        let miso = self.execute(cmd, &mosi[header_len..]);

        // Nothing is driven during the header, or past the end of the response
        let mut offset = 0;
        for xfer in xfers.iter_mut() {
            if let Some(rx) = xfer.rx.as_mut() {
                for (i, byte) in rx.iter_mut().enumerate() {
                    *byte = (offset + i)
                        .checked_sub(header_len)
                        .and_then(|pos| miso.get(pos))
                        .copied()
                        .unwrap_or(0xFF);
                }
            }
            offset += xfer.len;
        }

        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    dies: 1,
    blocks_per_die: 8,
    pages_per_block: 4,
    bytes_per_page: 64,
    oob_bytes: 8,
};

#[cfg(test)]
fn exchange(chip: &mut SimSpiNand, cmd: Command, tx: &[u8], rx: &mut [u8]) {
    let header = cmd.encode();
    chip.transfer(&mut [
        Transfer::write(&header),
        Transfer::write(tx),
        Transfer::read(rx),
    ])
    .unwrap();
}

#[test]
fn test_sim_read_id() {
    let mut chip = SimSpiNand::new(TEST_LAYOUT, &[0x12, 0x34]);
    let mut id = [0u8; 3];
    exchange(&mut chip, Command::ReadId, &[], &mut id);
    assert_eq!(id, [0x12, 0x34, 0xFF]);
}

#[test]
fn test_sim_program_needs_unlock_and_wel() {
    let mut chip = SimSpiNand::new(TEST_LAYOUT, &[]);
    let data = [0x00u8; 4];

    // Locked at power-up
    exchange(&mut chip, Command::WriteEnable, &[], &mut []);
    exchange(&mut chip, Command::ProgramLoad(0), &data, &mut []);
    exchange(&mut chip, Command::ProgramExecute(0), &[], &mut []);
    assert_ne!(chip.feature(reg::STATUS) & status::PROGRAM_FAIL, 0);
    assert!(chip.raw_page(0, 0).is_erased());

    // Unlocked, but no WEL: ignored
    exchange(&mut chip, Command::SetFeature(reg::PROTECTION, 0), &[], &mut []);
    exchange(&mut chip, Command::ProgramLoad(0), &data, &mut []);
    exchange(&mut chip, Command::ProgramExecute(0), &[], &mut []);
    assert!(chip.raw_page(0, 0).is_erased());

    exchange(&mut chip, Command::WriteEnable, &[], &mut []);
    exchange(&mut chip, Command::ProgramLoad(0), &data, &mut []);
    exchange(&mut chip, Command::ProgramExecute(0), &[], &mut []);
    assert_eq!(chip.feature(reg::STATUS) & status::WEL, 0);
    assert_eq!(chip.raw_page(0, 0)[..5], [0, 0, 0, 0, 0xFF]);
}

#[test]
fn test_sim_program_only_clears_bits() {
    let mut chip = SimSpiNand::new(TEST_LAYOUT, &[]);
    exchange(&mut chip, Command::SetFeature(reg::PROTECTION, 0), &[], &mut []);

    for pattern in [0xF0u8, 0x3C] {
        exchange(&mut chip, Command::WriteEnable, &[], &mut []);
        exchange(&mut chip, Command::ProgramLoad(2), &[pattern], &mut []);
        exchange(&mut chip, Command::ProgramExecute(9), &[], &mut []);
    }
    assert_eq!(chip.raw_page(2, 1)[2], 0x30);

    exchange(&mut chip, Command::WriteEnable, &[], &mut []);
    exchange(&mut chip, Command::BlockErase(8), &[], &mut []);
    assert!(chip.raw_page(2, 1).is_erased());
}

#[test]
fn test_sim_busy_and_save_load() -> anyhow::Result<()> {
    let mut chip = SimSpiNand::new(TEST_LAYOUT, &[]).factory_bad(5)?;
    chip.set_busy_polls(2);

    exchange(&mut chip, Command::PageRead(0), &[], &mut []);
    let mut sr = [0u8];
    for expected in [status::OIP, status::OIP, 0] {
        exchange(&mut chip, Command::GetFeature(reg::STATUS), &[], &mut sr);
        assert_eq!(sr[0] & status::OIP, expected);
    }

    let mut image = Vec::new();
    chip.save(&mut image)?;
    assert_eq!(
        image.len(),
        (TEST_LAYOUT.blocks() * TEST_LAYOUT.pages_per_block) as usize * TEST_LAYOUT.cache_size()
    );

    let mut copy = SimSpiNand::new(TEST_LAYOUT, &[]);
    copy.load(&mut &image[..])?;
    assert_eq!(copy.raw_page(5, 0), chip.raw_page(5, 0));
    assert_eq!(copy.raw_page(5, 0)[TEST_LAYOUT.bytes_per_page], 0x00);

    Ok(())
}

#[test]
fn test_sim_rejects_blocks_outside_chip() -> anyhow::Result<()> {
    let chip = SimSpiNand::new(TEST_LAYOUT, &[]);
    assert!(chip.clone().factory_bad(TEST_LAYOUT.blocks()).is_err());
    assert!(chip.clone().factory_bad(u32::MAX).is_err());

    let mut chip = chip.factory_bad(TEST_LAYOUT.blocks() - 1)?;
    assert!(chip.set_ecc(0, TEST_LAYOUT.pages_per_block, EccStatus::Corrected).is_err());
    assert!(chip.set_ecc(u32::MAX, 0, EccStatus::Corrected).is_err());
    assert!(chip.raw_page(u32::MAX, 0).is_erased());

    Ok(())
}
