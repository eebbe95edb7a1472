//! Abstractions and code to access NAND flash

use std::io::Write;
use std::str::FromStr;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// The OOB size assumed when a layout string doesn't give one
pub const DEFAULT_OOB_BYTES: usize = 64;

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub dies: u32,
    pub blocks_per_die: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes: usize,
}

impl NandLayout {
    /// Total number of erase blocks, across all dies
    pub fn blocks(&self) -> u32 {
        self.dies * self.blocks_per_die
    }

    /// Bytes in the data area of one block
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }

    /// Bytes of the page cache: the data area followed by the OOB area
    pub fn cache_size(&self) -> usize {
        self.bytes_per_page + self.oob_bytes
    }

    /// Which die holds `block`, and the block's row address (of page 0) within that die
    pub fn locate(&self, block: u32) -> (u32, u32) {
        let die = block / self.blocks_per_die;
        let row = (block % self.blocks_per_die) * self.pages_per_block;
        (die, row)
    }

    /// Ensure the layout describes a real device, and that its pages and blocks can be reached
    /// with SPI-NAND row (24-bit) and column (16-bit) addresses
    pub fn check(&self) -> Result<(), &'static str> {
        if self.dies == 0 || self.blocks_per_die == 0 {
            return Err("layout has no blocks");
        }
        if self.pages_per_block == 0 || self.bytes_per_page == 0 {
            return Err("layout has empty blocks");
        }
        if self.oob_bytes == 0 {
            return Err("bad-block markers need an OOB area");
        }
        if self.dies > u32::from(u8::MAX) + 1 {
            return Err("too many dies to select");
        }
        if u64::from(self.blocks_per_die) * u64::from(self.pages_per_block) > 1 << 24 {
            return Err("row addresses do not fit in 24 bits");
        }
        let blocks = u64::from(self.dies) * u64::from(self.blocks_per_die);
        if blocks > u64::from(u32::MAX) {
            return Err("too many blocks");
        }
        if blocks * u64::from(self.pages_per_block) > u64::from(u32::MAX) {
            return Err("too many pages");
        }
        if self.cache_size() > 1 << 16 {
            return Err("column addresses do not fit in 16 bits");
        }
        Ok(())
    }
}

/// Parse strings like "[DIESx]BLOCKSxPAGESxBYTES[+OOB]", e.g. "1024x64x2048+64" or
/// "2x1024x64x2048"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (geometry, oob_bytes) = match s.split_once('+') {
            Some((geometry, oob)) => (geometry, oob.parse()?),
            None => (s, DEFAULT_OOB_BYTES),
        };

        let fields = geometry.split('x').collect::<Vec<_>>();
        let (dies, blocks_per_die, pages_per_block, bytes_per_page) = match fields[..] {
            [dies, blocks, pages, bytes] => (dies.parse()?, blocks, pages, bytes),
            [blocks, pages, bytes] => (1, blocks, pages, bytes),
            _ => anyhow::bail!("expected [#x]#x#x#[+#]"),
        };

        let layout = NandLayout {
            dies,
            blocks_per_die: blocks_per_die.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
            oob_bytes,
        };

        layout.check().map_err(anyhow::Error::msg)?;

        Ok(layout)
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&mut self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Pages within a block must be programmed in ascending order; programming a page makes it
    /// and all skipped pages unwritable until the next erase.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Fill byte standing in for the content of bad blocks in a [dump]
pub const BAD_BLOCK_FILL: u8 = 0xBD;

/// Write the data area of every block out to a writable stream (such as a File)
///
/// Bad blocks are not read; their place in the output is filled with [BAD_BLOCK_FILL].
pub fn dump<N: Nand, W: Write>(nand: &mut N, write: &mut W) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let rpt = howudoin::new()
        .label("Dumping blocks")
        .set_len(u64::from(layout.blocks()));

    let mut buf = vec![0; layout.block_size()];
    for block in 0..layout.blocks() {
        match nand.block(block)? {
            None => buf.fill(BAD_BLOCK_FILL),
            Some(mut block) => block.read(0, &mut buf)?,
        };

        write.write_all(&buf)?;
        rpt.inc();
    }

    rpt.close();
    Ok(())
}

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x64x2048".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            dies: 1,
            blocks_per_die: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048,
            oob_bytes: DEFAULT_OOB_BYTES,
        }
    );

    let layout: NandLayout = "2x1024x64x4096+256".parse()?;
    assert_eq!(layout.dies, 2);
    assert_eq!(layout.blocks(), 2048);
    assert_eq!(layout.oob_bytes, 256);
    assert_eq!(layout.cache_size(), 4096 + 256);

    assert!("1024x64".parse::<NandLayout>().is_err());
    assert!("1x2x1024x64x2048".parse::<NandLayout>().is_err());
    assert!("0x64x2048".parse::<NandLayout>().is_err());
    assert!("1024x64x2048+0".parse::<NandLayout>().is_err());
    assert!("1024x64xlots".parse::<NandLayout>().is_err());

    // Each die is addressable, but the chip as a whole is not
    assert!("256x16777216x1x1+1".parse::<NandLayout>().is_err());
    assert!("256x65536x256x1+1".parse::<NandLayout>().is_err());
    assert!("255x65536x256x1+1".parse::<NandLayout>().is_ok());

    Ok(())
}

#[test]
fn test_locate() -> anyhow::Result<()> {
    let layout: NandLayout = "2x16x8x512+16".parse()?;
    assert_eq!(layout.locate(0), (0, 0));
    assert_eq!(layout.locate(3), (0, 24));
    assert_eq!(layout.locate(16), (1, 0));
    assert_eq!(layout.locate(31), (1, 15 * 8));
    Ok(())
}
