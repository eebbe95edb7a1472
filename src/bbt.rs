//! The bad-block table (BBT): an in-memory record of which erase blocks are bad.
//!
//! The table is two bitmaps with one bit per block. The "bad" bitmap holds the health of each
//! block, and the "enabled" bitmap records whether that health has been determined at all. A bad
//! bit is only meaningful when the matching enabled bit is set, so a query has three outcomes; see
//! [BlockStatus].
//!
//! Both bitmaps live in one allocation, with the enabled bitmap immediately after the bad bitmap.
//! The table is owned by the chip it describes and freed when that chip is dropped.

use thiserror::Error;

type Word = u64;
const WORD_BITS: u32 = Word::BITS;

/// The result of a [Bbt::query]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockStatus {
    /// The block's health has never been determined
    NotMarked,

    /// The block is known to be bad
    Bad,

    /// The block is known to be good
    Good,
}

impl BlockStatus {
    /// Has this block's health been determined?
    pub fn is_known(self) -> bool {
        self != Self::NotMarked
    }

    /// Convert to the recorded health, or `None` if it was never determined.
    ///
    /// Callers that need a yes/no answer must decide what `None` means for them; treating it as
    /// "good" skips the probe that would have found a factory-marked bad block.
    pub fn bad(self) -> Option<bool> {
        match self {
            Self::NotMarked => None,
            Self::Bad => Some(true),
            Self::Good => Some(false),
        }
    }
}

/// The ways a [Bbt] operation may fail
#[derive(Error, Debug, Eq, PartialEq, Copy, Clone)]
pub enum BbtError {
    #[error("block {block} out of range (table holds {blocks} blocks)")]
    Overflow { block: u32, blocks: u32 },

    #[error("out of memory allocating a bad-block table for {blocks} blocks")]
    OutOfMemory { blocks: u32 },
}

/// A bad-block table covering a fixed number of blocks
#[derive(Debug, Clone)]
pub struct Bbt {
    /// The bad bitmap, followed by the enabled bitmap; each is half of the slice
    bitmap: Box<[Word]>,

    /// How many blocks this table covers
    blocks: u32,
}

impl Bbt {
    /// Allocate a table for `blocks` blocks, with every block `NotMarked`
    pub fn new(blocks: u32) -> Result<Self, BbtError> {
        let words = blocks.div_ceil(WORD_BITS) as usize;

        // Allocation failure is reported to the caller, so attach can fail instead of aborting
        let mut bitmap = Vec::new();
        bitmap
            .try_reserve_exact(words * 2)
            .map_err(|_| BbtError::OutOfMemory { blocks })?;
        bitmap.resize(words * 2, 0);

        Ok(Self {
            bitmap: bitmap.into_boxed_slice(),
            blocks,
        })
    }

    /// How many blocks does this table cover?
    pub fn len(&self) -> u32 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Record the health of `block`
    pub fn mark(&mut self, block: u32, is_bad: bool) -> Result<(), BbtError> {
        let (word, mask) = self.locate(block)?;
        let (bad, enabled) = self.split_mut();

        if is_bad {
            bad[word] |= mask;
        } else {
            bad[word] &= !mask;
        }
        enabled[word] |= mask;

        Ok(())
    }

    /// Look up the health of `block`
    pub fn query(&self, block: u32) -> Result<BlockStatus, BbtError> {
        let (word, mask) = self.locate(block)?;
        let (bad, enabled) = self.split();

        Ok(if enabled[word] & mask == 0 {
            BlockStatus::NotMarked
        } else if bad[word] & mask != 0 {
            BlockStatus::Bad
        } else {
            BlockStatus::Good
        })
    }

    /// Return `block` to the `NotMarked` state, so that its health is probed again
    pub fn forget(&mut self, block: u32) -> Result<(), BbtError> {
        let (word, mask) = self.locate(block)?;
        let (bad, enabled) = self.split_mut();

        bad[word] &= !mask;
        enabled[word] &= !mask;

        Ok(())
    }

    /// Iterate over the indices of every block known to be bad, in ascending order
    pub fn bad_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        let (bad, enabled) = self.split();

        bad.iter()
            .zip(enabled)
            .enumerate()
            .flat_map(|(i, (&bad, &enabled))| {
                let word = bad & enabled;
                (0..WORD_BITS)
                    .filter(move |&bit| word & (1 << bit) != 0)
                    .map(move |bit| i as u32 * WORD_BITS + bit)
            })
    }

    /// How many blocks are known to be bad?
    pub fn count_bad(&self) -> u32 {
        let (bad, enabled) = self.split();
        bad.iter()
            .zip(enabled)
            .map(|(&bad, &enabled)| (bad & enabled).count_ones())
            .sum()
    }

    /// How many blocks have never had their health determined?
    pub fn count_unmarked(&self) -> u32 {
        let (_, enabled) = self.split();
        let known: u32 = enabled.iter().map(|x| x.count_ones()).sum();
        self.blocks - known
    }

    /// Bounds-check `block` and find its word index and bit mask
    fn locate(&self, block: u32) -> Result<(usize, Word), BbtError> {
        if block >= self.blocks {
            return Err(BbtError::Overflow {
                block,
                blocks: self.blocks,
            });
        }

        Ok(((block / WORD_BITS) as usize, 1 << (block % WORD_BITS)))
    }

    fn split(&self) -> (&[Word], &[Word]) {
        self.bitmap.split_at(self.bitmap.len() / 2)
    }

    fn split_mut(&mut self) -> (&mut [Word], &mut [Word]) {
        let half = self.bitmap.len() / 2;
        self.bitmap.split_at_mut(half)
    }
}

#[test]
fn test_mark_query() -> anyhow::Result<()> {
    // Straddle a word boundary
    let mut bbt = Bbt::new(130)?;

    for block in 0..bbt.len() {
        assert_eq!(bbt.query(block)?, BlockStatus::NotMarked);
    }

    for block in [0, 1, 63, 64, 65, 127, 128, 129] {
        bbt.mark(block, true)?;
        assert_eq!(bbt.query(block)?, BlockStatus::Bad);
        bbt.mark(block, false)?;
        assert_eq!(bbt.query(block)?, BlockStatus::Good);
    }

    // Neighbours of touched blocks are untouched
    assert_eq!(bbt.query(2)?, BlockStatus::NotMarked);
    assert_eq!(bbt.query(62)?, BlockStatus::NotMarked);
    assert_eq!(bbt.query(66)?, BlockStatus::NotMarked);

    Ok(())
}

#[test]
fn test_overflow() -> anyhow::Result<()> {
    let mut bbt = Bbt::new(100)?;
    bbt.mark(99, true)?;
    let before = bbt.bitmap.clone();

    for block in [100, 101, 127, 128, u32::MAX] {
        let err = BbtError::Overflow { block, blocks: 100 };
        assert_eq!(bbt.mark(block, true), Err(err));
        assert_eq!(bbt.mark(block, false), Err(err));
        assert_eq!(bbt.query(block), Err(err));
        assert_eq!(bbt.forget(block), Err(err));
    }

    assert_eq!(bbt.bitmap, before);
    Ok(())
}

#[test]
fn test_layout_contiguous() -> anyhow::Result<()> {
    let mut bbt = Bbt::new(64)?;
    assert_eq!(bbt.bitmap.len(), 2);

    bbt.mark(3, true)?;
    assert_eq!(&bbt.bitmap[..], &[1 << 3, 1 << 3]);

    bbt.mark(3, false)?;
    assert_eq!(&bbt.bitmap[..], &[0, 1 << 3]);

    Ok(())
}

#[test]
fn test_empty_table() -> anyhow::Result<()> {
    let bbt = Bbt::new(0)?;
    assert!(bbt.is_empty());
    assert!(bbt.query(0).is_err());
    assert_eq!(bbt.count_unmarked(), 0);
    Ok(())
}

#[test]
fn test_counts_and_forget() -> anyhow::Result<()> {
    let mut bbt = Bbt::new(200)?;
    assert_eq!(bbt.count_unmarked(), 200);

    for block in [5, 70, 199] {
        bbt.mark(block, true)?;
    }
    bbt.mark(6, false)?;

    assert_eq!(bbt.count_bad(), 3);
    assert_eq!(bbt.count_unmarked(), 196);
    assert_eq!(bbt.bad_blocks().collect::<Vec<_>>(), [5, 70, 199]);

    bbt.forget(70)?;
    assert_eq!(bbt.query(70)?, BlockStatus::NotMarked);
    assert_eq!(bbt.bad_blocks().collect::<Vec<_>>(), [5, 199]);
    assert_eq!(bbt.count_unmarked(), 197);

    Ok(())
}

#[test]
fn test_status_helpers() {
    assert_eq!(BlockStatus::NotMarked.bad(), None);
    assert_eq!(BlockStatus::Bad.bad(), Some(true));
    assert_eq!(BlockStatus::Good.bad(), Some(false));
    assert!(!BlockStatus::NotMarked.is_known());
    assert!(BlockStatus::Good.is_known());
}
