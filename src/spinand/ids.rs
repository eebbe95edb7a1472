//! Known SPI-NAND parts, by the bytes they answer READ_ID with

use crate::nand::NandLayout;

/// A known part
#[derive(Debug, Copy, Clone)]
pub struct ChipInfo {
    pub name: &'static str,

    /// Manufacturer ID, then device ID byte(s)
    pub id: &'static [u8],

    pub layout: NandLayout,
}

const fn layout(
    dies: u32,
    blocks_per_die: u32,
    pages_per_block: u32,
    bytes_per_page: usize,
    oob_bytes: usize,
) -> NandLayout {
    NandLayout {
        dies,
        blocks_per_die,
        pages_per_block,
        bytes_per_page,
        oob_bytes,
    }
}

pub const CHIPS: &[ChipInfo] = &[
    ChipInfo {
        name: "Winbond W25N01GV",
        id: &[0xEF, 0xAA, 0x21],
        layout: layout(1, 1024, 64, 2048, 64),
    },
    ChipInfo {
        name: "Winbond W25M02GV",
        id: &[0xEF, 0xAB, 0x21],
        layout: layout(2, 1024, 64, 2048, 64),
    },
    ChipInfo {
        name: "GigaDevice GD5F1GQ4UB",
        id: &[0xC8, 0xD1],
        layout: layout(1, 1024, 64, 2048, 128),
    },
    ChipInfo {
        name: "GigaDevice GD5F2GQ4UB",
        id: &[0xC8, 0xD2],
        layout: layout(1, 2048, 64, 2048, 128),
    },
    ChipInfo {
        name: "Macronix MX35LF1GE4AB",
        id: &[0xC2, 0x12],
        layout: layout(1, 1024, 64, 2048, 64),
    },
    ChipInfo {
        name: "Micron MT29F1G01ABAFD",
        id: &[0x2C, 0x14],
        layout: layout(1, 1024, 64, 2048, 128),
    },
];

/// Find the part whose ID is a prefix of `id`
pub fn lookup(id: &[u8]) -> Option<&'static ChipInfo> {
    CHIPS.iter().find(|chip| id.starts_with(chip.id))
}

#[test]
fn test_lookup() {
    assert_eq!(
        lookup(&[0xEF, 0xAB, 0x21]).map(|x| x.name),
        Some("Winbond W25M02GV")
    );
    assert_eq!(
        lookup(&[0xC8, 0xD1, 0xC8]).map(|x| x.layout.oob_bytes),
        Some(128)
    );
    assert!(lookup(&[0xEF, 0xAA, 0x20]).is_none());
    assert!(lookup(&[0xFF, 0xFF, 0xFF]).is_none());
    assert!(lookup(&[]).is_none());
}

#[test]
fn test_table_ids_unambiguous() {
    for (i, a) in CHIPS.iter().enumerate() {
        for b in &CHIPS[i + 1..] {
            assert!(!a.id.starts_with(b.id) && !b.id.starts_with(a.id));
        }
    }
}
