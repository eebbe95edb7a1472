//! A command-line tool for inspecting and maintaining SPI-NAND flash.
//!
//! It drives either a real chip behind a Linux spidev device or a simulated one backed by an image
//! file, so the bad-block handling can be tried out without hardware.

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{Level, LevelFilter, Log, Metadata, Record};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use aw_spinand::{
    bbt::BlockStatus,
    nand::{dump, NandLayout},
    spi::SpiBus,
    spinand::{ids, sim::SimSpiNand, SpiNand, SpinandConfig},
};
#[cfg(target_os = "linux")]
use aw_spinand::spi::spidev::Spidev;

/// READ_ID answer of a simulated chip when no table entry matches its layout
const SIM_FALLBACK_ID: [u8; 3] = [0xFF, 0x00, 0x00];

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Path to a `/dev/spidevB.C` device with an SPI-NAND chip behind it
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    spidev: Option<PathBuf>,

    /// SPI clock rate for the spidev device
    #[cfg(target_os = "linux")]
    #[clap(long, default_value_t = 10_000_000, requires = "spidev")]
    speed_hz: u32,

    /// SPI mode (0-3) for the spidev device
    #[cfg(target_os = "linux")]
    #[clap(long, default_value_t = 0, requires = "spidev")]
    mode: u8,

    /// Layout of the SPI-NAND to simulate
    #[clap(long, group = "nand-options")]
    sim_layout: Option<NandLayout>,

    /// Path to the raw image (data and OOB of every page) backing the simulated chip
    #[clap(long, requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Write back the image file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,

    /// Give the simulated chip a factory bad-block marker on this block (repeatable)
    #[clap(long, requires = "sim_layout")]
    sim_bad: Vec<u32>,
}

impl NandOptions {
    fn open(&self, config: SpinandConfig) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let id = ids::CHIPS
                .iter()
                .find(|chip| chip.layout == layout)
                .map_or(&SIM_FALLBACK_ID[..], |chip| chip.id);

            let mut sim = SimSpiNand::new(layout, id);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }
            for &block in &self.sim_bad {
                sim = sim.factory_bad(block)?;
            }

            // The simulated chip may not be in the ID table
            let config = SpinandConfig {
                layout: config.layout.or(Some(layout)),
                ..config
            };

            NandImpl::Sim(SpiNand::attach(sim, config)?)
        } else {
            #[cfg(target_os = "linux")]
            {
                let Some(path) = &self.spidev else {
                    unreachable!()
                };

                let bus = Spidev::open(path, self.mode, self.speed_hz)?;
                NandImpl::Spidev(SpiNand::attach(bus, config)?)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(nand) = nand {
                    nand.detach().save(&mut BufWriter::new(File::create(path)?))?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SpiNand<SimSpiNand>),

    #[cfg(target_os = "linux")]
    Spidev(SpiNand<Spidev>),
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chip's ID and layout
    Info,

    /// Re-read every block's bad-block marker and list the bad blocks
    Scan,

    /// Print what the bad-block table knows about a block, probing it if needed
    Query { block: u32 },

    /// Retire a block: erase it, clear its markers, and record it in the bad-block table
    MarkBad { block: u32 },

    /// Erase a block
    Erase { block: u32 },

    /// Hex-dump one page
    Read {
        block: u32,
        page: u32,

        /// Also dump the page's OOB area
        #[clap(long)]
        oob: bool,
    },

    /// Write the data area of every block to a file, filling in for bad blocks
    Dump { output: PathBuf },
}

impl Command {
    fn execute(self, nand: &mut NandImpl) -> Result<()> {
        match nand {
            NandImpl::Sim(nand) => self.run(nand),

            #[cfg(target_os = "linux")]
            NandImpl::Spidev(nand) => self.run(nand),
        }
    }

    fn run<B: SpiBus>(self, nand: &mut SpiNand<B>) -> Result<()> {
        let layout = nand.layout();

        match self {
            Command::Info => {
                println!("ID:      {:02X?}", nand.id());
                println!("Part:    {}", nand.name().unwrap_or("(not in ID table)"));
                println!(
                    "Layout:  {}x{}x{}x{}+{}",
                    layout.dies,
                    layout.blocks_per_die,
                    layout.pages_per_block,
                    layout.bytes_per_page,
                    layout.oob_bytes
                );
                println!(
                    "BBT:     {} bad, {} not probed",
                    nand.bbt().count_bad(),
                    nand.bbt().count_unmarked()
                );
            }

            Command::Scan => {
                let bad = nand.scan_bbt()?;
                for block in nand.bbt().bad_blocks() {
                    println!("{block:6} bad");
                }
                println!("{bad} of {} blocks bad", layout.blocks());
            }

            Command::Query { block } => {
                if nand.bbt().query(block)? == BlockStatus::NotMarked {
                    nand.is_bad(block)?;
                }
                println!("{block}: {:?}", nand.bbt().query(block)?);
            }

            Command::MarkBad { block } => nand.mark_bad(block)?,

            Command::Erase { block } => {
                anyhow::ensure!(!nand.is_bad(block)?, "block {block} is bad");
                nand.erase_block(block)?;
            }

            Command::Read { block, page, oob } => {
                let mut data = vec![0; layout.bytes_per_page];
                let mut spare = vec![0; layout.oob_bytes];

                let ecc = nand.read_page(block, page, &mut data, oob.then_some(&mut spare[..]))?;
                log::info!("ECC: {ecc:?}");

                hexdump(&data, 0)?;
                if oob {
                    hexdump(&spare, layout.bytes_per_page)?;
                }
            }

            Command::Dump { output } => {
                let mut file = BufWriter::new(File::create(output)?);
                dump(nand, &mut file)?;
                file.flush()?;
            }
        };

        Ok(())
    }
}

/// Print `bytes` 16 to a line, labelled with their column starting at `base`
fn hexdump(bytes: &[u8], base: usize) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for (i, line) in bytes.chunks(16).enumerate() {
        write!(out, "{:04x}:", base + i * 16)?;
        for byte in line {
            write!(out, " {byte:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Logs to stderr
struct StderrLogger(LevelFilter);

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.0
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let prefix = match record.level() {
                Level::Error => "error",
                Level::Warn => "warning",
                Level::Info => "info",
                Level::Debug => "debug",
                Level::Trace => "trace",
            };
            eprintln!("{prefix}: {}", record.args());
        }
    }

    fn flush(&self) {}
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The SPI-NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// Override the layout from the ID table, e.g. "1024x64x2048+64"
    #[clap(long)]
    layout: Option<NandLayout>,

    /// Hold the bus exclusively for each multi-part message
    #[clap(long)]
    atomic: bool,

    /// Don't probe every block while attaching; blocks are probed as they are first used
    #[clap(long)]
    no_scan: bool,

    /// More log output (repeatable)
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// The command to run against this SPI-NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_boxed_logger(Box::new(StderrLogger(level)))?;
    log::set_max_level(level);

    let config = SpinandConfig {
        layout: args.layout,
        atomic: args.atomic,
        scan: !args.no_scan,
        ..Default::default()
    };

    let mut nand = args.nand.open(config)?;
    args.cmd.execute(&mut nand)?;
    args.nand.cleanup(nand)?;
    Ok(())
}
