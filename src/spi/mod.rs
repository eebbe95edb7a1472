//! Abstractions over an SPI bus, and transfer helpers built on top of them
//!
//! [SpiBus] is the only thing a backend has to implement. [SpiHelper] wraps a bus with the
//! conveniences the SPI-NAND layer needs: plain writes, write-then-read through a bounce buffer,
//! and "atomic" variants of each that hold the bus exclusively for the whole message when the
//! backend is able to.

use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod spidev;

/// Combined tx+rx lengths up to this size are staged in the shared bounce buffer; anything
/// longer gets a buffer of its own
pub const SPI_BUFSIZ: usize = 32;

/// The shared bounce buffer for small write-then-read operations. Holding the lock serializes all
/// such operations in the process, whichever bus they target.
static BOUNCE: Mutex<[u8; SPI_BUFSIZ]> = Mutex::new([0; SPI_BUFSIZ]);

/// The ways an SPI transfer may fail
#[derive(Error, Debug, Eq, PartialEq, Copy, Clone)]
pub enum SpiError {
    /// The bus rejected or failed the message; the status is passed through untouched
    #[error("SPI transfer failed: {0}")]
    Bus(#[from] Errno),

    #[error("transfer buffers do not match the transfer length of {len} bytes")]
    Length { len: usize },
}

/// One segment of an SPI message
///
/// `tx`, if present, is clocked out; `rx`, if present, receives what is clocked in. When a
/// direction is absent the bus sends filler bytes or discards input, respectively.
#[derive(Debug)]
pub struct Transfer<'a> {
    pub tx: Option<&'a [u8]>,
    pub rx: Option<&'a mut [u8]>,
    pub len: usize,
}

impl<'a> Transfer<'a> {
    /// A transmit-only segment
    pub fn write(tx: &'a [u8]) -> Self {
        Self {
            len: tx.len(),
            tx: Some(tx),
            rx: None,
        }
    }

    /// A receive-only segment
    pub fn read(rx: &'a mut [u8]) -> Self {
        Self {
            len: rx.len(),
            tx: None,
            rx: Some(rx),
        }
    }

    /// A full-duplex segment; `tx` and `rx` must be the same length
    pub fn duplex(tx: &'a [u8], rx: &'a mut [u8]) -> Self {
        Self {
            len: tx.len(),
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    /// Ensure every present buffer agrees with `len`
    pub fn check(&self) -> Result<(), SpiError> {
        let tx_ok = self.tx.map_or(true, |tx| tx.len() == self.len);
        let rx_ok = self.rx.as_ref().map_or(true, |rx| rx.len() == self.len);
        if tx_ok && rx_ok {
            Ok(())
        } else {
            Err(SpiError::Length { len: self.len })
        }
    }
}

/// Represents an SPI controller with a single device attached
pub trait SpiBus {
    /// Run `xfers` as a single message, keeping the chip selected from the first segment to the
    /// last.
    ///
    /// Implementations must accept zero-length segments.
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError>;

    /// Like `transfer`, but with the bus held exclusively for the duration, so that nothing else
    /// may be scheduled onto it between segments.
    ///
    /// Backends that cannot do this keep the default, which is an ordinary `transfer`; the
    /// [SpiHelper] is told up front whether the real thing is available.
    fn transfer_locked(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        self.transfer(xfers)
    }
}

impl<B: SpiBus + ?Sized> SpiBus for &mut B {
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        (**self).transfer(xfers)
    }

    fn transfer_locked(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        (**self).transfer_locked(xfers)
    }
}

/// Where a write-then-read stages its data
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(crate) enum BouncePath {
    /// The shared, lock-protected [SPI_BUFSIZ] buffer
    Shared,

    /// A buffer allocated for this call alone
    Heap,
}

impl BouncePath {
    pub(crate) fn for_len(len: usize) -> Self {
        if len <= SPI_BUFSIZ {
            Self::Shared
        } else {
            Self::Heap
        }
    }
}

/// Transfer helpers over an [SpiBus]
#[derive(Debug)]
pub struct SpiHelper<B> {
    bus: B,

    /// Whether `bus` really implements `transfer_locked`
    atomic: bool,

    /// Set once the non-atomic fallback has been reported
    warned: bool,
}

impl<B: SpiBus> SpiHelper<B> {
    /// Wrap `bus`. `atomic` declares whether the bus can hold itself exclusively for a message;
    /// if not, the `*_atomic` helpers degrade to ordinary transfers.
    pub fn new(bus: B, atomic: bool) -> Self {
        Self {
            bus,
            atomic,
            warned: false,
        }
    }

    /// Can the `*_atomic` helpers actually guarantee atomicity?
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Run a multi-segment message
    pub fn sync(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        self.dispatch(xfers, false)
    }

    /// Run a multi-segment message with the bus held exclusively, if possible
    pub fn sync_atomic(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        self.dispatch(xfers, true)
    }

    /// Send `buf`
    pub fn write(&mut self, buf: &[u8]) -> Result<(), SpiError> {
        self.dispatch(&mut [Transfer::write(buf)], false)
    }

    /// Send `buf` with the bus held exclusively, if possible
    pub fn write_atomic(&mut self, buf: &[u8]) -> Result<(), SpiError> {
        self.dispatch(&mut [Transfer::write(buf)], true)
    }

    /// Send `tx`, then receive `rx.len()` bytes into `rx`, all within one chip-select
    pub fn write_then_read(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError> {
        self.bounce(tx, rx, false)
    }

    /// Like `write_then_read`, with the bus held exclusively, if possible
    pub fn write_then_read_atomic(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SpiError> {
        self.bounce(tx, rx, true)
    }

    fn bounce(&mut self, tx: &[u8], rx: &mut [u8], atomic: bool) -> Result<(), SpiError> {
        let len = tx.len() + rx.len();

        match BouncePath::for_len(len) {
            BouncePath::Shared => {
                // A panic mid-transfer leaves nothing behind in the buffer worth protecting
                let mut shared = BOUNCE.lock().unwrap_or_else(PoisonError::into_inner);
                self.staged(&mut shared[..len], tx, rx, atomic)
            }
            BouncePath::Heap => {
                let mut owned = vec![0u8; len];
                self.staged(&mut owned, tx, rx, atomic)
            }
        }
    }

    /// Run a write-then-read with both directions staged in `buf`
    fn staged(
        &mut self,
        buf: &mut [u8],
        tx: &[u8],
        rx: &mut [u8],
        atomic: bool,
    ) -> Result<(), SpiError> {
        let (tx_buf, rx_buf) = buf.split_at_mut(tx.len());
        tx_buf.copy_from_slice(tx);

        let mut xfers = [Transfer::write(tx_buf), Transfer::read(rx_buf)];
        self.dispatch(&mut xfers, atomic)?;

        rx.copy_from_slice(rx_buf);

        Ok(())
    }

    fn dispatch(&mut self, xfers: &mut [Transfer<'_>], atomic: bool) -> Result<(), SpiError> {
        for xfer in xfers.iter() {
            xfer.check()?;
        }

        match (atomic, self.atomic) {
            (true, true) => self.bus.transfer_locked(xfers),
            (true, false) => {
                if !self.warned {
                    log::warn!("SPI bus cannot lock itself; transfers are not guaranteed atomic");
                    self.warned = true;
                }
                self.bus.transfer(xfers)
            }
            (false, _) => self.bus.transfer(xfers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    /// A bus that answers every receive segment with the bytes of the preceding transmit segment,
    /// each XORed with `key`, and counts how it was called
    #[derive(Debug, Default)]
    struct EchoBus {
        key: u8,
        plain: usize,
        locked: usize,
        fail: Option<Errno>,
        yield_mid_transfer: bool,
    }

    impl EchoBus {
        fn run(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
            if let Some(errno) = self.fail {
                return Err(errno.into());
            }

            let mut last_tx: Vec<u8> = Vec::new();
            for xfer in xfers.iter_mut() {
                if let Some(tx) = xfer.tx {
                    last_tx = tx.to_vec();
                }
                if self.yield_mid_transfer {
                    thread::yield_now();
                }
                if let Some(rx) = xfer.rx.as_mut() {
                    let period = last_tx.len().max(1);
                    for (i, byte) in rx.iter_mut().enumerate() {
                        *byte = last_tx.get(i % period).copied().unwrap_or(0) ^ self.key;
                    }
                }
            }
            Ok(())
        }
    }

    impl SpiBus for EchoBus {
        fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
            self.plain += 1;
            self.run(xfers)
        }

        fn transfer_locked(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
            self.locked += 1;
            self.run(xfers)
        }
    }

    #[test]
    fn test_bounce_path_threshold() {
        assert_eq!(BouncePath::for_len(0), BouncePath::Shared);
        assert_eq!(BouncePath::for_len(SPI_BUFSIZ), BouncePath::Shared);
        assert_eq!(BouncePath::for_len(SPI_BUFSIZ + 1), BouncePath::Heap);
    }

    #[test]
    fn test_write_then_read_both_paths() -> anyhow::Result<()> {
        let mut spi = SpiHelper::new(EchoBus::default(), false);

        // Small: 4 + 8 fits the shared buffer; large: 4 + 60 does not
        let tx = [0x0F, 0x12, 0x34, 0x56];
        let mut small = [0u8; 8];
        let mut large = [0u8; 60];
        assert_eq!(BouncePath::for_len(tx.len() + small.len()), BouncePath::Shared);
        assert_eq!(BouncePath::for_len(tx.len() + large.len()), BouncePath::Heap);

        spi.write_then_read(&tx, &mut small)?;
        spi.write_then_read(&tx, &mut large)?;

        assert_eq!(small, [0x0F, 0x12, 0x34, 0x56, 0x0F, 0x12, 0x34, 0x56]);
        assert_eq!(small[..], large[..small.len()]);
        assert!(large.chunks(4).all(|x| x == tx));

        Ok(())
    }

    #[test]
    fn test_atomic_capability() -> anyhow::Result<()> {
        let mut spi = SpiHelper::new(EchoBus::default(), true);
        spi.write_atomic(&[1, 2, 3])?;
        spi.write_then_read_atomic(&[1], &mut [0; 2])?;
        spi.sync_atomic(&mut [Transfer::write(&[9])])?;
        spi.write(&[4])?;
        assert_eq!((spi.bus().plain, spi.bus().locked), (1, 3));

        // Without the capability, "atomic" requests fall back to ordinary transfers
        let mut spi = SpiHelper::new(EchoBus::default(), false);
        spi.write_atomic(&[1, 2, 3])?;
        spi.write_then_read_atomic(&[1], &mut [0; 2])?;
        assert_eq!((spi.bus().plain, spi.bus().locked), (2, 0));
        assert!(!spi.is_atomic());

        Ok(())
    }

    /// Records every log message along with the thread that emitted it
    struct CaptureLog(Mutex<Vec<(thread::ThreadId, log::Level, String)>>);

    static CAPTURE: CaptureLog = CaptureLog(Mutex::new(Vec::new()));

    impl log::Log for CaptureLog {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            let entry = (
                thread::current().id(),
                record.level(),
                record.args().to_string(),
            );
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry);
        }

        fn flush(&self) {}
    }

    /// How many warnings the current thread has logged
    fn warnings_here() -> usize {
        let me = thread::current().id();
        CAPTURE
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, level, _)| *id == me && *level == log::Level::Warn)
            .count()
    }

    #[test]
    fn test_fallback_warns_once() -> anyhow::Result<()> {
        // A logger can only be installed once per process
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Trace);

        let mut spi = SpiHelper::new(EchoBus::default(), false);
        spi.write(&[1])?;
        assert_eq!(warnings_here(), 0);

        spi.write_atomic(&[1, 2, 3])?;
        spi.write_then_read_atomic(&[1], &mut [0; 2])?;
        spi.sync_atomic(&mut [Transfer::write(&[9])])?;
        assert_eq!(warnings_here(), 1);

        // Each helper reports for itself
        let mut spi = SpiHelper::new(EchoBus::default(), false);
        spi.write_atomic(&[1])?;
        assert_eq!(warnings_here(), 2);

        // A capable bus has nothing to report
        let mut spi = SpiHelper::new(EchoBus::default(), true);
        spi.write_atomic(&[1])?;
        spi.write_then_read_atomic(&[1], &mut [0; 2])?;
        assert_eq!(warnings_here(), 2);

        Ok(())
    }

    #[test]
    fn test_bus_error_passthrough() {
        let bus = EchoBus {
            fail: Some(Errno::EIO),
            ..Default::default()
        };
        let mut spi = SpiHelper::new(bus, false);

        let mut rx = [0xAAu8; 4];
        assert_eq!(
            spi.write_then_read(&[1], &mut rx),
            Err(SpiError::Bus(Errno::EIO))
        );
        // The caller's buffer is untouched on failure
        assert_eq!(rx, [0xAA; 4]);

        assert_eq!(
            spi.write_then_read(&[1], &mut [0; 64]),
            Err(SpiError::Bus(Errno::EIO))
        );

        // The shared buffer is still usable afterwards
        spi.bus_mut().fail = None;
        spi.write_then_read(&[7], &mut rx).unwrap();
        assert_eq!(rx, [7; 4]);
    }

    #[test]
    fn test_length_mismatch() {
        let mut spi = SpiHelper::new(EchoBus::default(), false);
        let mut rx = [0u8; 3];
        let mut xfers = [Transfer {
            tx: Some(&[1u8, 2][..]),
            rx: Some(&mut rx[..]),
            len: 2,
        }];
        assert_eq!(spi.sync(&mut xfers), Err(SpiError::Length { len: 2 }));
        assert_eq!(spi.bus().plain, 0);
    }

    #[test]
    fn test_concurrent_write_then_read() {
        const THREADS: u8 = 8;
        const ROUNDS: usize = 500;

        let barrier = Arc::new(std::sync::Barrier::new(THREADS.into()));
        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let bus = EchoBus {
                        key: id.wrapping_mul(0x1D),
                        yield_mid_transfer: true,
                        ..Default::default()
                    };
                    let mut spi = SpiHelper::new(bus, false);
                    let tx = [id; 12];
                    let expected = [id ^ id.wrapping_mul(0x1D); 12];

                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let mut rx = [0u8; 12];
                        spi.write_then_read(&tx, &mut rx).unwrap();
                        assert_eq!(rx, expected);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker should not panic");
        }
    }
}
