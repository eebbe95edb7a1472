//! SPI bus implementation over the Linux spidev interface

use super::{SpiBus, SpiError, Transfer};

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

/// An SPI device exposed through an open /dev/spidevB.C file
///
/// spidev has no way to lock the bus against other users of the controller, so helpers built on
/// this bus should not be marked atomic.
#[derive(Debug)]
pub struct Spidev {
    file: File,
    speed_hz: u32,
}

impl Spidev {
    /// Open a spidev device by path (e.g. "/dev/spidev0.0"), configuring its SPI mode (0-3) and
    /// maximum clock rate
    pub fn open<P: AsRef<Path>>(path: P, mode: u8, speed_hz: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(mode <= 3, "SPI mode {mode} is not one of 0-3");

        let file = File::options().read(true).write(true).open(path)?;
        unsafe {
            ioctl::wr_mode(file.as_raw_fd(), &mode)?;
            ioctl::wr_max_speed_hz(file.as_raw_fd(), &speed_hz)?;
        }

        Ok(Self { file, speed_hz })
    }
}

impl SpiBus for Spidev {
    fn transfer(&mut self, xfers: &mut [Transfer<'_>]) -> Result<(), SpiError> {
        let mut message = Vec::with_capacity(xfers.len());
        for xfer in xfers.iter_mut() {
            let len = u32::try_from(xfer.len).map_err(|_| SpiError::Length { len: xfer.len })?;
            message.push(ioctl::spi_ioc_transfer {
                tx_buf: xfer.tx.map_or(0, |tx| tx.as_ptr() as u64),
                rx_buf: xfer.rx.as_mut().map_or(0, |rx| rx.as_mut_ptr() as u64),
                len,
                speed_hz: self.speed_hz,
                ..Default::default()
            });
        }

        // The kernel reads and writes through the raw pointers above, which stay borrowed from
        // `xfers` until this call returns.
        unsafe {
            ioctl::message(self.file.as_raw_fd(), &message)?;
        }

        Ok(())
    }
}

mod ioctl {
    //! The spidev ioctls, from linux/spi/spidev.h

    use nix::{ioctl_write_buf, ioctl_write_ptr};

    const SPI_IOC_MAGIC: u8 = b'k';

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct spi_ioc_transfer {
        pub tx_buf: u64,
        pub rx_buf: u64,
        pub len: u32,
        pub speed_hz: u32,
        pub delay_usecs: u16,
        pub bits_per_word: u8,
        pub cs_change: u8,
        pub tx_nbits: u8,
        pub rx_nbits: u8,
        pub word_delay_usecs: u8,
        pub pad: u8,
    }

    // SPI_IOC_MESSAGE(N) encodes the size of the whole transfer array, which is exactly what
    // ioctl_write_buf! computes from the slice length.
    ioctl_write_buf!(message, SPI_IOC_MAGIC, 0, spi_ioc_transfer);

    ioctl_write_ptr!(wr_mode, SPI_IOC_MAGIC, 1, u8);
    ioctl_write_ptr!(wr_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
}
