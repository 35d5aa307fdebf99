//! Uniform block interface consumed by the store.
#[cfg(any(test, feature = "_test"))]
pub mod mock;

use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

/// Coarse classification of a device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockErrorKind {
    /// Offset or length not aligned to the granularity of the medium.
    Misaligned,
    /// Operation beyond the end of the device.
    OutOfBounds,
    /// The device works, but the data at the location cannot be recovered (e.g. uncorrectable ECC).
    Corrupted,
    /// Any other failure.
    Other,
}

pub trait BlockError: core::fmt::Debug {
    fn kind(&self) -> BlockErrorKind;
}

/// A raw storage medium, addressed in bytes from the start of the device.
///
/// `read` and `write` only accept offsets and lengths that are a multiple of [BlockDevice::page_size],
/// `erase` only accepts offsets that are a multiple of [BlockDevice::block_size].
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    type Error: BlockError;

    /// Size of an erase block.
    fn block_size(&self) -> usize;

    /// Smallest unit that can be read or written.
    fn page_size(&self) -> usize;

    /// Size of the whole device.
    fn capacity(&self) -> usize;

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    async fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), Self::Error>;

    /// Erase the block starting at `block_offset`. Erasing an erased block succeeds.
    async fn erase(&mut self, block_offset: u32) -> Result<(), Self::Error>;

    async fn is_bad_block(&mut self, block_offset: u32) -> Result<bool, Self::Error>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    type Error = T::Error;

    fn block_size(&self) -> usize {
        T::block_size(self)
    }

    fn page_size(&self) -> usize {
        T::page_size(self)
    }

    fn capacity(&self) -> usize {
        T::capacity(self)
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        T::read(self, offset, buf).await
    }

    async fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), Self::Error> {
        T::write(self, offset, buf).await
    }

    async fn erase(&mut self, block_offset: u32) -> Result<(), Self::Error> {
        T::erase(self, block_offset).await
    }

    async fn is_bad_block(&mut self, block_offset: u32) -> Result<bool, Self::Error> {
        T::is_bad_block(self, block_offset).await
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NorBlockError<E> {
    Misaligned,
    Flash(E),
}

impl<E: NorFlashError> BlockError for NorBlockError<E> {
    fn kind(&self) -> BlockErrorKind {
        match self {
            NorBlockError::Misaligned => BlockErrorKind::Misaligned,
            NorBlockError::Flash(e) => match e.kind() {
                NorFlashErrorKind::NotAligned => BlockErrorKind::Misaligned,
                NorFlashErrorKind::OutOfBounds => BlockErrorKind::OutOfBounds,
                _ => BlockErrorKind::Other,
            },
        }
    }
}

/// [BlockDevice] over NOR flash or an eMMC partition exposed as [NorFlash].
///
/// Such media have no bad blocks.
pub struct NorBlockDevice<T> {
    inner: T,
}

impl<T: NorFlash> NorBlockDevice<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn check_aligned(offset: u32, len: usize, granularity: usize) -> Result<(), NorBlockError<T::Error>> {
        if (offset as usize).is_multiple_of(granularity) && len.is_multiple_of(granularity) {
            Ok(())
        } else {
            Err(NorBlockError::Misaligned)
        }
    }
}

impl<T: NorFlash> BlockDevice for NorBlockDevice<T> {
    type Error = NorBlockError<T::Error>;

    fn block_size(&self) -> usize {
        T::ERASE_SIZE
    }

    fn page_size(&self) -> usize {
        T::READ_SIZE.max(T::WRITE_SIZE)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        Self::check_aligned(offset, buf.len(), self.page_size())?;
        self.inner.read(offset, buf).await.map_err(NorBlockError::Flash)
    }

    async fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), Self::Error> {
        Self::check_aligned(offset, buf.len(), self.page_size())?;
        self.inner.write(offset, buf).await.map_err(NorBlockError::Flash)
    }

    async fn erase(&mut self, block_offset: u32) -> Result<(), Self::Error> {
        Self::check_aligned(block_offset, 0, T::ERASE_SIZE)?;
        self.inner
            .erase(block_offset, block_offset + T::ERASE_SIZE as u32)
            .await
            .map_err(NorBlockError::Flash)
    }

    async fn is_bad_block(&mut self, _block_offset: u32) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mock::MockNor;

    #[test]
    fn nor_geometry() {
        let dev = NorBlockDevice::new(MockNor::<4, 4, 256>::new());
        assert_eq!(dev.block_size(), 1024);
        assert_eq!(dev.page_size(), 4);
        assert_eq!(dev.capacity(), 4096);
    }

    #[test]
    fn nor_alignment() {
        let mut dev = NorBlockDevice::new(MockNor::<4, 4, 256>::new());
        embassy_futures::block_on(async {
            let mut buf = [0u8; 8];
            assert_eq!(dev.read(2, &mut buf).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.read(0, &mut buf[..3]).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.write(6, &buf).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.erase(512).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.read(4096, &mut buf).await.unwrap_err().kind(), BlockErrorKind::OutOfBounds);
        });
    }

    #[test]
    fn nor_erase_is_idempotent() {
        let mut dev = NorBlockDevice::new(MockNor::<4, 4, 256>::new());
        embassy_futures::block_on(async {
            dev.write(1024, &[0x12, 0x34, 0x56, 0x78]).await.unwrap();
            dev.erase(1024).await.unwrap();
            dev.erase(1024).await.unwrap();

            let mut buf = [0u8; 1024];
            dev.read(1024, &mut buf).await.unwrap();
            assert!(buf.iter().all(|b| *b == 0xff));
            assert!(!dev.is_bad_block(1024).await.unwrap());
        });
    }
}
