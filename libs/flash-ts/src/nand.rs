//! Raw NAND backend for [BlockDevice].
//!
//! The [NandController] is the page-level interface of a NAND flash controller,
//! [NandBlockDevice] turns it into a byte-addressed [BlockDevice] with bad-block
//! detection based on the factory markers in the spare (OOB) area.
#[cfg(any(test, feature = "_test"))]
pub mod mock;

use crate::block::{BlockDevice, BlockError, BlockErrorKind};

/// Value of a spare byte in an erased page, and of the bad-block marker of a good block.
const GOOD_BLOCK_MARKER: u8 = 0xff;

/// Pages of a block carrying a bad-block marker.
const MARKER_PAGES: [u32; 2] = [0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NandGeometry {
    /// Bytes of main data per page.
    pub page_size: usize,
    /// Bytes of spare area per page.
    pub oob_size: usize,
    pub pages_per_block: usize,
    pub block_count: usize,
}

impl NandGeometry {
    pub const fn block_size(&self) -> usize {
        self.page_size * self.pages_per_block
    }

    pub const fn capacity(&self) -> usize {
        self.block_size() * self.block_count
    }
}

/// Outcome of reading a page through ECC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageRead {
    /// Data was read and corrected.
    Data,
    /// The page is erased. The data buffer was left untouched.
    Erased,
    /// ECC could not correct the page.
    Uncorrectable,
}

#[allow(async_fn_in_trait)]
pub trait NandController {
    type Error: core::fmt::Debug;

    fn geometry(&self) -> NandGeometry;

    /// Read the main data of a page through ECC and the data randomizer.
    ///
    /// Erased pages must be reported as [PageRead::Erased], as running them
    /// through the de-randomizer would turn them into noise.
    async fn read_page(&mut self, page: u32, data: &mut [u8]) -> Result<PageRead, Self::Error>;

    /// Read the first `oob.len()` spare bytes of a page with ECC and the randomizer bypassed.
    async fn read_oob_raw(&mut self, page: u32, oob: &mut [u8]) -> Result<(), Self::Error>;

    async fn program_page(&mut self, page: u32, data: &[u8]) -> Result<(), Self::Error>;

    async fn erase_block(&mut self, block: u32) -> Result<(), Self::Error>;
}

impl<T: NandController + ?Sized> NandController for &mut T {
    type Error = T::Error;

    fn geometry(&self) -> NandGeometry {
        T::geometry(self)
    }

    async fn read_page(&mut self, page: u32, data: &mut [u8]) -> Result<PageRead, Self::Error> {
        T::read_page(self, page, data).await
    }

    async fn read_oob_raw(&mut self, page: u32, oob: &mut [u8]) -> Result<(), Self::Error> {
        T::read_oob_raw(self, page, oob).await
    }

    async fn program_page(&mut self, page: u32, data: &[u8]) -> Result<(), Self::Error> {
        T::program_page(self, page, data).await
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), Self::Error> {
        T::erase_block(self, block).await
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NandError<E> {
    Misaligned,
    OutOfBounds,
    /// ECC failed on the given page.
    Uncorrectable(u32),
    Controller(E),
}

impl<E: core::fmt::Debug> BlockError for NandError<E> {
    fn kind(&self) -> BlockErrorKind {
        match self {
            NandError::Misaligned => BlockErrorKind::Misaligned,
            NandError::OutOfBounds => BlockErrorKind::OutOfBounds,
            NandError::Uncorrectable(_) => BlockErrorKind::Corrupted,
            NandError::Controller(_) => BlockErrorKind::Other,
        }
    }
}

pub struct NandBlockDevice<C> {
    ctrl: C,
    geometry: NandGeometry,
}

impl<C: NandController> NandBlockDevice<C> {
    pub fn new(ctrl: C) -> Self {
        let geometry = ctrl.geometry();
        Self { ctrl, geometry }
    }

    pub fn into_inner(self) -> C {
        self.ctrl
    }

    /// First page index of a page-aligned byte range.
    fn first_page(&self, offset: u32, len: usize) -> Result<u32, NandError<C::Error>> {
        let page_size = self.geometry.page_size;
        if !(offset as usize).is_multiple_of(page_size) || !len.is_multiple_of(page_size) {
            return Err(NandError::Misaligned);
        }
        if offset as usize + len > self.geometry.capacity() {
            return Err(NandError::OutOfBounds);
        }
        Ok((offset as usize / page_size) as u32)
    }

    fn block_index(&self, block_offset: u32) -> Result<u32, NandError<C::Error>> {
        let block_size = self.geometry.block_size();
        if !(block_offset as usize).is_multiple_of(block_size) {
            return Err(NandError::Misaligned);
        }
        if block_offset as usize >= self.geometry.capacity() {
            return Err(NandError::OutOfBounds);
        }
        Ok((block_offset as usize / block_size) as u32)
    }
}

impl<C: NandController> BlockDevice for NandBlockDevice<C> {
    type Error = NandError<C::Error>;

    fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    fn page_size(&self) -> usize {
        self.geometry.page_size
    }

    fn capacity(&self) -> usize {
        self.geometry.capacity()
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let first = self.first_page(offset, buf.len())?;
        for (i, data) in buf.chunks_exact_mut(self.geometry.page_size).enumerate() {
            let page = first + i as u32;
            match self.ctrl.read_page(page, data).await.map_err(NandError::Controller)? {
                PageRead::Data => {}
                PageRead::Erased => data.fill(0xff),
                PageRead::Uncorrectable => return Err(NandError::Uncorrectable(page)),
            }
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let first = self.first_page(offset, buf.len())?;
        for (i, data) in buf.chunks_exact(self.geometry.page_size).enumerate() {
            self.ctrl
                .program_page(first + i as u32, data)
                .await
                .map_err(NandError::Controller)?;
        }
        Ok(())
    }

    async fn erase(&mut self, block_offset: u32) -> Result<(), Self::Error> {
        let block = self.block_index(block_offset)?;
        self.ctrl.erase_block(block).await.map_err(NandError::Controller)
    }

    async fn is_bad_block(&mut self, block_offset: u32) -> Result<bool, Self::Error> {
        let block = self.block_index(block_offset)?;
        let pages_per_block = self.geometry.pages_per_block;
        let first_page = block * pages_per_block as u32;

        for page in MARKER_PAGES.into_iter().filter(|p| (*p as usize) < pages_per_block) {
            let mut marker = [0u8; 1];
            self.ctrl
                .read_oob_raw(first_page + page, &mut marker)
                .await
                .map_err(NandError::Controller)?;
            if marker[0] != GOOD_BLOCK_MARKER {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::mock::MockNand;

    type Nand = MockNand<4, 4, 64>;

    #[test]
    fn geometry() {
        let dev = NandBlockDevice::new(Nand::new());
        assert_eq!(dev.page_size(), 64);
        assert_eq!(dev.block_size(), 256);
        assert_eq!(dev.capacity(), 1024);
    }

    #[test]
    fn erased_pages_read_as_ff() {
        let mut nand = Nand::new();
        let mut dev = NandBlockDevice::new(&mut nand);
        embassy_futures::block_on(async {
            let mut buf = [0u8; 128];
            dev.read(256, &mut buf).await.unwrap();
            assert!(buf.iter().all(|b| *b == 0xff));

            dev.write(256, &[0x5a; 64]).await.unwrap();
            dev.read(256, &mut buf).await.unwrap();
            assert!(buf[..64].iter().all(|b| *b == 0x5a));
            assert!(buf[64..].iter().all(|b| *b == 0xff));
        });
    }

    #[test]
    fn alignment_and_bounds() {
        let mut nand = Nand::new();
        let mut dev = NandBlockDevice::new(&mut nand);
        embassy_futures::block_on(async {
            let mut buf = [0u8; 64];
            assert_eq!(dev.read(32, &mut buf).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.write(0, &buf[..16]).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.erase(64).await.unwrap_err().kind(), BlockErrorKind::Misaligned);
            assert_eq!(dev.read(1024, &mut buf).await.unwrap_err().kind(), BlockErrorKind::OutOfBounds);
            assert_eq!(dev.erase(1024).await.unwrap_err().kind(), BlockErrorKind::OutOfBounds);
        });
    }

    #[test]
    fn bad_block_markers() {
        let mut nand = Nand::new();
        nand.mark_bad(1);
        nand.mark_bad_second_page(3);

        let mut dev = NandBlockDevice::new(&mut nand);
        embassy_futures::block_on(async {
            assert!(!dev.is_bad_block(0).await.unwrap());
            assert!(dev.is_bad_block(256).await.unwrap());
            assert!(!dev.is_bad_block(512).await.unwrap());
            assert!(dev.is_bad_block(768).await.unwrap());
        });
    }

    #[test]
    fn erase_is_idempotent() {
        let mut nand = Nand::new();
        let mut dev = NandBlockDevice::new(&mut nand);
        embassy_futures::block_on(async {
            dev.write(0, &[0u8; 256]).await.unwrap();
            dev.erase(0).await.unwrap();
            dev.erase(0).await.unwrap();

            let mut buf = [0u8; 256];
            dev.read(0, &mut buf).await.unwrap();
            assert!(buf.iter().all(|b| *b == 0xff));

            // Pages are programmable again after the erase.
            dev.write(0, &[0x11; 64]).await.unwrap();
        });
    }

    #[test]
    fn uncorrectable_page() {
        let mut nand = Nand::new();
        nand.make_uncorrectable(5);

        let mut dev = NandBlockDevice::new(&mut nand);
        embassy_futures::block_on(async {
            let mut buf = [0u8; 64];
            let err = dev.read(5 * 64, &mut buf).await.unwrap_err();
            assert!(matches!(err, NandError::Uncorrectable(5)));
            assert_eq!(err.kind(), BlockErrorKind::Corrupted);
        });
    }
}
