use std::vec::Vec;

use embedded_storage_async::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// In-memory NOR flash with `SECTORS` erase sectors of `SECTOR_WORDS` words of `WORD` bytes.
///
/// Programming only clears bits, like real NOR cells.
#[derive(Debug, Clone)]
pub struct MockNor<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> {
    data: Vec<u8>,
    /// Number of sector erasures that will fail before erasing works again.
    pub erase_failures: u32,
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> Default
    for MockNor<SECTORS, WORD, SECTOR_WORDS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> MockNor<SECTORS, WORD, SECTOR_WORDS> {
    const SECTOR_BYTES: usize = WORD * SECTOR_WORDS;
    const CAPACITY_BYTES: usize = SECTORS * Self::SECTOR_BYTES;

    /// Create a fully erased flash.
    pub fn new() -> Self {
        Self {
            data: vec![u8::MAX; Self::CAPACITY_BYTES],
            erase_failures: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn range(offset: u32, len: usize) -> Result<core::ops::Range<usize>, MockNorError> {
        let offset = offset as usize;
        if offset + len > Self::CAPACITY_BYTES {
            Err(MockNorError::OutOfBounds)
        } else {
            Ok(offset..offset + len)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockNorError {
    OutOfBounds,
    NotAligned,
    /// An injected erase failure at the given address.
    EraseFailed(u32),
}

impl NorFlashError for MockNorError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MockNorError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MockNorError::NotAligned => NorFlashErrorKind::NotAligned,
            MockNorError::EraseFailed(_) => NorFlashErrorKind::Other,
        }
    }
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> ErrorType
    for MockNor<SECTORS, WORD, SECTOR_WORDS>
{
    type Error = MockNorError;
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> ReadNorFlash
    for MockNor<SECTORS, WORD, SECTOR_WORDS>
{
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = Self::range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY_BYTES
    }
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> NorFlash
    for MockNor<SECTORS, WORD, SECTOR_WORDS>
{
    const WRITE_SIZE: usize = WORD;

    const ERASE_SIZE: usize = Self::SECTOR_BYTES;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to || !(from as usize).is_multiple_of(Self::SECTOR_BYTES) || !(to as usize).is_multiple_of(Self::SECTOR_BYTES) {
            return Err(MockNorError::NotAligned);
        }
        let range = Self::range(from, (to - from) as usize)?;

        if let Some(next) = self.erase_failures.checked_sub(1) {
            self.erase_failures = next;
            return Err(MockNorError::EraseFailed(from));
        }

        self.data[range].fill(u8::MAX);
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if !(offset as usize).is_multiple_of(WORD) || !bytes.len().is_multiple_of(WORD) {
            return Err(MockNorError::NotAligned);
        }
        let range = Self::range(offset, bytes.len())?;

        for (cell, byte) in self.data[range].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }
}

impl<const SECTORS: usize, const WORD: usize, const SECTOR_WORDS: usize> MultiwriteNorFlash
    for MockNor<SECTORS, WORD, SECTOR_WORDS>
{
}
