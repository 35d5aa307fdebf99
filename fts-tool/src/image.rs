//! A flash image file posing as a [BlockDevice].
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Context;
use flash_ts::block::{BlockDevice, BlockError, BlockErrorKind};

use crate::config::ImageArgs;

#[derive(Debug)]
pub enum ImageError {
    Misaligned,
    OutOfBounds,
    /// Program or erase of a block listed as bad.
    BadBlock(u32),
    Io(std::io::Error),
}

impl BlockError for ImageError {
    fn kind(&self) -> BlockErrorKind {
        match self {
            ImageError::Misaligned => BlockErrorKind::Misaligned,
            ImageError::OutOfBounds => BlockErrorKind::OutOfBounds,
            ImageError::BadBlock(_) | ImageError::Io(_) => BlockErrorKind::Other,
        }
    }
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Io(e)
    }
}

/// Image of a flash device, with the program semantics of flash: writes only clear bits.
pub struct ImageFile {
    file: File,
    page_size: usize,
    block_size: usize,
    capacity: usize,
    bad_blocks: BTreeSet<u32>,
}

impl ImageFile {
    /// Create a fully erased image, refusing to overwrite an existing file unless `force` is set.
    pub fn create(args: &ImageArgs, force: bool) -> anyhow::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = options
            .open(&args.path)
            .with_context(|| format!("Failed to create {}", args.path.display()))?;
        file.write_all(&vec![0xff; args.size])?;
        file.flush()?;

        Self::with_file(file, args)
    }

    pub fn open(args: &ImageArgs) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&args.path)
            .with_context(|| format!("Failed to open {}", args.path.display()))?;

        let len = file.metadata()?.len();
        if len != args.size as u64 {
            anyhow::bail!(
                "Image {} is {} bytes, configuration says {}",
                args.path.display(),
                len,
                args.size
            );
        }

        Self::with_file(file, args)
    }

    fn with_file(file: File, args: &ImageArgs) -> anyhow::Result<Self> {
        if args.page_size == 0 || args.block_size == 0 || !args.block_size.is_multiple_of(args.page_size) {
            anyhow::bail!("Block size must be a non-zero multiple of the page size");
        }
        if !args.size.is_multiple_of(args.block_size) {
            anyhow::bail!("Image size must be a multiple of the block size");
        }

        Ok(Self {
            file,
            page_size: args.page_size,
            block_size: args.block_size,
            capacity: args.size,
            bad_blocks: args.bad_blocks.iter().copied().collect(),
        })
    }

    fn check(&self, offset: u32, len: usize, granularity: usize) -> Result<(), ImageError> {
        if !(offset as usize).is_multiple_of(granularity) || !len.is_multiple_of(granularity) {
            return Err(ImageError::Misaligned);
        }
        if offset as usize + len > self.capacity {
            return Err(ImageError::OutOfBounds);
        }
        Ok(())
    }

    fn check_good(&self, offset: u32, len: usize) -> Result<(), ImageError> {
        let first = offset as usize / self.block_size;
        let last = (offset as usize + len.max(1) - 1) / self.block_size;
        match (first..=last).map(|block| block as u32).find(|block| self.bad_blocks.contains(block)) {
            Some(block) => Err(ImageError::BadBlock(block)),
            None => Ok(()),
        }
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

impl BlockDevice for ImageFile {
    type Error = ImageError;

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, buf.len(), self.page_size)?;
        self.read_at(offset, buf)
    }

    async fn write(&mut self, offset: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, buf.len(), self.page_size)?;
        self.check_good(offset, buf.len())?;

        let mut cells = vec![0u8; buf.len()];
        self.read_at(offset, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(buf) {
            *cell &= byte;
        }
        self.write_at(offset, &cells)
    }

    async fn erase(&mut self, block_offset: u32) -> Result<(), Self::Error> {
        self.check(block_offset, self.block_size, self.block_size)?;
        self.check_good(block_offset, self.block_size)?;
        self.write_at(block_offset, &vec![0xff; self.block_size])
    }

    async fn is_bad_block(&mut self, block_offset: u32) -> Result<bool, Self::Error> {
        self.check(block_offset, 0, self.block_size)?;
        Ok(self.bad_blocks.contains(&(block_offset / self.block_size as u32)))
    }
}
