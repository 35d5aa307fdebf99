//! The flash translation store engine.
//!
//! The partition is treated as a circular array of fixed-size chunks. Every
//! update writes a complete new record, with a version one higher than any
//! before it, to the next usable chunk. The previous record is never touched
//! until the new one has been read back successfully, so after a power loss the
//! scan for the highest valid version always finds either the old or the new record.
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use defmt_or_log::{debug, info, warn};

use crate::block::{BlockDevice, BlockError, BlockErrorKind};
use crate::record::{self, ParseResult, HDR_SIZE, MAX_DATA_SIZE, MAX_SIZE};
use crate::Error;

/// Tunables of a [FlashTs].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Stride at which records are placed in the partition.
    ///
    /// Must be a multiple of the page size, and either a multiple or a divisor of the erase block size.
    pub chunk_size: usize,

    /// Number of leading erase blocks of the device holding raw boot images.
    ///
    /// These blocks precede the region in which the OOB metadata is maintained,
    /// so their bad-block markers are meaningless and never checked.
    pub reserved_blocks: usize,

    /// How often a failed flash operation is retried.
    pub retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: MAX_SIZE,
            reserved_blocks: 0,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreState {
    /// No valid record was found. An empty record is kept in memory until the first update.
    Empty,
    /// The cache reflects the latest durable record.
    Ready,
    /// No writable chunk is left in the partition. Updates fail with [Error::NoSpace].
    Unrecoverable,
}

/// Location and version of the durable record backing the cache.
#[derive(Debug, Clone, Copy)]
struct Active {
    offset: usize,
    version: u32,
}

/// A chunk chosen to receive the next record.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    /// The chunk starts an erase block, which needs erasing before use.
    erase: bool,
}

/// Outcome of reading a single chunk while scanning.
enum Scan {
    /// Still erased.
    Blank,
    /// Holds no record header.
    Invalid,
    /// The header cannot be read back, so the version of a record in it is unknown.
    Unreadable,
    /// A record header, but the record itself failed validation.
    Broken { version: u32 },
    Valid {
        version: u32,
        entries: BTreeMap<String, String>,
    },
}

/// Key-value store persisted in a flash partition.
pub struct FlashTs<D> {
    device: D,
    config: Config,
    base: u32,
    size: usize,
    block_size: usize,
    page_size: usize,
    state: StoreState,
    active: Option<Active>,
    /// Highest version ever handed out, whether or not it became durable.
    issued: u32,
    /// Chunks whose header could not be read during the last scan.
    ///
    /// A record hiding in them may read back fine later on, with a version unknown to us.
    unreadable: Vec<usize>,
    cache: BTreeMap<String, String>,
    /// Chunk image of the record being written.
    stage: Vec<u8>,
    /// Readback of chunks, both while scanning and to verify writes.
    verify: Vec<u8>,
}

impl<D: BlockDevice> FlashTs<D> {
    /// Bind to the partition of `size` bytes at `base` of `device`, and scan it for the latest record.
    pub async fn init(device: D, base: u32, size: usize, config: Config) -> Result<Self, Error<D::Error>> {
        let block_size = device.block_size();
        let page_size = device.page_size();
        let chunk_size = config.chunk_size;

        if block_size == 0 || page_size == 0 || chunk_size == 0 {
            return Err(Error::Misaligned);
        }
        if !chunk_size.is_multiple_of(page_size)
            || !(block_size.is_multiple_of(chunk_size) || chunk_size.is_multiple_of(block_size))
            || !(base as usize).is_multiple_of(block_size)
            || !size.is_multiple_of(block_size)
            || !size.is_multiple_of(chunk_size)
        {
            return Err(Error::Misaligned);
        }
        // Device addresses are 32 bits wide.
        let end = base as u64 + size as u64;
        if end > device.capacity() as u64 || end > u32::MAX as u64 + 1 {
            return Err(Error::OutOfBounds);
        }
        if chunk_size <= HDR_SIZE || size / block_size < 2 || size / chunk_size < 2 {
            return Err(Error::PartitionTooSmall);
        }

        let mut store = Self {
            device,
            config,
            base,
            size,
            block_size,
            page_size,
            state: StoreState::Empty,
            active: None,
            issued: 0,
            unreadable: Vec::new(),
            cache: BTreeMap::new(),
            stage: alloc::vec![0; chunk_size],
            verify: alloc::vec![0; chunk_size],
        };
        store.rescan().await?;
        Ok(store)
    }

    /// Walk through every chunk of the partition and load the valid record with the highest version.
    ///
    /// If none is found the store starts out empty.
    ///
    /// New versions continue after the highest one found in any record header, valid or not.
    pub async fn rescan(&mut self) -> Result<(), Error<D::Error>> {
        let mut best: Option<(Active, BTreeMap<String, String>)> = None;
        let mut highest = 0;
        let mut unreadable = Vec::new();

        for index in 0..self.chunk_count() {
            let offset = index * self.config.chunk_size;
            if self.is_bad_slot(offset).await? {
                debug!("Skipping chunk at {} in a bad block", offset);
                continue;
            }

            match self.load_slot(offset).await? {
                Scan::Blank | Scan::Invalid => {}
                Scan::Unreadable => {
                    warn!("Header of chunk at {} is unreadable", offset);
                    unreadable.push(offset);
                }
                Scan::Broken { version } => highest = highest.max(version),
                Scan::Valid { version, entries } => {
                    highest = highest.max(version);
                    if best.as_ref().is_none_or(|(active, _)| version > active.version) {
                        best = Some((Active { offset, version }, entries));
                    }
                }
            }
        }

        self.issued = highest;
        self.unreadable = unreadable;
        match best {
            Some((active, entries)) => {
                info!("Loaded record version {} from offset {}", active.version, active.offset);
                self.active = Some(active);
                self.cache = entries;
                self.state = StoreState::Ready;
            }
            None => {
                info!("No valid record found, starting empty");
                self.active = None;
                self.cache = BTreeMap::new();
                self.state = StoreState::Empty;
            }
        }
        Ok(())
    }

    /// Look up a key in the cache. Never touches the flash.
    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).cloned()
    }

    /// All key-value pairs of the current record, ordered by key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cache.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Store `value` under `key`, overwriting any previous value.
    ///
    /// On any error the store is left exactly as it was before the call.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), Error<D::Error>> {
        record::validate_key(key)?;
        record::validate_value(value)?;

        if self.cache.get(key).is_some_and(|v| v == value) {
            return Ok(());
        }

        let mut entries = self.cache.clone();
        entries.insert(key.to_string(), value.to_string());
        self.commit(entries).await
    }

    /// Remove `key`, yielding whether it was present.
    pub async fn remove(&mut self, key: &str) -> Result<bool, Error<D::Error>> {
        if !self.cache.contains_key(key) {
            return Ok(false);
        }

        let mut entries = self.cache.clone();
        entries.remove(key);
        self.commit(entries).await?;
        Ok(true)
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Version of the current record, 0 while empty.
    pub fn version(&self) -> u32 {
        self.active.map_or(0, |active| active.version)
    }

    /// Offset of the current record within the partition, if any.
    pub fn offset(&self) -> Option<usize> {
        self.active.map(|active| active.offset)
    }

    /// Bytes available for encoded key-value data.
    pub fn capacity(&self) -> usize {
        (self.config.chunk_size - HDR_SIZE).min(MAX_DATA_SIZE)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn chunk_count(&self) -> usize {
        self.size / self.config.chunk_size
    }

    fn address(&self, offset: usize) -> u32 {
        self.base + offset as u32
    }

    /// Erase block indices, relative to the partition, covered by the chunk at `offset`.
    fn slot_blocks(&self, offset: usize) -> core::ops::RangeInclusive<usize> {
        offset / self.block_size..=(offset + self.config.chunk_size - 1) / self.block_size
    }

    /// Whether the chunks at `a` and `b` share an erase block.
    fn shares_block(&self, a: usize, b: usize) -> bool {
        self.slot_blocks(a).contains(&(b / self.block_size))
    }

    fn overlaps_active(&self, offset: usize) -> bool {
        self.active.is_some_and(|active| self.shares_block(offset, active.offset))
    }

    fn overlaps_unreadable(&self, offset: usize) -> bool {
        self.unreadable.iter().any(|unreadable| self.shares_block(offset, *unreadable))
    }

    /// Write the record holding `entries` and make it the current one.
    async fn commit(&mut self, entries: BTreeMap<String, String>) -> Result<(), Error<D::Error>> {
        if self.state == StoreState::Unrecoverable {
            return Err(Error::NoSpace);
        }

        let capacity = self.capacity();
        self.stage.fill(0);
        let len = record::encode(
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &mut self.stage[HDR_SIZE..HDR_SIZE + capacity],
        )?;

        // Versions are never reused, also not those of attempts that failed verification.
        let Some(version) = self.issued.checked_add(1) else {
            warn!("Record versions are exhausted");
            self.state = StoreState::Unrecoverable;
            return Err(Error::NoSpace);
        };
        record::seal(&mut self.stage, version, len);

        self.retire_unreadable().await;

        let mut after = self.active.map(|active| active.offset);
        let mut last_error = Error::WriteVerifyFailed;
        for _ in 0..2 {
            let slot = match self.find_slot(after).await {
                Ok(slot) => slot,
                Err(Error::NoSpace) => {
                    warn!("No writable chunk left in the partition");
                    self.state = StoreState::Unrecoverable;
                    return Err(Error::NoSpace);
                }
                Err(e) => return Err(e),
            };

            if slot.erase {
                self.erase_slot(slot.offset).await?;
            }

            self.issued = version;
            match self.program_and_verify(slot.offset).await {
                Ok(()) => {
                    debug!("Committed record version {} at offset {}", version, slot.offset);
                    self.active = Some(Active {
                        offset: slot.offset,
                        version,
                    });
                    self.cache = entries;
                    self.state = StoreState::Ready;
                    // The blocks shared with the previous record are free to go now.
                    self.retire_unreadable().await;
                    return Ok(());
                }
                Err(Error::Misaligned) => return Err(Error::Misaligned),
                Err(e) => {
                    warn!("Failed to commit record at offset {}, moving on", slot.offset);
                    last_error = e;
                    after = Some(slot.offset);
                }
            }
        }

        Err(last_error)
    }

    /// Find the first usable chunk following `after`, wrapping around the partition once.
    async fn find_slot(&mut self, after: Option<usize>) -> Result<Slot, Error<D::Error>> {
        let chunk_size = self.config.chunk_size;
        let count = self.chunk_count();
        let start = after.map_or(0, |offset| offset / chunk_size + 1);

        for i in 0..count {
            let offset = ((start + i) % count) * chunk_size;

            if self.is_bad_slot(offset).await? {
                debug!("Skipping chunk at {} in a bad block", offset);
                continue;
            }

            // A record reappearing next to this one could carry the same version.
            if self.overlaps_unreadable(offset) {
                continue;
            }

            if offset.is_multiple_of(self.block_size) {
                // Erasing here would take the current record with it.
                if self.overlaps_active(offset) {
                    continue;
                }
                return Ok(Slot { offset, erase: true });
            }

            // Chunks inside an erase block can only be used while still erased.
            if self.is_blank_slot(offset).await? {
                return Ok(Slot { offset, erase: false });
            }
        }

        Err(Error::NoSpace)
    }

    async fn is_bad_slot(&mut self, offset: usize) -> Result<bool, Error<D::Error>> {
        for block in self.slot_blocks(offset) {
            let address = self.address(block * self.block_size);
            // Raw boot image blocks carry no bad-block markers.
            if (address as usize / self.block_size) < self.config.reserved_blocks {
                continue;
            }

            let mut attempt = 0;
            let bad = loop {
                match self.device.is_bad_block(address).await {
                    Ok(bad) => break bad,
                    Err(e) if attempt < self.config.retries && e.kind() != BlockErrorKind::Misaligned => {
                        warn!("Bad block check of {} failed, retrying", address);
                        attempt += 1;
                    }
                    Err(e) => return Err(Error::device(e)),
                }
            };
            if bad {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read `len` bytes of the chunk at `offset`, starting at `start`, into the verify buffer.
    ///
    /// Yields `false` if the data is unrecoverable.
    async fn read_slot(&mut self, offset: usize, start: usize, len: usize) -> Result<bool, Error<D::Error>> {
        let address = self.address(offset + start);
        let mut attempt = 0;
        loop {
            match self.device.read(address, &mut self.verify[start..start + len]).await {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == BlockErrorKind::Corrupted => return Ok(false),
                Err(e) if attempt < self.config.retries && e.kind() != BlockErrorKind::Misaligned => {
                    warn!("Read of {} failed, retrying", address);
                    attempt += 1;
                }
                Err(e) => return Err(Error::device(e)),
            }
        }
    }

    /// Read the record in the chunk at `offset`.
    async fn load_slot(&mut self, offset: usize) -> Result<Scan, Error<D::Error>> {
        let chunk_size = self.config.chunk_size;
        let capacity = self.capacity();

        // The header first, to skip the remainder of chunks that obviously hold no record.
        let head = HDR_SIZE.next_multiple_of(self.page_size).min(chunk_size);
        if !self.read_slot(offset, 0, head).await? {
            return Ok(Scan::Unreadable);
        }
        let header = match record::peek(&self.verify[..head]) {
            Ok(header) => header,
            Err(ParseResult::Unset) => return Ok(Scan::Blank),
            Err(ParseResult::Invalid) => return Ok(Scan::Invalid),
        };
        let broken = Scan::Broken {
            version: header.version,
        };
        if header.len > capacity {
            debug!("Record header at {} claims {} bytes", offset, header.len);
            return Ok(broken);
        }

        let total = (HDR_SIZE + header.len).next_multiple_of(self.page_size).min(chunk_size);
        if total > head && !self.read_slot(offset, head, total - head).await? {
            warn!("Record version {} at {} is unreadable", header.version, offset);
            return Ok(broken);
        }

        let Ok(found) = record::open(&self.verify[..total], capacity) else {
            debug!("Invalid record at {}", offset);
            return Ok(broken);
        };
        match record::decode(found.data) {
            Ok(entries) => Ok(Scan::Valid {
                version: found.version,
                entries,
            }),
            Err(_) => {
                warn!("Record version {} at {} has a valid checksum but malformed data", found.version, offset);
                Ok(broken)
            }
        }
    }

    /// Erase the blocks of unreadable chunks, unless they hold the current record.
    ///
    /// Failures are left for the next update to try again.
    async fn retire_unreadable(&mut self) {
        let mut remaining = Vec::new();
        for offset in core::mem::take(&mut self.unreadable) {
            if self.overlaps_active(offset) {
                remaining.push(offset);
                continue;
            }
            match self.erase_slot(offset).await {
                Ok(()) => info!("Erased unreadable chunk at {}", offset),
                Err(_) => {
                    warn!("Failed to erase unreadable chunk at {}", offset);
                    remaining.push(offset);
                }
            }
        }
        self.unreadable = remaining;
    }

    async fn is_blank_slot(&mut self, offset: usize) -> Result<bool, Error<D::Error>> {
        let chunk_size = self.config.chunk_size;
        if !self.read_slot(offset, 0, chunk_size).await? {
            return Ok(false);
        }
        Ok(self.verify.iter().all(|b| *b == 0xff))
    }

    async fn erase_slot(&mut self, offset: usize) -> Result<(), Error<D::Error>> {
        for block in self.slot_blocks(offset) {
            let address = self.address(block * self.block_size);
            let mut attempt = 0;
            loop {
                match self.device.erase(address).await {
                    Ok(()) => break,
                    Err(e) if e.kind() == BlockErrorKind::Misaligned => return Err(Error::Misaligned),
                    Err(_) if attempt < self.config.retries => {
                        warn!("Erase of block at {} failed, retrying", address);
                        attempt += 1;
                    }
                    Err(_) => return Err(Error::EraseFailed),
                }
            }
        }
        Ok(())
    }

    /// Write the staged record to the chunk at `offset` and read it back, retrying on mismatch.
    async fn program_and_verify(&mut self, offset: usize) -> Result<(), Error<D::Error>> {
        let address = self.address(offset);
        let mut last_error = Error::WriteVerifyFailed;

        for _ in 0..=self.config.retries {
            if let Err(e) = self.device.write(address, &self.stage).await {
                if e.kind() == BlockErrorKind::Misaligned {
                    return Err(Error::Misaligned);
                }
                warn!("Write of {} failed", address);
                last_error = Error::device(e);
                continue;
            }

            match self.device.read(address, &mut self.verify).await {
                Ok(()) if self.verify == self.stage => return Ok(()),
                Ok(()) => {
                    warn!("Readback of {} does not match", address);
                    last_error = Error::WriteVerifyFailed;
                }
                Err(e) if e.kind() == BlockErrorKind::Corrupted => last_error = Error::WriteVerifyFailed,
                Err(e) => last_error = Error::device(e),
            }
        }

        Err(last_error)
    }
}
