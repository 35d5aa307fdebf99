use std::vec::Vec;

use crate::nand::{NandController, NandGeometry, PageRead};

pub const OOB_BYTES: usize = 16;

/// Number of times a page may be programmed between erasures (NOP).
pub const PARTIAL_PROGRAMS: u8 = 4;

/// In-memory NAND flash that can be used for mocking.
///
/// Supports injecting the failures a store has to survive: factory bad blocks,
/// lost or corrupted page programs, failing erasures and sudden power loss.
#[derive(Debug, Clone)]
pub struct MockNand<const BLOCKS: usize, const PAGES_PER_BLOCK: usize, const PAGE_BYTES: usize> {
    data: Vec<u8>,
    oob: Vec<u8>,
    /// Times each page was programmed since its block was erased.
    programs: Vec<u8>,
    uncorrectable: Vec<bool>,
    erase_counts: Vec<u32>,
    program_log: Vec<u32>,
    powered_off: bool,

    /// A countdown of page programs and block erasures to power loss.
    ///
    /// The operation that hits zero is torn halfway, after which every operation fails until [Self::remove_shutoff].
    pub ops_until_shutoff: Option<u32>,
    /// Number of upcoming page programs that report success without programming anything.
    pub drop_programs: u32,
    /// Number of upcoming page programs that leave the first byte of the page zeroed.
    pub corrupt_programs: u32,
    /// Number of upcoming block erasures that fail.
    pub erase_failures: u32,
}

impl<const BLOCKS: usize, const PAGES_PER_BLOCK: usize, const PAGE_BYTES: usize> Default
    for MockNand<BLOCKS, PAGES_PER_BLOCK, PAGE_BYTES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const BLOCKS: usize, const PAGES_PER_BLOCK: usize, const PAGE_BYTES: usize>
    MockNand<BLOCKS, PAGES_PER_BLOCK, PAGE_BYTES>
{
    const PAGES: usize = BLOCKS * PAGES_PER_BLOCK;

    /// Create a factory fresh flash, without bad blocks.
    pub fn new() -> Self {
        Self {
            data: vec![u8::MAX; Self::PAGES * PAGE_BYTES],
            oob: vec![u8::MAX; Self::PAGES * OOB_BYTES],
            programs: vec![0; Self::PAGES],
            uncorrectable: vec![false; Self::PAGES],
            erase_counts: vec![0; BLOCKS],
            program_log: Vec::new(),
            powered_off: false,
            ops_until_shutoff: None,
            drop_programs: 0,
            corrupt_programs: 0,
            erase_failures: 0,
        }
    }

    /// Set the factory bad-block marker in the first page of a block.
    pub fn mark_bad(&mut self, block: usize) {
        self.oob[block * PAGES_PER_BLOCK * OOB_BYTES] = 0x00;
    }

    /// Set the factory bad-block marker in the second page of a block.
    pub fn mark_bad_second_page(&mut self, block: usize) {
        self.oob[(block * PAGES_PER_BLOCK + 1) * OOB_BYTES] = 0x00;
    }

    /// Let ECC fail on a page until its block is erased.
    pub fn make_uncorrectable(&mut self, page: usize) {
        self.uncorrectable[page] = true;
    }

    pub fn is_bad(&self, block: usize) -> bool {
        [0, 1].iter().any(|p| self.oob[(block * PAGES_PER_BLOCK + p) * OOB_BYTES] != u8::MAX)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the start of the main data with `data`, as if those pages were programmed with it.
    pub fn fill(&mut self, data: &[u8]) {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        for programs in &mut self.programs[..len.div_ceil(PAGE_BYTES)] {
            *programs = (*programs).max(1);
        }
    }

    /// Every page program attempted so far, in order.
    pub fn program_log(&self) -> &[u32] {
        &self.program_log
    }

    pub fn clear_program_log(&mut self) {
        self.program_log.clear();
    }

    pub fn erase_count(&self, block: usize) -> u32 {
        self.erase_counts[block]
    }

    pub fn is_powered_off(&self) -> bool {
        self.powered_off
    }

    /// Restore power, disarming the shutoff countdown.
    pub fn remove_shutoff(&mut self) {
        self.ops_until_shutoff = None;
        self.powered_off = false;
    }

    fn check_power(&self, address: u32, operation: Operation) -> Result<(), MockNandError> {
        if self.powered_off {
            Err(MockNandError::EarlyShutoff(address, operation))
        } else {
            Ok(())
        }
    }

    /// Count down to power loss, yielding `true` if the current operation gets torn.
    fn shutoff_now(&mut self) -> bool {
        match self.ops_until_shutoff.as_mut() {
            Some(0) => {
                self.ops_until_shutoff = None;
                self.powered_off = true;
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    fn check_page(page: u32) -> Result<usize, MockNandError> {
        let page = page as usize;
        if page >= Self::PAGES {
            Err(MockNandError::OutOfBounds)
        } else {
            Ok(page)
        }
    }

    fn erase_page(&mut self, page: usize) {
        self.data[page * PAGE_BYTES..(page + 1) * PAGE_BYTES].fill(u8::MAX);
        // Spare bytes other than the bad-block marker are left alone.
        self.oob[page * OOB_BYTES + 1..(page + 1) * OOB_BYTES].fill(u8::MAX);
        self.programs[page] = 0;
        self.uncorrectable[page] = false;
    }
}

impl<const BLOCKS: usize, const PAGES_PER_BLOCK: usize, const PAGE_BYTES: usize> NandController
    for MockNand<BLOCKS, PAGES_PER_BLOCK, PAGE_BYTES>
{
    type Error = MockNandError;

    fn geometry(&self) -> NandGeometry {
        NandGeometry {
            page_size: PAGE_BYTES,
            oob_size: OOB_BYTES,
            pages_per_block: PAGES_PER_BLOCK,
            block_count: BLOCKS,
        }
    }

    async fn read_page(&mut self, page: u32, data: &mut [u8]) -> Result<PageRead, Self::Error> {
        self.check_power(page, Operation::Read)?;
        let page = Self::check_page(page)?;

        if self.uncorrectable[page] {
            return Ok(PageRead::Uncorrectable);
        }
        if self.programs[page] == 0 {
            return Ok(PageRead::Erased);
        }

        data.copy_from_slice(&self.data[page * PAGE_BYTES..(page + 1) * PAGE_BYTES]);
        Ok(PageRead::Data)
    }

    async fn read_oob_raw(&mut self, page: u32, oob: &mut [u8]) -> Result<(), Self::Error> {
        self.check_power(page, Operation::Read)?;
        let page = Self::check_page(page)?;

        let start = page * OOB_BYTES;
        oob.copy_from_slice(&self.oob[start..start + oob.len()]);
        Ok(())
    }

    async fn program_page(&mut self, page: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.check_power(page, Operation::Program)?;
        let index = Self::check_page(page)?;
        assert_eq!(data.len(), PAGE_BYTES, "programs always cover a whole page");

        self.program_log.push(page);

        if self.is_bad(index / PAGES_PER_BLOCK) {
            return Err(MockNandError::BadBlock(page));
        }
        if self.programs[index] >= PARTIAL_PROGRAMS {
            return Err(MockNandError::NotWritable(page));
        }

        let torn = self.shutoff_now();
        if !torn {
            if let Some(next) = self.drop_programs.checked_sub(1) {
                self.drop_programs = next;
                return Ok(());
            }
        }

        let cells = &mut self.data[index * PAGE_BYTES..(index + 1) * PAGE_BYTES];
        let len = if torn { PAGE_BYTES / 2 } else { PAGE_BYTES };
        for (cell, byte) in cells.iter_mut().zip(&data[..len]) {
            *cell &= byte;
        }
        self.programs[index] += 1;

        if torn {
            return Err(MockNandError::EarlyShutoff(page, Operation::Program));
        }

        if let Some(next) = self.corrupt_programs.checked_sub(1) {
            self.corrupt_programs = next;
            cells[0] = 0;
        }
        Ok(())
    }

    async fn erase_block(&mut self, block: u32) -> Result<(), Self::Error> {
        self.check_power(block, Operation::Erase)?;
        let index = block as usize;
        if index >= BLOCKS {
            return Err(MockNandError::OutOfBounds);
        }

        if self.is_bad(index) {
            return Err(MockNandError::BadBlock(block));
        }
        if let Some(next) = self.erase_failures.checked_sub(1) {
            self.erase_failures = next;
            return Err(MockNandError::EraseFailed(block));
        }

        let torn = self.shutoff_now();
        let pages = if torn { PAGES_PER_BLOCK / 2 } else { PAGES_PER_BLOCK };
        for page in index * PAGES_PER_BLOCK..index * PAGES_PER_BLOCK + pages {
            self.erase_page(page);
        }

        if torn {
            return Err(MockNandError::EarlyShutoff(block, Operation::Erase));
        }

        self.erase_counts[index] += 1;
        Ok(())
    }
}

/// Errors reported by mock flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockNandError {
    /// Page or block out of bounds.
    OutOfBounds,
    /// Operation on a block carrying a bad-block marker.
    BadBlock(u32),
    /// Page programmed too often since the last erase.
    NotWritable(u32),
    /// An injected erase failure.
    EraseFailed(u32),
    /// We got a shutoff
    EarlyShutoff(u32, Operation),
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Program,
    Erase,
}
