//! Flash translation store: a crash-safe key-value store kept as a log of
//! checksummed, versioned records on a raw flash partition.
//!
//! The store sits on top of a [block::BlockDevice], for which adapters are
//! provided for raw NAND ([nand::NandBlockDevice]) and NOR-like media
//! ([block::NorBlockDevice]). See [store::FlashTs] for the engine.
#![cfg_attr(not(feature = "_test"), no_std)]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod block;
mod error;
pub mod nand;
pub mod record;
pub mod shared;
pub mod store;

pub use error::{Error, ErrorKind};
pub use record::{HDR_SIZE, MAGIC, MAX_DATA_SIZE, MAX_SIZE};
pub use store::{Config, FlashTs, StoreState};
