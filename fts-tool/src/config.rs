use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// The flash image file and the geometry of the flash it represents.
    pub image: ImageArgs,

    /// Location of the store within the image.
    pub partition: PartitionArgs,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ImageArgs {
    /// Path of the image file.
    pub path: PathBuf,
    /// Smallest unit that can be read or written.
    pub page_size: usize,
    /// Size of an erase block.
    pub block_size: usize,
    /// Size of the whole image.
    pub size: usize,
    /// Indices of erase blocks to treat as factory bad blocks.
    #[serde(default)]
    pub bad_blocks: Vec<u32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PartitionArgs {
    /// Offset of the partition within the image, aligned to an erase block.
    pub base: u32,
    /// Size of the partition, a multiple of the erase block size.
    pub size: usize,
    /// Stride at which records are placed. Defaults to the largest record size.
    pub chunk_size: Option<usize>,
    /// Leading erase blocks of the image holding raw boot images.
    #[serde(default)]
    pub reserved_blocks: usize,
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Config>(&std::fs::read_to_string(path)?)?)
    }

    pub fn store_config(&self) -> flash_ts::Config {
        let defaults = flash_ts::Config::default();
        flash_ts::Config {
            chunk_size: self.partition.chunk_size.unwrap_or(defaults.chunk_size),
            reserved_blocks: self.partition.reserved_blocks,
            ..defaults
        }
    }
}
