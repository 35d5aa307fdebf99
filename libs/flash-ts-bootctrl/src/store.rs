//! Backends persisting the boot control block and the bootloader command.
use core::fmt::Write;

use defmt_or_log::warn;
use embedded_storage_async::nor_flash::NorFlash;
use flash_ts::block::BlockDevice;
use flash_ts::FlashTs;

use crate::metadata::METADATA_SIZE;

/// Size of the bootloader command, a NUL padded string.
pub const COMMAND_SIZE: usize = 32;

/// Key under which [FtsStore] keeps the hex-encoded boot control block.
pub const METADATA_KEY: &str = "bootctrl.metadata";

/// Key under which [FtsStore] keeps the bootloader command.
pub const COMMAND_KEY: &str = "bootloader.command";

/// Persistent storage of the raw boot control block and the bootloader command.
#[allow(async_fn_in_trait)]
pub trait BootCtrlStore {
    type Error: core::fmt::Debug;

    /// Load the raw boot control block, if one was ever saved.
    async fn load(&mut self) -> Result<Option<[u8; METADATA_SIZE]>, Self::Error>;

    async fn save(&mut self, metadata: &[u8; METADATA_SIZE]) -> Result<(), Self::Error>;

    /// Read the command, all zeroes if there is none.
    async fn read_command(&mut self) -> Result<[u8; COMMAND_SIZE], Self::Error>;

    async fn write_command(&mut self, command: &[u8; COMMAND_SIZE]) -> Result<(), Self::Error>;
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FtsStoreError<E> {
    Fts(flash_ts::Error<E>),
    /// Commands stored in the key-value store must be UTF-8 up to the first NUL.
    InvalidCommand,
}

impl<E> From<flash_ts::Error<E>> for FtsStoreError<E> {
    fn from(e: flash_ts::Error<E>) -> Self {
        FtsStoreError::Fts(e)
    }
}

/// Keeps boot control in a [FlashTs], next to the other variables of the bootloader environment.
pub struct FtsStore<D> {
    fts: FlashTs<D>,
}

impl<D: BlockDevice> FtsStore<D> {
    pub fn new(fts: FlashTs<D>) -> Self {
        Self { fts }
    }

    pub fn fts(&self) -> &FlashTs<D> {
        &self.fts
    }

    pub fn into_inner(self) -> FlashTs<D> {
        self.fts
    }
}

fn decode_hex(hex: &str) -> Option<[u8; METADATA_SIZE]> {
    if hex.len() != 2 * METADATA_SIZE || !hex.is_ascii() {
        return None;
    }

    let mut bytes = [0u8; METADATA_SIZE];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(bytes)
}

impl<D: BlockDevice> BootCtrlStore for FtsStore<D> {
    type Error = FtsStoreError<D::Error>;

    async fn load(&mut self) -> Result<Option<[u8; METADATA_SIZE]>, Self::Error> {
        let Some(hex) = self.fts.get(METADATA_KEY) else {
            return Ok(None);
        };

        let metadata = decode_hex(&hex);
        if metadata.is_none() {
            warn!("Ignoring malformed {}", METADATA_KEY);
        }
        Ok(metadata)
    }

    async fn save(&mut self, metadata: &[u8; METADATA_SIZE]) -> Result<(), Self::Error> {
        let mut hex = heapless::String::<{ 2 * METADATA_SIZE }>::new();
        for byte in metadata {
            // Exactly fills the capacity.
            let _ = write!(hex, "{byte:02x}");
        }
        self.fts.set(METADATA_KEY, &hex).await?;
        Ok(())
    }

    async fn read_command(&mut self) -> Result<[u8; COMMAND_SIZE], Self::Error> {
        let mut command = [0u8; COMMAND_SIZE];
        if let Some(value) = self.fts.get(COMMAND_KEY) {
            let len = value.len().min(COMMAND_SIZE);
            command[..len].copy_from_slice(&value.as_bytes()[..len]);
        }
        Ok(command)
    }

    async fn write_command(&mut self, command: &[u8; COMMAND_SIZE]) -> Result<(), Self::Error> {
        let len = command.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        let value = core::str::from_utf8(&command[..len]).map_err(|_| FtsStoreError::InvalidCommand)?;

        if value.is_empty() {
            self.fts.remove(COMMAND_KEY).await?;
        } else {
            self.fts.set(COMMAND_KEY, value).await?;
        }
        Ok(())
    }
}

/// Keeps boot control raw at the start of a dedicated NOR or eMMC partition.
///
/// The command is kept right after the boot control block. Every update reads,
/// erases and rewrites the whole first erase sector of the partition.
pub struct DevinfoStore<T> {
    flash: T,
    offset: u32,
}

impl<T: NorFlash> DevinfoStore<T> {
    const METADATA_OFFSET: usize = 0;
    const COMMAND_OFFSET: usize = METADATA_SIZE;

    /// Use the partition starting at `offset`, which must be aligned to an erase sector.
    pub fn new(flash: T, offset: u32) -> Self {
        Self { flash, offset }
    }

    pub fn into_inner(self) -> T {
        self.flash
    }

    async fn read_at<const N: usize>(&mut self, offset: usize) -> Result<[u8; N], T::Error> {
        let mut buf = [0u8; N];
        self.flash.read(self.offset + offset as u32, &mut buf).await?;
        Ok(buf)
    }

    async fn update(&mut self, offset: usize, data: &[u8]) -> Result<(), T::Error> {
        let mut sector = alloc::vec![0u8; T::ERASE_SIZE];
        self.flash.read(self.offset, &mut sector).await?;
        if sector[offset..offset + data.len()] == *data {
            return Ok(());
        }

        sector[offset..offset + data.len()].copy_from_slice(data);
        self.flash.erase(self.offset, self.offset + T::ERASE_SIZE as u32).await?;
        self.flash.write(self.offset, &sector).await
    }
}

impl<T: NorFlash> BootCtrlStore for DevinfoStore<T> {
    type Error = T::Error;

    async fn load(&mut self) -> Result<Option<[u8; METADATA_SIZE]>, Self::Error> {
        let metadata = self.read_at::<METADATA_SIZE>(Self::METADATA_OFFSET).await?;
        if metadata.iter().all(|b| *b == 0xff) {
            return Ok(None);
        }
        Ok(Some(metadata))
    }

    async fn save(&mut self, metadata: &[u8; METADATA_SIZE]) -> Result<(), Self::Error> {
        self.update(Self::METADATA_OFFSET, metadata).await
    }

    async fn read_command(&mut self) -> Result<[u8; COMMAND_SIZE], Self::Error> {
        let command = self.read_at::<COMMAND_SIZE>(Self::COMMAND_OFFSET).await?;
        // Never written since the last erase.
        if command.iter().all(|b| *b == 0xff) {
            return Ok([0u8; COMMAND_SIZE]);
        }
        Ok(command)
    }

    async fn write_command(&mut self, command: &[u8; COMMAND_SIZE]) -> Result<(), Self::Error> {
        self.update(Self::COMMAND_OFFSET, command).await
    }
}

#[cfg(test)]
mod tests {
    use flash_ts::block::mock::MockNor;
    use flash_ts::nand::mock::MockNand;
    use flash_ts::nand::NandBlockDevice;
    use flash_ts::Config;

    use super::*;

    type Nand = MockNand<8, 4, 512>;

    async fn fts(nand: &mut Nand) -> FtsStore<NandBlockDevice<&mut Nand>> {
        let config = Config {
            chunk_size: 1024,
            ..Config::default()
        };
        FtsStore::new(FlashTs::init(NandBlockDevice::new(nand), 0, 8 * 2048, config).await.unwrap())
    }

    fn command(text: &str) -> [u8; COMMAND_SIZE] {
        let mut command = [0u8; COMMAND_SIZE];
        command[..text.len()].copy_from_slice(text.as_bytes());
        command
    }

    #[test]
    fn fts_metadata_is_hex() {
        let mut nand = Nand::new();
        embassy_futures::block_on(async {
            let mut store = fts(&mut nand).await;
            assert_eq!(store.load().await.unwrap(), None);

            let mut metadata = [0u8; METADATA_SIZE];
            metadata[0] = 0xab;
            metadata[31] = 0x01;
            store.save(&metadata).await.unwrap();

            let hex = store.fts().get(METADATA_KEY).unwrap();
            assert_eq!(hex.len(), 64);
            assert!(hex.starts_with("ab00"));
            assert!(hex.ends_with("0001"));
            drop(store);

            let mut store = fts(&mut nand).await;
            assert_eq!(store.load().await.unwrap(), Some(metadata));
        });
    }

    #[test]
    fn fts_malformed_metadata() {
        let mut nand = Nand::new();
        embassy_futures::block_on(async {
            let mut inner = fts(&mut nand).await.into_inner();
            inner.set(METADATA_KEY, "not hex").await.unwrap();

            let mut store = FtsStore::new(inner);
            assert_eq!(store.load().await.unwrap(), None);
        });
    }

    #[test]
    fn fts_command() {
        let mut nand = Nand::new();
        embassy_futures::block_on(async {
            let mut store = fts(&mut nand).await;
            assert_eq!(store.read_command().await.unwrap(), [0u8; COMMAND_SIZE]);

            store.write_command(&command("boot-recovery")).await.unwrap();
            assert_eq!(store.fts().get(COMMAND_KEY), Some("boot-recovery".into()));
            assert_eq!(store.read_command().await.unwrap(), command("boot-recovery"));

            store.write_command(&[0u8; COMMAND_SIZE]).await.unwrap();
            assert_eq!(store.fts().get(COMMAND_KEY), None);

            let mut invalid = [0u8; COMMAND_SIZE];
            invalid[0] = 0xff;
            assert!(matches!(
                store.write_command(&invalid).await,
                Err(FtsStoreError::InvalidCommand)
            ));
        });
    }

    #[test]
    fn devinfo_round_trip() {
        let mut nor = MockNor::<4, 4, 256>::new();
        // Unrelated data in the same sector must survive updates.
        nor.as_bytes_mut()[1024 + 100] = 0x42;

        embassy_futures::block_on(async {
            let mut store = DevinfoStore::new(&mut nor, 1024);
            assert_eq!(store.load().await.unwrap(), None);
            assert_eq!(store.read_command().await.unwrap(), [0u8; COMMAND_SIZE]);

            let metadata = [0x5a; METADATA_SIZE];
            store.save(&metadata).await.unwrap();
            store.write_command(&command("bootonce-bootloader")).await.unwrap();

            assert_eq!(store.load().await.unwrap(), Some(metadata));
            assert_eq!(store.read_command().await.unwrap(), command("bootonce-bootloader"));
        });

        assert_eq!(nor.as_bytes()[1024 + 100], 0x42);
        // Other sectors are untouched.
        assert!(nor.as_bytes()[..1024].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn devinfo_erase_failure() {
        let mut nor = MockNor::<4, 4, 256>::new();
        nor.erase_failures = 1;
        embassy_futures::block_on(async {
            let mut store = DevinfoStore::new(&mut nor, 0);
            assert!(store.save(&[0u8; METADATA_SIZE]).await.is_err());
            store.save(&[0u8; METADATA_SIZE]).await.unwrap();
            assert_eq!(store.load().await.unwrap(), Some([0u8; METADATA_SIZE]));
        });
    }
}
