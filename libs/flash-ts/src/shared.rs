//! A [FlashTs] that can be shared between tasks.
use alloc::string::String;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;

use crate::block::BlockDevice;
use crate::{Error, FlashTs, StoreState};

/// Serializes all access to a single [FlashTs].
///
/// Every operation holds the lock for its full duration, so no reader ever
/// observes a cache that is half updated.
pub struct SharedFlashTs<M: RawMutex, D> {
    inner: Mutex<M, FlashTs<D>>,
}

impl<M: RawMutex, D: BlockDevice> SharedFlashTs<M, D> {
    pub fn new(store: FlashTs<D>) -> Self {
        Self {
            inner: Mutex::new(store),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().await.get(key)
    }

    /// Snapshot of all key-value pairs.
    pub async fn entries(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .await
            .entries()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), Error<D::Error>> {
        self.inner.lock().await.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, Error<D::Error>> {
        self.inner.lock().await.remove(key).await
    }

    pub async fn rescan(&self) -> Result<(), Error<D::Error>> {
        self.inner.lock().await.rescan().await
    }

    pub async fn state(&self) -> StoreState {
        self.inner.lock().await.state()
    }

    pub async fn version(&self) -> u32 {
        self.inner.lock().await.version()
    }

    pub fn into_inner(self) -> FlashTs<D> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::nand::mock::MockNand;
    use crate::nand::NandBlockDevice;
    use crate::Config;

    #[test]
    fn concurrent_updates() {
        let mut nand = MockNand::<8, 4, 512>::new();
        embassy_futures::block_on(async {
            let config = Config {
                chunk_size: 1024,
                ..Config::default()
            };
            let store = FlashTs::init(NandBlockDevice::new(&mut nand), 0, 8 * 2048, config)
                .await
                .unwrap();
            let shared = SharedFlashTs::<NoopRawMutex, _>::new(store);

            let writer = async {
                for i in 0..10 {
                    shared.set("a", &format!("{i}")).await.unwrap();
                }
            };
            let other = async {
                for i in 0..10 {
                    shared.set("b", &format!("{i}")).await.unwrap();
                }
            };
            embassy_futures::join::join(writer, other).await;

            assert_eq!(shared.get("a").await, Some("9".into()));
            assert_eq!(shared.get("b").await, Some("9".into()));
            assert_eq!(shared.version().await, 20);
            assert_eq!(shared.state().await, StoreState::Ready);
            assert_eq!(shared.entries().await.len(), 2);

            assert!(shared.remove("a").await.unwrap());
            shared.rescan().await.unwrap();
            assert_eq!(shared.get("a").await, None);

            let store = shared.into_inner();
            assert_eq!(store.version(), 21);
        });
    }
}
