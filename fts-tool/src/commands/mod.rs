use anyhow::Context;
use flash_ts::FlashTs;

use crate::image::ImageFile;
use crate::{Commands, config::Config};

fn fts_error<E: std::fmt::Debug>(e: flash_ts::Error<E>) -> anyhow::Error {
    anyhow::anyhow!("{:?}", e)
}

/// Cut `value` down to at most `max_len` bytes, without splitting a character.
fn clamp(value: &str, max_len: Option<usize>) -> &str {
    let Some(mut len) = max_len else {
        return value;
    };
    if len >= value.len() {
        return value;
    }
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    &value[..len]
}

/// Open the image and scan its partition.
pub async fn open_store(config: &Config) -> anyhow::Result<FlashTs<ImageFile>> {
    let image = ImageFile::open(&config.image)?;
    FlashTs::init(
        image,
        config.partition.base,
        config.partition.size,
        config.store_config(),
    )
    .await
    .map_err(fts_error)
    .with_context(|| format!("Failed to open store in {}", config.image.path.display()))
}

pub async fn process(config: &Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Create { force } => {
            ImageFile::create(&config.image, force)?;
            log::info!("Created erased image {}", config.image.path.display());
            // Validates the partition geometry against the fresh image.
            open_store(config).await?;
        }
        Commands::Init => {
            let store = open_store(config).await?;
            println!("state: {:?}", store.state());
            println!("version: {}", store.version());
            match store.offset() {
                Some(offset) => println!("offset: {:#x}", offset),
                None => println!("offset: none"),
            }
            println!("capacity: {}", store.capacity());
        }
        Commands::Get { key, max_len } => {
            let store = open_store(config).await?;
            let value = store
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("Key {} not found", key))?;
            println!("{}", clamp(&value, max_len));
        }
        Commands::Set { key, value, max_len } => {
            let mut store = open_store(config).await?;
            let value = clamp(&value, max_len);
            store.set(&key, value).await.map_err(fts_error)?;
            log::info!("Stored {} as record version {}", key, store.version());
        }
        Commands::Remove { key } => {
            let mut store = open_store(config).await?;
            if !store.remove(&key).await.map_err(fts_error)? {
                log::warn!("Key {} not present", key);
            }
        }
        Commands::Dump => {
            let store = open_store(config).await?;
            for (key, value) in store.entries() {
                println!("{}={}", key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp("hello", None), "hello");
        assert_eq!(clamp("hello", Some(10)), "hello");
        assert_eq!(clamp("hello", Some(3)), "hel");
        assert_eq!(clamp("héllo", Some(2)), "h");
        assert_eq!(clamp("hello", Some(0)), "");
    }
}
