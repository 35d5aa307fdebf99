use std::path::Path;

use flash_ts::StoreState;
use fts_tool::commands::{self, open_store};
use fts_tool::{Commands, Config, ImageArgs, PartitionArgs};

const BLOCK: usize = 4096;

fn config(dir: &Path, bad_blocks: Vec<u32>) -> Config {
    Config {
        image: ImageArgs {
            path: dir.join("flash.img"),
            page_size: 512,
            block_size: BLOCK,
            size: 16 * BLOCK,
            bad_blocks,
        },
        partition: PartitionArgs {
            base: (4 * BLOCK) as u32,
            size: 8 * BLOCK,
            chunk_size: Some(2048),
            reserved_blocks: 0,
        },
    }
}

async fn set(config: &Config, key: &str, value: &str) {
    commands::process(
        config,
        Commands::Set {
            key: key.into(),
            value: value.into(),
            max_len: None,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn create_set_get() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![]);

    commands::process(&config, Commands::Create { force: false }).await.unwrap();
    let store = open_store(&config).await.unwrap();
    assert_eq!(store.state(), StoreState::Empty);

    set(&config, "bootcmd", "run distro_bootcmd").await;
    set(&config, "bootdelay", "3").await;
    commands::process(&config, Commands::Get { key: "bootdelay".into(), max_len: None })
        .await
        .unwrap();
    commands::process(&config, Commands::Dump).await.unwrap();

    let store = open_store(&config).await.unwrap();
    assert_eq!(store.version(), 2);
    assert_eq!(store.get("bootcmd").as_deref(), Some("run distro_bootcmd"));
    assert_eq!(store.get("bootdelay").as_deref(), Some("3"));

    // Nothing outside of the partition was touched.
    let image = std::fs::read(&config.image.path).unwrap();
    assert!(image[..4 * BLOCK].iter().all(|b| *b == 0xff));
    assert!(image[12 * BLOCK..].iter().all(|b| *b == 0xff));
}

#[tokio::test]
async fn create_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![]);

    commands::process(&config, Commands::Create { force: false }).await.unwrap();
    set(&config, "key", "value").await;

    assert!(commands::process(&config, Commands::Create { force: false }).await.is_err());
    assert_eq!(open_store(&config).await.unwrap().get("key").as_deref(), Some("value"));

    commands::process(&config, Commands::Create { force: true }).await.unwrap();
    assert_eq!(open_store(&config).await.unwrap().state(), StoreState::Empty);
}

#[tokio::test]
async fn max_len_clamps_value() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![]);
    commands::process(&config, Commands::Create { force: false }).await.unwrap();

    commands::process(
        &config,
        Commands::Set {
            key: "serial".into(),
            value: "0123456789".into(),
            max_len: Some(4),
        },
    )
    .await
    .unwrap();

    assert_eq!(open_store(&config).await.unwrap().get("serial").as_deref(), Some("0123"));
}

#[tokio::test]
async fn remove_and_missing_keys() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![]);
    commands::process(&config, Commands::Create { force: false }).await.unwrap();

    set(&config, "a", "1").await;
    commands::process(&config, Commands::Remove { key: "a".into() }).await.unwrap();
    // Removing an absent key is not an error.
    commands::process(&config, Commands::Remove { key: "a".into() }).await.unwrap();

    assert!(
        commands::process(&config, Commands::Get { key: "a".into(), max_len: None })
            .await
            .is_err()
    );
    assert_eq!(open_store(&config).await.unwrap().version(), 2);
}

#[tokio::test]
async fn bad_blocks_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    // The first block of the partition.
    let config = config(dir.path(), vec![4]);
    commands::process(&config, Commands::Create { force: false }).await.unwrap();

    for i in 0..20 {
        set(&config, "counter", &format!("{i}")).await;
    }

    let store = open_store(&config).await.unwrap();
    assert_eq!(store.get("counter").as_deref(), Some("19"));
    assert!(store.offset().unwrap() >= BLOCK);

    let image = std::fs::read(&config.image.path).unwrap();
    assert!(image[4 * BLOCK..5 * BLOCK].iter().all(|b| *b == 0xff));
}

#[tokio::test]
async fn missing_image() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![]);
    assert!(commands::process(&config, Commands::Init).await.is_err());
}

#[test]
fn read_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fts.toml");
    std::fs::write(
        &path,
        r#"
        [image]
        path = "flash.img"
        page_size = 2048
        block_size = 131072
        size = 4194304

        [partition]
        base = 0
        size = 1048576
        "#,
    )
    .unwrap();

    let config = Config::read(&path).unwrap();
    assert_eq!(config.partition.size, 1048576);
    assert_eq!(config.store_config().chunk_size, flash_ts::MAX_SIZE);
    assert!(Config::read(dir.path().join("missing.toml")).is_err());
}
