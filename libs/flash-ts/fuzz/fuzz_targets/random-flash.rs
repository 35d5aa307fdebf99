#![no_main]

extern crate libfuzzer_sys;
extern crate std;

use arbitrary::Arbitrary;
use flash_ts::{nand::mock::MockNand, nand::NandBlockDevice, Config, ErrorKind, FlashTs, StoreState};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: Input<'_>| fuzz(input));

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    pub data: &'a [u8],
    pub bad_blocks: u8,
    pub key: &'a str,
    pub value: &'a str,
}

const BLOCKS: usize = 8;
const PAGES_PER_BLOCK: usize = 4;
const PAGE_BYTES: usize = 256;

/// Tests for 'any input disk, with valid or invalid data, does not cause a crash'.
fn fuzz(input: Input<'_>) {
    let mut nand = MockNand::<BLOCKS, PAGES_PER_BLOCK, PAGE_BYTES>::new();
    nand.fill(input.data);
    for block in (0..BLOCKS).filter(|block| input.bad_blocks & (1 << block) != 0) {
        nand.mark_bad(block);
    }

    let config = Config {
        chunk_size: 512,
        ..Config::default()
    };
    let size = BLOCKS * PAGES_PER_BLOCK * PAGE_BYTES;

    futures::executor::block_on(async {
        // Scanning should never crash, whatever the flash holds.
        let mut store = FlashTs::init(NandBlockDevice::new(&mut nand), 0, size, config)
            .await
            .unwrap();
        let version = store.version();

        match store.set(input.key, input.value).await {
            Ok(()) => {
                assert_eq!(store.get(input.key).as_deref(), Some(input.value));
                assert!(store.version() > version || (store.version() == version && version != 0));
            }
            Err(e) => match e.kind() {
                ErrorKind::InvalidKey | ErrorKind::CapacityExceeded => assert_eq!(store.version(), version),
                // Every block bad but the one holding the current record, or versions exhausted.
                ErrorKind::NoSpace => assert_eq!(store.state(), StoreState::Unrecoverable),
                _ => panic!("Unexpected error {:?}", e),
            },
        }
    });
}
