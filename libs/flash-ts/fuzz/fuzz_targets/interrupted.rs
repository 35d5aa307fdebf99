#![no_main]

extern crate libfuzzer_sys;
extern crate std;

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use flash_ts::{nand::mock::MockNand, nand::NandBlockDevice, Config, FlashTs};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: Input| fuzz(input.updates, input.fail_at));

#[derive(Debug)]
struct Input {
    /// Consecutive updates of one of a few keys.
    pub updates: Vec<(u8, u16)>,

    /// Number of flash programs and erasures to fail at.
    pub fail_at: u32,
}

impl<'a> Arbitrary<'a> for Input {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let updates: Vec<(u8, u16)> = Arbitrary::arbitrary(u)?;
        let fail_at = u.int_in_range(0..=updates.len() as u32 * 4)?;
        Ok(Input { updates, fail_at })
    }
}

const BLOCKS: usize = 8;
const PAGES_PER_BLOCK: usize = 4;
const PAGE_BYTES: usize = 256;

type Entries = BTreeMap<String, String>;

fn snapshot<D: flash_ts::block::BlockDevice>(store: &FlashTs<D>) -> Entries {
    store.entries().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Tests for 'a power loss at any point keeps either the old or the new record'.
fn fuzz(updates: Vec<(u8, u16)>, fail_at: u32) {
    let mut nand = MockNand::<BLOCKS, PAGES_PER_BLOCK, PAGE_BYTES>::new();
    nand.ops_until_shutoff = Some(fail_at);

    let config = Config {
        chunk_size: 512,
        ..Config::default()
    };
    let size = BLOCKS * PAGES_PER_BLOCK * PAGE_BYTES;

    futures::executor::block_on(async {
        let mut store = FlashTs::init(NandBlockDevice::new(&mut nand), 0, size, config.clone())
            .await
            .unwrap();

        for (key, value) in updates {
            let key = format!("key{}", key % 4);
            let value = format!("{value}");

            let prev = snapshot(&store);
            let mut next = prev.clone();
            next.insert(key.clone(), value.clone());

            match store.set(&key, &value).await {
                Ok(()) => assert_eq!(snapshot(&store), next),
                Err(e) => {
                    // Only a power loss may fail an update here.
                    let nand = store.into_inner().into_inner();
                    assert!(nand.is_powered_off(), "Unexpected error {:?}", e);
                    nand.remove_shutoff();

                    store = FlashTs::init(NandBlockDevice::new(nand), 0, size, config.clone())
                        .await
                        .unwrap();
                    let recovered = snapshot(&store);
                    assert!(
                        recovered == prev || recovered == next,
                        "State not maintained or persisted"
                    );
                }
            }
        }
    });
}
