#![no_main]

extern crate libfuzzer_sys;
extern crate std;

use std::collections::BTreeMap;

use flash_ts::record::{self, CodecError};
use flash_ts::MAX_DATA_SIZE;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|entries: BTreeMap<String, String>| fuzz(entries));

/// Tests for 'every mapping that fits a record decodes back to itself'.
fn fuzz(entries: BTreeMap<String, String>) {
    let entries: BTreeMap<String, String> = entries
        .into_iter()
        .filter(|(k, v)| record::validate_key(k).is_ok() && record::validate_value(v).is_ok())
        .collect();

    let pairs: usize = entries.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let expected = if entries.is_empty() { 2 } else { pairs + 1 };

    let mut buf = vec![0u8; MAX_DATA_SIZE];
    match record::encode(entries.iter().map(|(k, v)| (k.as_str(), v.as_str())), &mut buf) {
        Ok(len) => {
            assert_eq!(len, expected);
            assert_eq!(record::decode(&buf[..len]), Ok(entries));
        }
        Err(CodecError::CapacityExceeded) => assert!(expected > MAX_DATA_SIZE),
        Err(e) => panic!("Unexpected error {:?}", e),
    }
}
