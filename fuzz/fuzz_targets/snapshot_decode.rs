#![no_main]

use libfuzzer_sys::fuzz_target;

use httpcache_store::cache::snapshot::{decode, encode};

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = decode(data) else {
        return;
    };
    let encoded = encode(&snapshot).expect("decoded snapshot re-encodes");
    let decoded = decode(&encoded).expect("re-encoded snapshot decodes");
    assert_eq!(decoded, snapshot);
});
