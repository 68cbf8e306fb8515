//! Fuzz target for the streaming SSH packet decoder.
//!
//! This fuzzer feeds random bytes to the decoder to find:
//! - Panics
//! - Unbounded allocations
//! - Infinite loops
//! - Incorrect error handling
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use skiff_proto::ssh::codec::Decoder;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let mut decoder = Decoder::new(Arc::new(AtomicBool::new(false)));

    // Feed in two chunks to exercise the streaming states.
    let split = data.len() / 2;
    decoder.feed(&data[..split]);
    loop {
        match decoder.next_packet() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    decoder.feed(&data[split..]);
    loop {
        match decoder.next_packet() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
