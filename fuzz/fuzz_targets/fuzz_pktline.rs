//! Fuzz target for pkt-line parsing.
//!
//! The reader must reject malformed frames with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = ghb_git::PktLineReader::new(data);

    // Bounded so crafted input cannot loop forever.
    for _ in 0..100 {
        match reader.read() {
            Ok(Some(line)) => {
                let _ = line.encode();
            }
            Ok(None) | Err(_) => break,
        }
    }

    let mut reader = ghb_git::PktLineReader::new(data);
    let _ = reader.read_sideband();
});
