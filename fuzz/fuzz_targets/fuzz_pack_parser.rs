//! Fuzz target for pack parsing.
//!
//! Tests that the pack parser handles arbitrary input without panicking,
//! including delta chains and references to missing bases.

#![no_main]

use ghb_git::{Deadline, PackParser};
use ghb_storage::Repository;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = Repository::bare();
    let mut parser = PackParser::new(data);
    let _ = parser.parse(&store, &Deadline::never());
});
