//! Fuzz target for object payload parsing and delta application.

#![no_main]

use ghb_storage::{GitObject, ObjectType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = GitObject::new(ObjectType::Tree, data.to_vec()).parse_tree();
    let _ = GitObject::new(ObjectType::Commit, data.to_vec()).parse_commit();
    let _ = GitObject::new(ObjectType::Tag, data.to_vec()).tag_target();

    // First byte splits the input into base and delta.
    if let Some((&split, rest)) = data.split_first() {
        let split = (split as usize).min(rest.len());
        let (base, delta) = rest.split_at(split);
        let _ = ghb_git::apply_delta(base, delta);
    }
});
