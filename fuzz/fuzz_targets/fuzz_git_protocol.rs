//! Fuzz target for smart HTTP request and advertisement decoding.

#![no_main]

use ghb_git::{AdvertisedRefs, ReferenceUpdateRequest, UploadPackRequest};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = AdvertisedRefs::decode(data);
    let _ = UploadPackRequest::decode(data);
    let _ = ReferenceUpdateRequest::decode(data);
});
