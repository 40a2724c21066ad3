//! Git smart HTTP protocol core for ghb.
//!
//! This crate implements the transport-independent half of the smart HTTP
//! protocol: pkt-line framing, reference advertisement, the upload-pack
//! negotiation that serves fetches and the receive-pack engine that applies
//! pushes. Engines operate on any [`ghb_storage::GitStore`].

mod advertise;
mod capability;
mod deadline;
mod delta;
mod error;
mod pack;
mod pktline;
mod receive;
mod upload;

pub use advertise::{AdvertisedRefs, Service};
pub use capability::{Capability, CapabilityList, AGENT};
pub use deadline::Deadline;
pub use delta::apply_delta;
pub use error::GitError;
pub use pack::{PackBuilder, PackParser};
pub use pktline::{
    Band, Demuxed, Frames, PktLine, PktLineReader, PktLineWriter, Sideband, MAX_PAYLOAD_LEN,
    MAX_PKT_LEN,
};
pub use receive::{
    apply as receive_pack, Command, CommandKind, CommandStatus, ReceivePackResponse, RefStatus,
    ReferenceUpdateRequest, UnpackStatus,
};
pub use upload::{negotiate as upload_pack, ShallowUpdate, UploadPackRequest, UploadPackResponse};

use ghb_storage::ObjectId;

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;

/// Parses a 40-character hex object id from a protocol line.
pub(crate) fn parse_object_id(hex: &str) -> Result<ObjectId> {
    let hex = hex.trim();
    if hex.len() != ObjectId::HEX_LEN {
        return Err(GitError::Protocol(format!("invalid object id {:?}", hex)));
    }
    ObjectId::from_hex(hex).map_err(|_| GitError::Protocol(format!("invalid object id {:?}", hex)))
}
