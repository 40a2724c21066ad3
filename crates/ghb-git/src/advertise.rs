//! Reference advertisement for `info/refs` discovery.

use crate::capability::{Capability, CapabilityList};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::{parse_object_id, GitError, Result};
use ghb_storage::{GitStore, ObjectId, Reference, HEAD};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

/// Placeholder reference name advertised by an empty repository.
const CAPABILITIES_PLACEHOLDER: &str = "capabilities^{}";

/// The two smart HTTP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// `git-upload-pack`: fetch and clone.
    UploadPack,
    /// `git-receive-pack`: push.
    ReceivePack,
}

impl Service {
    /// The wire name, as used in `?service=` and endpoint paths.
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Content type of the discovery response.
    pub fn advertisement_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type a client must send on the RPC endpoint.
    pub fn request_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-request",
            Self::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    /// Content type of the RPC response.
    pub fn result_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            // Matches what existing deployments of this server send.
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Capabilities the server advertises for this service.
    pub fn capabilities(self) -> CapabilityList {
        match self {
            Self::UploadPack => CapabilityList::upload_pack(),
            Self::ReceivePack => CapabilityList::receive_pack(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The references and capabilities a server announces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisedRefs {
    /// Object HEAD resolves to, if the repository has one.
    pub head: Option<ObjectId>,
    /// Direct references, sorted by name. HEAD is not included.
    pub references: BTreeMap<String, ObjectId>,
    /// Capabilities attached to the first line.
    pub capabilities: CapabilityList,
}

impl AdvertisedRefs {
    /// Snapshots the references of `store` for `service`.
    ///
    /// A repository without any direct references advertises nothing but
    /// its capabilities. Once references exist, HEAD must resolve.
    pub fn build<S: GitStore + ?Sized>(store: &S, service: Service) -> Result<Self> {
        let mut references = BTreeMap::new();
        for (name, reference) in store.list_refs()? {
            if name == HEAD {
                continue;
            }
            if let Reference::Direct(id) = reference {
                references.insert(name, id);
            }
        }

        let mut capabilities = service.capabilities();

        if references.is_empty() {
            return Ok(Self {
                head: None,
                references,
                capabilities,
            });
        }

        let head = store
            .resolve_ref(HEAD)
            .map_err(|e| GitError::NoHead(e.to_string()))?;

        if service == Service::UploadPack {
            if let Some(Reference::Symbolic(target)) = store.find_ref(HEAD)? {
                capabilities.insert(Capability::SymRef {
                    from: HEAD.to_string(),
                    to: target,
                });
            }
        }

        Ok(Self {
            head: Some(head),
            references,
            capabilities,
        })
    }

    /// Returns true when neither HEAD nor any reference is advertised.
    pub fn is_empty(&self) -> bool {
        self.head.is_none() && self.references.is_empty()
    }

    /// Writes the advertisement.
    ///
    /// With `service` set, the smart HTTP preamble `# service=<name>` and its
    /// flush packet come first.
    pub fn encode<W: Write>(&self, writer: W, service: Option<Service>) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        if let Some(service) = service {
            pkt_writer.write_line(&format!("# service={}", service))?;
            pkt_writer.flush_pkt()?;
        }

        let caps = self.capabilities.to_string();
        let mut lines = self
            .head
            .map(|id| (id, HEAD))
            .into_iter()
            .chain(self.references.iter().map(|(name, id)| (*id, name.as_str())));

        match lines.next() {
            Some((id, name)) => {
                pkt_writer.write(&PktLine::from_string(&format!("{} {}\0{}\n", id, name, caps)))?;
            }
            None => {
                pkt_writer.write(&PktLine::from_string(&format!(
                    "{} {}\0{}\n",
                    ObjectId::ZERO,
                    CAPABILITIES_PLACEHOLDER,
                    caps
                )))?;
            }
        }

        for (id, name) in lines {
            pkt_writer.write_line(&format!("{} {}", id, name))?;
        }

        pkt_writer.flush_pkt()?;
        pkt_writer.flush()?;
        Ok(())
    }

    /// Parses an advertisement, with or without the smart HTTP preamble.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut advertised = Self::default();
        let mut first = true;

        let mut pending = pkt_reader.read()?;
        if let Some(line) = pending.as_ref().and_then(PktLine::as_str) {
            if line.starts_with("# service=") {
                // Rest of the preamble section, then the first reference.
                pkt_reader.read_until_flush()?;
                pending = pkt_reader.read()?;
            }
        }

        while let Some(pkt) = pending.take() {
            let data = match pkt {
                PktLine::Flush => break,
                PktLine::Data(data) => data,
                other => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in advertisement: {:?}",
                        other
                    )))
                }
            };

            let text = std::str::from_utf8(&data)
                .map_err(|_| GitError::Protocol("advertisement is not UTF-8".to_string()))?
                .trim_end_matches('\n');

            let (entry, caps) = match text.split_once('\0') {
                Some((entry, caps)) => (entry, Some(caps)),
                None => (text, None),
            };
            if first {
                advertised.capabilities = CapabilityList::parse(caps.unwrap_or_default());
                first = false;
            }

            let (id, name) = entry
                .split_once(' ')
                .ok_or_else(|| GitError::Protocol(format!("malformed reference line {:?}", entry)))?;
            let id = parse_object_id(id)?;

            match name {
                HEAD => advertised.head = Some(id),
                CAPABILITIES_PLACEHOLDER => {}
                peeled if peeled.ends_with("^{}") => {}
                _ => {
                    advertised.references.insert(name.to_string(), id);
                }
            }

            pending = pkt_reader.read()?;
        }

        Ok(advertised)
    }
}
