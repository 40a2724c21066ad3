//! Receive-pack: reference updates for push.
//!
//! A push request is a list of `<old> <new> <ref>` commands followed by a
//! pack holding the new objects. The pack is unpacked first; each command
//! is then applied on its own as a compare-and-swap against the store, so
//! one rejected reference never blocks the others.

use crate::capability::{Capability, CapabilityList};
use crate::deadline::Deadline;
use crate::pack::PackParser;
use crate::pktline::{Band, PktLine, PktLineReader, PktLineWriter, Sideband};
use crate::{parse_object_id, GitError, Result};
use ghb_storage::{GitStore, ObjectId, StorageError};
use std::fmt;
use std::io::{Read, Write};

/// Kind of reference update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Old id is zero: the reference must not exist yet.
    Create,
    /// Both ids set: move the reference.
    Update,
    /// New id is zero: remove the reference.
    Delete,
}

/// A ref update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Old object ID (zeros for create).
    pub old_id: ObjectId,
    /// New object ID (zeros for delete).
    pub new_id: ObjectId,
    /// Reference name.
    pub ref_name: String,
}

impl Command {
    /// Classifies the command. Both ids zero is not a valid command.
    pub fn kind(&self) -> Option<CommandKind> {
        match (self.old_id.is_zero(), self.new_id.is_zero()) {
            (true, true) => None,
            (true, false) => Some(CommandKind::Create),
            (false, false) => Some(CommandKind::Update),
            (false, true) => Some(CommandKind::Delete),
        }
    }

    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.kind() == Some(CommandKind::Create)
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.kind() == Some(CommandKind::Delete)
    }

    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(ref_name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GitError::Protocol(format!("malformed command {:?}", line)));
        };
        Ok(Self {
            old_id: parse_object_id(old)?,
            new_id: parse_object_id(new)?,
            ref_name: ref_name.to_string(),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old_id, self.new_id, self.ref_name)
    }
}

/// A parsed receive-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceUpdateRequest {
    /// Reference updates, in request order.
    pub commands: Vec<Command>,
    /// Capabilities named on the first command.
    pub capabilities: CapabilityList,
    /// Shallow commits announced by a shallow clone.
    pub shallows: Vec<ObjectId>,
    /// The pack that follows the commands; may be empty.
    pub pack: Vec<u8>,
}

impl ReferenceUpdateRequest {
    /// Parses a request body.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        for pkt in pkt_reader.frames() {
            let data = match pkt? {
                PktLine::Data(data) => data,
                other => {
                    return Err(GitError::Protocol(format!("unexpected packet {:?}", other)))
                }
            };
            let text = std::str::from_utf8(&data)
                .map_err(|_| GitError::Protocol("command is not UTF-8".to_string()))?
                .trim_end_matches('\n');

            if let Some(id) = text.strip_prefix("shallow ") {
                request.shallows.push(parse_object_id(id)?);
                continue;
            }

            let (line, caps) = match text.split_once('\0') {
                Some((line, caps)) => (line, Some(caps)),
                None => (text, None),
            };
            if request.commands.is_empty() {
                if let Some(caps) = caps {
                    request.capabilities = CapabilityList::parse(caps);
                }
            }
            request.commands.push(Command::parse(line)?);
        }

        pkt_reader.inner_mut().read_to_end(&mut request.pack)?;
        Ok(request)
    }

    /// Writes the request the way a pushing client sends it.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);
        for shallow in &self.shallows {
            pkt_writer.write_line(&format!("shallow {}", shallow))?;
        }
        for (i, command) in self.commands.iter().enumerate() {
            if i == 0 {
                pkt_writer.write_line(&format!("{}\0{}", command, self.capabilities))?;
            } else {
                pkt_writer.write_line(&command.to_string())?;
            }
        }
        pkt_writer.flush_pkt()?;
        pkt_writer.write_raw(&self.pack)?;
        pkt_writer.flush()?;
        Ok(())
    }
}

/// Outcome of unpacking the pushed objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackStatus {
    /// Every object was stored.
    Ok,
    /// The pack was rejected.
    Failed(String),
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// The reference was updated.
    Ok,
    /// The reference was left alone, with the reason.
    Rejected(String),
}

/// Per-reference line of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Reference the command targeted.
    pub ref_name: String,
    /// What happened to it.
    pub status: RefStatus,
}

/// The server's answer to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivePackResponse {
    /// Unpack outcome.
    pub unpack: UnpackStatus,
    /// One entry per command, in request order.
    pub statuses: Vec<CommandStatus>,
    /// Whether the client asked for a status report.
    pub report_status: bool,
    /// Side-band flavour to wrap the report in.
    pub sideband: Option<Sideband>,
}

impl ReceivePackResponse {
    /// Returns true if the pack was stored and every command succeeded.
    pub fn is_success(&self) -> bool {
        self.unpack == UnpackStatus::Ok && self.statuses.iter().all(|s| s.status == RefStatus::Ok)
    }

    /// Writes the response body. Without `report-status` the body is empty.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);
        if !self.report_status {
            pkt_writer.flush()?;
            return Ok(());
        }

        let mut report = PktLineWriter::new(Vec::new());
        match &self.unpack {
            UnpackStatus::Ok => report.write_line("unpack ok")?,
            UnpackStatus::Failed(reason) => report.write_line(&format!("unpack {}", reason))?,
        }
        for status in &self.statuses {
            match &status.status {
                RefStatus::Ok => report.write_line(&format!("ok {}", status.ref_name))?,
                RefStatus::Rejected(reason) => {
                    report.write_line(&format!("ng {} {}", status.ref_name, reason))?
                }
            }
        }
        report.flush_pkt()?;
        let report = report.into_inner();

        match self.sideband {
            Some(mode) => {
                pkt_writer.write_band(mode, Band::Data, &report)?;
                pkt_writer.flush_pkt()?;
            }
            None => pkt_writer.write_raw(&report)?,
        }
        pkt_writer.flush()?;
        Ok(())
    }

    /// Parses a response to `request`, as a pushing client would.
    pub fn decode<R: Read>(reader: R, request: &ReferenceUpdateRequest) -> Result<Self> {
        let caps = request.capabilities.intersect(&CapabilityList::receive_pack());
        let mut response = Self {
            unpack: UnpackStatus::Ok,
            statuses: Vec::new(),
            report_status: caps.contains(&Capability::ReportStatus),
            sideband: caps.sideband(),
        };
        if !response.report_status {
            return Ok(response);
        }

        let mut pkt_reader = PktLineReader::new(reader);
        let lines = match response.sideband {
            Some(_) => {
                let data = pkt_reader.read_sideband()?.data;
                PktLineReader::new(&data[..]).read_until_flush()?
            }
            None => pkt_reader.read_until_flush()?,
        };

        let mut lines = lines.iter();
        let unpack = lines
            .next()
            .and_then(PktLine::as_str)
            .and_then(|l| l.strip_prefix("unpack "))
            .ok_or_else(|| GitError::Protocol("report without unpack line".to_string()))?;
        if unpack != "ok" {
            response.unpack = UnpackStatus::Failed(unpack.to_string());
        }

        for pkt in lines {
            let line = pkt
                .as_str()
                .ok_or_else(|| GitError::Protocol("report line is not UTF-8".to_string()))?;
            let status = if let Some(ref_name) = line.strip_prefix("ok ") {
                CommandStatus {
                    ref_name: ref_name.to_string(),
                    status: RefStatus::Ok,
                }
            } else if let Some(rest) = line.strip_prefix("ng ") {
                let (ref_name, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                CommandStatus {
                    ref_name: ref_name.to_string(),
                    status: RefStatus::Rejected(reason.to_string()),
                }
            } else {
                return Err(GitError::Protocol(format!("unexpected report line {:?}", line)));
            };
            response.statuses.push(status);
        }

        Ok(response)
    }
}

/// Unpacks the request's objects into `store` and applies its commands.
///
/// Unpack failure rejects every command. The deadline is checked while
/// unpacking and before each command; a command that already started is
/// always completed.
pub fn apply<S: GitStore + ?Sized>(
    store: &S,
    request: &ReferenceUpdateRequest,
    deadline: &Deadline,
) -> Result<ReceivePackResponse> {
    deadline.check()?;
    let caps = request.capabilities.intersect(&CapabilityList::receive_pack());
    let mut response = ReceivePackResponse {
        unpack: UnpackStatus::Ok,
        statuses: Vec::with_capacity(request.commands.len()),
        report_status: caps.contains(&Capability::ReportStatus),
        sideband: caps.sideband(),
    };

    if let Err(e) = unpack(store, &request.pack, deadline) {
        if matches!(e, GitError::Timeout) {
            return Err(e);
        }
        tracing::warn!(error = %e, "Failed to unpack pushed objects");
        response.unpack = UnpackStatus::Failed(e.to_string());
        response.statuses = request
            .commands
            .iter()
            .map(|command| CommandStatus {
                ref_name: command.ref_name.clone(),
                status: RefStatus::Rejected("n/a (unpacker error)".to_string()),
            })
            .collect();
        return Ok(response);
    }

    for command in &request.commands {
        deadline.check()?;
        let status = apply_command(store, command)?;
        match &status {
            RefStatus::Ok => {
                tracing::info!(ref_name = %command.ref_name, old = %command.old_id, new = %command.new_id, "Reference updated")
            }
            RefStatus::Rejected(reason) => {
                tracing::warn!(ref_name = %command.ref_name, reason = %reason, "Reference update rejected")
            }
        }
        response.statuses.push(CommandStatus {
            ref_name: command.ref_name.clone(),
            status,
        });
    }

    Ok(response)
}

fn unpack<S: GitStore + ?Sized>(store: &S, pack: &[u8], deadline: &Deadline) -> Result<()> {
    if pack.is_empty() {
        return Ok(());
    }
    let objects = PackParser::new(pack).parse(store, deadline)?;
    let count = objects.len();
    store.write_objects(objects)?;
    tracing::debug!(objects = count, bytes = pack.len(), "Unpacked pushed objects");
    Ok(())
}

fn apply_command<S: GitStore + ?Sized>(store: &S, command: &Command) -> Result<RefStatus> {
    let rejected = |reason: &str| Ok(RefStatus::Rejected(reason.to_string()));

    let Some(kind) = command.kind() else {
        return rejected("invalid command");
    };
    if !is_valid_ref_name(&command.ref_name) {
        return rejected("funny refname");
    }
    if kind != CommandKind::Delete && !store.has_object(&command.new_id)? {
        return rejected("missing necessary objects");
    }

    let expected = (kind != CommandKind::Create).then_some(command.old_id);
    let new = (kind != CommandKind::Delete).then_some(command.new_id);
    match store.compare_and_swap_ref(&command.ref_name, expected, new) {
        Ok(()) => Ok(RefStatus::Ok),
        Err(StorageError::StaleRef(_)) => rejected("stale info"),
        Err(StorageError::InvalidRef(_)) => rejected("funny refname"),
        Err(e) => Err(e.into()),
    }
}

/// A conservative subset of git's reference name rules.
fn is_valid_ref_name(name: &str) -> bool {
    name.starts_with("refs/")
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.ends_with('.')
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .bytes()
            .any(|b| b.is_ascii_control() || b" ~^:?*[\\".contains(&b))
        && name.split('/').all(|part| !part.is_empty() && !part.starts_with('.'))
}
