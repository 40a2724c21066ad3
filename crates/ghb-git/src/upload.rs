//! Upload-pack: fetch negotiation and pack generation.
//!
//! Each stateless request carries the client's full state: its wants, its
//! shallow boundary and depth, then the haves it has accumulated so far.
//! The server answers with the first common commit (`ACK`) or `NAK`, and
//! sends a pack once the client says `done`.

use crate::capability::{Capability, CapabilityList};
use crate::deadline::Deadline;
use crate::pack::PackBuilder;
use crate::pktline::{Band, PktLine, PktLineReader, PktLineWriter, Sideband};
use crate::{parse_object_id, GitError, Result};
use ghb_storage::{GitObject, GitStore, ObjectId, ObjectType, Reference, StorageError};
use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};

/// A parsed upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPackRequest {
    /// Objects the client wants, in request order without duplicates.
    pub wants: Vec<ObjectId>,
    /// Objects the client claims to have.
    pub haves: Vec<ObjectId>,
    /// The client's current shallow boundary.
    pub shallows: Vec<ObjectId>,
    /// Requested history depth, counted in commits from each want.
    pub depth: Option<u32>,
    /// Capabilities named on the first want line.
    pub capabilities: CapabilityList,
    /// Whether the client ended negotiation with `done`.
    pub done: bool,
}

impl UploadPackRequest {
    /// Parses a request body.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        for pkt in pkt_reader.frames() {
            let pkt = pkt?;
            let line = request_line(&pkt)?;

            if let Some(rest) = line.strip_prefix("want ") {
                let (id, caps) = match rest.find([' ', '\0']) {
                    Some(split) => (&rest[..split], Some(&rest[split + 1..])),
                    None => (rest, None),
                };
                if request.wants.is_empty() {
                    if let Some(caps) = caps {
                        request.capabilities = CapabilityList::parse(caps);
                    }
                }
                push_unique(&mut request.wants, parse_object_id(id)?);
            } else if let Some(id) = line.strip_prefix("shallow ") {
                push_unique(&mut request.shallows, parse_object_id(id)?);
            } else if let Some(depth) = line.strip_prefix("deepen ") {
                let depth = depth
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| GitError::Protocol(format!("invalid depth {:?}", depth)))?;
                request.depth = Some(depth);
            } else {
                return Err(GitError::Protocol(format!(
                    "unexpected line in want section: {:?}",
                    line
                )));
            }
        }

        // Have batches are separated by flushes; `done` or end of input ends them.
        while let Some(pkt) = pkt_reader.read()? {
            if pkt.is_flush() {
                continue;
            }
            let line = request_line(&pkt)?;
            if let Some(id) = line.strip_prefix("have ") {
                push_unique(&mut request.haves, parse_object_id(id)?);
            } else if line == "done" {
                request.done = true;
                break;
            } else {
                return Err(GitError::Protocol(format!(
                    "unexpected line in have section: {:?}",
                    line
                )));
            }
        }

        Ok(request)
    }

    /// Writes the request the way a fetching client sends it.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        for (i, want) in self.wants.iter().enumerate() {
            if i == 0 && !self.capabilities.is_empty() {
                pkt_writer.write_line(&format!("want {} {}", want, self.capabilities))?;
            } else {
                pkt_writer.write_line(&format!("want {}", want))?;
            }
        }
        for shallow in &self.shallows {
            pkt_writer.write_line(&format!("shallow {}", shallow))?;
        }
        if let Some(depth) = self.depth {
            pkt_writer.write_line(&format!("deepen {}", depth))?;
        }
        pkt_writer.flush_pkt()?;

        for have in &self.haves {
            pkt_writer.write_line(&format!("have {}", have))?;
        }
        if self.done {
            pkt_writer.write_line("done")?;
        } else {
            pkt_writer.flush_pkt()?;
        }

        pkt_writer.flush()?;
        Ok(())
    }

    /// Whether the server must answer this request with a pack.
    ///
    /// Only `done` ends a stateless negotiation. A shallow fetch first asks
    /// for its shallow list without haves or `done` and sends `done` later.
    pub fn expects_pack(&self) -> bool {
        self.done
    }
}

fn request_line(pkt: &PktLine) -> Result<&str> {
    match pkt {
        PktLine::Data(_) => pkt
            .as_str()
            .ok_or_else(|| GitError::Protocol("request line is not UTF-8".to_string())),
        other => Err(GitError::Protocol(format!("unexpected packet {:?}", other))),
    }
}

fn push_unique(ids: &mut Vec<ObjectId>, id: ObjectId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Changes to the client's shallow boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowUpdate {
    /// Commits that become shallow: sent without their parents.
    pub shallows: Vec<ObjectId>,
    /// Previously shallow commits whose parents are now sent.
    pub unshallows: Vec<ObjectId>,
}

/// The server's answer to an upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPackResponse {
    /// Present whenever the request asked for a depth.
    pub shallow_update: Option<ShallowUpdate>,
    /// First have the server also has; `None` answers `NAK`.
    pub common: Option<ObjectId>,
    /// The pack, once negotiation is over.
    pub pack: Option<Vec<u8>>,
    /// Number of objects in the pack.
    pub object_count: usize,
    /// Side-band flavour to wrap the pack in.
    pub sideband: Option<Sideband>,
    /// Whether progress messages go out on band 2.
    pub progress: bool,
}

impl UploadPackResponse {
    /// Writes the response body.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        if let Some(update) = &self.shallow_update {
            for id in &update.shallows {
                pkt_writer.write_line(&format!("shallow {}", id))?;
            }
            for id in &update.unshallows {
                pkt_writer.write_line(&format!("unshallow {}", id))?;
            }
            pkt_writer.flush_pkt()?;
        }

        match self.common {
            Some(id) => pkt_writer.write_line(&format!("ACK {}", id))?,
            None => pkt_writer.write_line("NAK")?,
        }

        if let Some(pack) = &self.pack {
            match self.sideband {
                Some(mode) => {
                    if self.progress {
                        let msg = format!("Total {} (delta 0), reused 0 (delta 0)\n", self.object_count);
                        pkt_writer.write_band(mode, Band::Progress, msg.as_bytes())?;
                    }
                    pkt_writer.write_band(mode, Band::Data, pack)?;
                    pkt_writer.flush_pkt()?;
                }
                None => pkt_writer.write_raw(pack)?,
            }
        }

        pkt_writer.flush()?;
        Ok(())
    }

    /// Parses a response to `request`, as a fetching client would.
    ///
    /// The pack, when present, is returned without its side-band framing.
    pub fn decode<R: Read>(reader: R, request: &UploadPackRequest) -> Result<Self> {
        let caps = request.capabilities.intersect(&CapabilityList::upload_pack());
        let mut pkt_reader = PktLineReader::new(reader);
        let mut response = Self {
            sideband: caps.sideband(),
            progress: !caps.contains(&Capability::NoProgress),
            ..Self::default()
        };

        if request.depth.is_some() {
            let mut update = ShallowUpdate::default();
            for pkt in pkt_reader.frames() {
                let pkt = pkt?;
                let line = request_line(&pkt)?;
                if let Some(id) = line.strip_prefix("shallow ") {
                    update.shallows.push(parse_object_id(id)?);
                } else if let Some(id) = line.strip_prefix("unshallow ") {
                    update.unshallows.push(parse_object_id(id)?);
                } else {
                    return Err(GitError::Protocol(format!("unexpected shallow line {:?}", line)));
                }
            }
            response.shallow_update = Some(update);
        }

        let pkt = pkt_reader
            .read()?
            .ok_or_else(|| GitError::Protocol("missing ACK/NAK".to_string()))?;
        let line = request_line(&pkt)?;
        if let Some(rest) = line.strip_prefix("ACK ") {
            let id = rest.split(' ').next().unwrap_or_default();
            response.common = Some(parse_object_id(id)?);
        } else if line != "NAK" {
            return Err(GitError::Protocol(format!("expected ACK or NAK, got {:?}", line)));
        }

        if request.expects_pack() {
            let pack = match response.sideband {
                Some(_) => pkt_reader.read_sideband()?.data,
                None => {
                    let mut pack = Vec::new();
                    pkt_reader.inner_mut().read_to_end(&mut pack)?;
                    pack
                }
            };
            if pack.len() >= 12 {
                response.object_count =
                    u32::from_be_bytes([pack[8], pack[9], pack[10], pack[11]]) as usize;
            }
            response.pack = Some(pack);
        }

        Ok(response)
    }
}

/// Runs one upload-pack round against `store`.
///
/// Every want must exist. Unknown haves are ignored. The reachability walk
/// stops at objects the client already has and, when a depth is requested,
/// at the depth boundary.
pub fn negotiate<S: GitStore + ?Sized>(
    store: &S,
    request: &UploadPackRequest,
    deadline: &Deadline,
) -> Result<UploadPackResponse> {
    deadline.check()?;

    if request.wants.is_empty() {
        return Err(GitError::Protocol("request has no want lines".to_string()));
    }
    for want in &request.wants {
        if !store.has_object(want)? {
            return Err(GitError::ObjectNotFound(*want));
        }
    }

    let caps = request.capabilities.intersect(&CapabilityList::upload_pack());
    let depth = request.depth.filter(|d| *d > 0);
    let client_shallow: HashSet<ObjectId> = request.shallows.iter().copied().collect();

    let mut common = Vec::new();
    for have in &request.haves {
        if store.has_object(have)? {
            common.push(*have);
        }
    }

    let mut response = UploadPackResponse {
        common: common.first().copied(),
        sideband: caps.sideband(),
        progress: !caps.contains(&Capability::NoProgress),
        ..UploadPackResponse::default()
    };

    if depth.is_none() && !request.expects_pack() {
        tracing::debug!(haves = request.haves.len(), common = common.len(), "Negotiation round without pack");
        return Ok(response);
    }

    let have_set = have_closure(store, &common, &client_shallow, deadline)?;
    let mut selection = Selection::default();
    selection.walk_wants(store, &request.wants, &have_set, &client_shallow, depth, deadline)?;

    if depth.is_some() {
        response.shallow_update = Some(ShallowUpdate {
            shallows: std::mem::take(&mut selection.shallows),
            unshallows: std::mem::take(&mut selection.unshallows),
        });
    }

    if request.expects_pack() {
        if caps.contains(&Capability::IncludeTag) {
            selection.include_tags(store, &have_set)?;
        }

        let mut builder = PackBuilder::new();
        for object in selection.objects {
            builder.add(object);
        }
        response.object_count = builder.len();
        response.pack = Some(builder.build()?);
    }

    tracing::debug!(
        wants = request.wants.len(),
        haves = request.haves.len(),
        common = common.len(),
        objects = response.object_count,
        depth = ?depth,
        "Upload-pack negotiated"
    );

    Ok(response)
}

/// Reads an object the walk cannot do without.
fn load<S: GitStore + ?Sized>(store: &S, id: &ObjectId) -> Result<GitObject> {
    match store.read_object(id) {
        Ok(object) => Ok(object),
        Err(StorageError::ObjectNotFound(_)) => Err(GitError::ObjectNotFound(*id)),
        Err(e) => Err(e.into()),
    }
}

/// Every object reachable from `roots`, not crossing into the parents of
/// shallow commits. Objects missing from the store are counted as had.
fn have_closure<S: GitStore + ?Sized>(
    store: &S,
    roots: &[ObjectId],
    shallow: &HashSet<ObjectId>,
    deadline: &Deadline,
) -> Result<HashSet<ObjectId>> {
    let mut seen = HashSet::new();
    let mut stack = roots.to_vec();

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        deadline.check()?;

        let object = match store.read_object(&id) {
            Ok(object) => object,
            Err(StorageError::ObjectNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        match object.object_type {
            ObjectType::Commit => {
                let header = object.parse_commit()?;
                stack.push(header.tree);
                if !shallow.contains(&id) {
                    stack.extend(header.parents);
                }
            }
            ObjectType::Tree => {
                stack.extend(
                    object
                        .parse_tree()?
                        .into_iter()
                        .filter(|entry| !entry.is_gitlink())
                        .map(|entry| entry.id),
                );
            }
            ObjectType::Tag => stack.push(object.tag_target()?),
            ObjectType::Blob => {}
        }
    }

    Ok(seen)
}

/// Objects chosen for the pack, plus the resulting shallow boundary.
#[derive(Default)]
struct Selection {
    objects: Vec<GitObject>,
    included: HashSet<ObjectId>,
    shallows: Vec<ObjectId>,
    unshallows: Vec<ObjectId>,
}

impl Selection {
    fn include(&mut self, object: GitObject) {
        if self.included.insert(object.id) {
            self.objects.push(object);
        }
    }

    fn walk_wants<S: GitStore + ?Sized>(
        &mut self,
        store: &S,
        wants: &[ObjectId],
        have_set: &HashSet<ObjectId>,
        client_shallow: &HashSet<ObjectId>,
        depth: Option<u32>,
        deadline: &Deadline,
    ) -> Result<()> {
        let mut queue: VecDeque<(ObjectId, u32)> = VecDeque::new();
        let mut roots: Vec<ObjectId> = Vec::new();

        // Peel tags down to the commit, tree or blob they name.
        for want in wants {
            let mut id = *want;
            loop {
                let object = load(store, &id)?;
                match object.object_type {
                    ObjectType::Tag => {
                        id = object.tag_target()?;
                        if !have_set.contains(&object.id) {
                            self.include(object);
                        }
                    }
                    ObjectType::Commit => {
                        queue.push_back((id, 1));
                        break;
                    }
                    ObjectType::Tree | ObjectType::Blob => {
                        roots.push(id);
                        break;
                    }
                }
            }
        }

        let mut visited = HashSet::new();
        let mut trees = Vec::new();
        while let Some((id, distance)) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            deadline.check()?;

            let was_shallow = depth.is_some() && client_shallow.contains(&id);
            if have_set.contains(&id) && !was_shallow {
                continue;
            }

            let commit = load(store, &id)?;
            let header = commit.parse_commit()?;
            if !have_set.contains(&id) {
                trees.push(header.tree);
                self.include(commit);
            }

            if let Some(limit) = depth {
                if distance >= limit {
                    if !header.parents.is_empty() && !client_shallow.contains(&id) {
                        self.shallows.push(id);
                    }
                    continue;
                }
            }

            if was_shallow {
                self.unshallows.push(id);
            }
            for parent in header.parents {
                queue.push_back((parent, distance + 1));
            }
        }

        for root in trees.into_iter().chain(roots) {
            self.walk_tree(store, root, have_set, deadline)?;
        }
        Ok(())
    }

    fn walk_tree<S: GitStore + ?Sized>(
        &mut self,
        store: &S,
        root: ObjectId,
        have_set: &HashSet<ObjectId>,
        deadline: &Deadline,
    ) -> Result<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if have_set.contains(&id) || self.included.contains(&id) {
                continue;
            }
            deadline.check()?;

            let object = load(store, &id)?;
            if object.object_type == ObjectType::Tree {
                let entries = object.parse_tree()?;
                stack.extend(
                    entries
                        .into_iter()
                        .rev()
                        .filter(|entry| !entry.is_gitlink())
                        .map(|entry| entry.id),
                );
            }
            self.include(object);
        }
        Ok(())
    }

    /// Adds annotated tags that point at objects being sent.
    fn include_tags<S: GitStore + ?Sized>(
        &mut self,
        store: &S,
        have_set: &HashSet<ObjectId>,
    ) -> Result<()> {
        let mut tags: Vec<(String, ObjectId)> = store
            .list_refs()?
            .into_iter()
            .filter(|(name, _)| name.starts_with("refs/tags/"))
            .filter_map(|(name, reference)| match reference {
                Reference::Direct(id) => Some((name, id)),
                Reference::Symbolic(_) => None,
            })
            .collect();
        tags.sort();

        for (name, id) in tags {
            if self.included.contains(&id) || have_set.contains(&id) {
                continue;
            }
            let object = match store.read_object(&id) {
                Ok(object) if object.object_type == ObjectType::Tag => object,
                _ => continue,
            };
            if self.included.contains(&object.tag_target()?) {
                tracing::trace!(tag = %name, "Including tag");
                self.include(object);
            }
        }
        Ok(())
    }
}
