//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

use crate::delta::apply_delta;
use crate::deadline::Deadline;
use crate::{GitError, Result};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use ghb_storage::{GitObject, GitStore, ObjectId, ObjectType};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Write;

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we support.
const PACK_VERSION: u32 = 2;
/// Header length: signature, version and object count.
const HEADER_LEN: usize = 12;
/// Trailing SHA-1 checksum length.
const TRAILER_LEN: usize = 20;

const OBJ_OFS_DELTA: u8 = 6;
const OBJ_REF_DELTA: u8 = 7;

/// Upper bound in bytes on capacity reserved up front from sizes a pack declares.
const MAX_PREALLOC: usize = 1 << 20;

/// Builds a pack file from a set of objects.
///
/// Objects are stored whole; the builder never emits deltas.
#[derive(Default)]
pub struct PackBuilder {
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects were added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();

        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        for object in &self.objects {
            write_entry_header(&mut pack, object.object_type.pack_type(), object.data.len());
            pack.extend_from_slice(&compress(&object.data)?);
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);

        Ok(pack)
    }
}

/// Writes an entry header: type in bits 4-6 of the first byte, size as a
/// little-endian base-128 number starting in the low nibble.
fn write_entry_header(pack: &mut Vec<u8>, type_code: u8, size: usize) {
    let mut first_byte = (type_code << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;
    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Where a delta finds its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeltaBase {
    Offset(usize),
    Id(ObjectId),
}

enum Entry {
    Whole(ObjectType, Vec<u8>),
    Delta(DeltaBase, Vec<u8>),
}

struct PendingDelta {
    offset: usize,
    base: DeltaBase,
    delta: Vec<u8>,
}

/// Parses a pack file and extracts objects.
///
/// Both `OFS_DELTA` and `REF_DELTA` entries are resolved. A `REF_DELTA`
/// whose base is not in the pack is looked up in the store, which allows
/// thin packs.
pub struct PackParser<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: 0,
        }
    }

    /// Parses the pack, returning every object it contains in resolved form.
    ///
    /// Objects are not written anywhere; `bases` is only read to resolve
    /// thin-pack deltas. The deadline is checked between entries.
    pub fn parse<S: GitStore + ?Sized>(
        &mut self,
        bases: &S,
        deadline: &Deadline,
    ) -> Result<Vec<GitObject>> {
        let object_count = self.read_header()?;

        let max_objects = MAX_PREALLOC / std::mem::size_of::<GitObject>();
        let mut objects: Vec<GitObject> = Vec::with_capacity(object_count.min(max_objects));
        let mut by_offset: HashMap<usize, usize> = HashMap::new();
        let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
        let mut pending: Vec<PendingDelta> = Vec::new();

        for _ in 0..object_count {
            deadline.check()?;
            let offset = self.pos;

            let object = match self.read_entry(offset)? {
                Entry::Whole(object_type, data) => GitObject::new(object_type, data),
                Entry::Delta(base, delta) => {
                    let resolved = match base {
                        DeltaBase::Offset(base_offset) => by_offset
                            .get(&base_offset)
                            .map(|&idx| resolve(&objects[idx], &delta))
                            .transpose()?,
                        DeltaBase::Id(id) => match by_id.get(&id) {
                            Some(&idx) => Some(resolve(&objects[idx], &delta)?),
                            None if bases.has_object(&id)? => {
                                Some(resolve(&bases.read_object(&id)?, &delta)?)
                            }
                            None => None,
                        },
                    };
                    match resolved {
                        Some(object) => object,
                        None => {
                            pending.push(PendingDelta {
                                offset,
                                base,
                                delta,
                            });
                            continue;
                        }
                    }
                }
            };

            by_offset.insert(offset, objects.len());
            by_id.insert(object.id, objects.len());
            objects.push(object);
        }

        if self.pos != self.end {
            return Err(GitError::InvalidPack(format!(
                "{} unexpected bytes before checksum",
                self.end - self.pos
            )));
        }

        // Deltas whose base appeared later in the pack.
        while !pending.is_empty() {
            deadline.check()?;
            let before = pending.len();
            let mut still_pending = Vec::new();
            for entry in pending {
                let base_idx = match entry.base {
                    DeltaBase::Offset(off) => by_offset.get(&off).copied(),
                    DeltaBase::Id(id) => by_id.get(&id).copied(),
                };
                match base_idx {
                    Some(idx) => {
                        let object = resolve(&objects[idx], &entry.delta)?;
                        by_offset.insert(entry.offset, objects.len());
                        by_id.insert(object.id, objects.len());
                        objects.push(object);
                    }
                    None => still_pending.push(entry),
                }
            }
            if still_pending.len() == before {
                let missing = match still_pending[0].base {
                    DeltaBase::Offset(off) => format!("offset {}", off),
                    DeltaBase::Id(id) => id.to_hex(),
                };
                return Err(GitError::InvalidPack(format!(
                    "delta base {} not found",
                    missing
                )));
            }
            pending = still_pending;
        }

        Ok(objects)
    }

    /// Validates header and trailer, returning the declared object count.
    fn read_header(&mut self) -> Result<usize> {
        if self.data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(GitError::InvalidPack("pack too small".to_string()));
        }

        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }

        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != PACK_VERSION {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }

        self.end = self.data.len() - TRAILER_LEN;
        let computed = Sha1::digest(&self.data[..self.end]);
        if computed.as_slice() != &self.data[self.end..] {
            return Err(GitError::InvalidPack("checksum mismatch".to_string()));
        }

        self.pos = HEADER_LEN;
        let count =
            u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]) as usize;
        // Every entry takes at least two bytes.
        if count > (self.end - self.pos) / 2 {
            return Err(GitError::InvalidPack(format!(
                "{} objects cannot fit in {} bytes",
                count,
                self.end - self.pos
            )));
        }
        Ok(count)
    }

    fn next_byte(&mut self) -> Result<u8> {
        if self.pos >= self.end {
            return Err(GitError::InvalidPack("unexpected end of pack".to_string()));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Reads one entry starting at `offset`.
    fn read_entry(&mut self, offset: usize) -> Result<Entry> {
        let first_byte = self.next_byte()?;
        let type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as usize;
        let mut shift = 4u32;

        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = self.next_byte()?;
            if shift >= usize::BITS - 7 {
                return Err(GitError::InvalidPack("object size overflow".to_string()));
            }
            size |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
        }

        match type_code {
            OBJ_OFS_DELTA => {
                let distance = self.read_offset()?;
                let base_offset = offset.checked_sub(distance).filter(|_| distance > 0).ok_or_else(
                    || GitError::InvalidPack(format!("delta base offset {} out of range", distance)),
                )?;
                let delta = self.inflate(size)?;
                Ok(Entry::Delta(DeltaBase::Offset(base_offset), delta))
            }
            OBJ_REF_DELTA => {
                if self.pos + 20 > self.end {
                    return Err(GitError::InvalidPack("truncated delta base id".to_string()));
                }
                let base = ObjectId::from_slice(&self.data[self.pos..self.pos + 20])?;
                self.pos += 20;
                let delta = self.inflate(size)?;
                Ok(Entry::Delta(DeltaBase::Id(base), delta))
            }
            code => {
                let object_type = ObjectType::from_pack_type(code)
                    .map_err(|e| GitError::InvalidPack(e.to_string()))?;
                let data = self.inflate(size)?;
                Ok(Entry::Whole(object_type, data))
            }
        }
    }

    /// Reads the negative offset of an `OFS_DELTA` base.
    fn read_offset(&mut self) -> Result<usize> {
        let mut byte = self.next_byte()?;
        let mut value = (byte & 0x7F) as usize;
        while byte & 0x80 != 0 {
            byte = self.next_byte()?;
            value = value
                .checked_add(1)
                .and_then(|v| v.checked_mul(128))
                .ok_or_else(|| GitError::InvalidPack("delta offset overflow".to_string()))?
                | (byte & 0x7F) as usize;
        }
        Ok(value)
    }

    /// Inflates one zlib stream that must produce exactly `expected` bytes.
    fn inflate(&mut self, expected: usize) -> Result<Vec<u8>> {
        let input = &self.data[self.pos..self.end];
        let mut inflater = Decompress::new(true);
        let mut out = Vec::with_capacity(expected.min(MAX_PREALLOC) + 1);

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = inflater.total_in() as usize;
            let produced = out.len();
            let status = inflater
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| GitError::InvalidPack(format!("decompression failed: {}", e)))?;

            if out.len() > expected {
                return Err(GitError::InvalidPack(
                    "object larger than its declared size".to_string(),
                ));
            }
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if inflater.total_in() as usize == consumed && out.len() == produced {
                        return Err(GitError::InvalidPack("truncated object data".to_string()));
                    }
                }
            }
        }

        if out.len() != expected {
            return Err(GitError::InvalidPack(format!(
                "object size mismatch: declared {}, inflated {}",
                expected,
                out.len()
            )));
        }

        self.pos += inflater.total_in() as usize;
        Ok(out)
    }
}

fn resolve(base: &GitObject, delta: &[u8]) -> Result<GitObject> {
    let data = apply_delta(&base.data, delta)?;
    Ok(GitObject::new(base.object_type, data))
}
