//! Git delta instruction decoding.
//!
//! A delta starts with the base and result sizes as little-endian base-128
//! varints, followed by copy instructions (high bit set: copy a range of the
//! base) and insert instructions (1..=127: copy that many literal bytes).

use crate::{GitError, Result};

/// A copy instruction with an encoded size of zero copies this many bytes.
const DEFAULT_COPY_SIZE: usize = 0x10000;

/// Upper bound on the capacity reserved up front for a delta result.
const MAX_PREALLOC: usize = 1 << 20;

/// Applies `delta` to `base`, producing the target object's content.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor { data: delta, pos: 0 };

    let base_size = cursor.varint()?;
    if base_size != base.len() {
        return Err(invalid(format!(
            "delta expects a {} byte base, found {}",
            base_size,
            base.len()
        )));
    }
    let result_size = cursor.varint()?;

    let mut out = Vec::with_capacity(result_size.min(MAX_PREALLOC));
    while let Some(op) = cursor.next_byte() {
        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    offset |= (cursor.byte()? as usize) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    size |= (cursor.byte()? as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = DEFAULT_COPY_SIZE;
            }

            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| invalid("delta copy outside of base".to_string()))?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            out.extend_from_slice(cursor.take(op as usize)?);
        } else {
            return Err(invalid("reserved delta opcode 0".to_string()));
        }

        if out.len() > result_size {
            return Err(invalid("delta result exceeds declared size".to_string()));
        }
    }

    if out.len() != result_size {
        return Err(invalid(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            result_size
        )));
    }
    Ok(out)
}

fn invalid(msg: String) -> GitError {
    GitError::InvalidPack(msg)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn byte(&mut self) -> Result<u8> {
        self.next_byte()
            .ok_or_else(|| invalid("truncated delta".to_string()))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| invalid("truncated delta insert".to_string()))?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<usize> {
        let mut value = 0usize;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            if shift >= usize::BITS {
                return Err(invalid("delta size overflow".to_string()));
            }
            value |= ((b & 0x7f) as usize) << shift;
            shift += 7;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn varint(mut n: usize, out: &mut Vec<u8>) {
        loop {
            let b = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                out.push(b);
                return;
            }
            out.push(b | 0x80);
        }
    }

    /// Builds a delta that keeps the first `keep` bytes of `base` and appends `tail`.
    pub(crate) fn prefix_delta(base: &[u8], keep: usize, tail: &[u8]) -> Vec<u8> {
        let mut delta = Vec::new();
        varint(base.len(), &mut delta);
        varint(keep + tail.len(), &mut delta);
        if keep > 0 {
            // copy: offset 0 (no offset bytes), size in two bytes
            delta.push(0x80 | 0x10 | 0x20);
            delta.push((keep & 0xff) as u8);
            delta.push(((keep >> 8) & 0xff) as u8);
        }
        for chunk in tail.chunks(0x7f) {
            delta.push(chunk.len() as u8);
            delta.extend_from_slice(chunk);
        }
        delta
    }

    #[test]
    fn test_copy_and_insert() {
        let base = b"hello world\n";
        let delta = prefix_delta(base, 6, b"rust\n");
        assert_eq!(apply_delta(base, &delta).unwrap(), b"hello rust\n");
    }

    #[test]
    fn test_copy_with_offset() {
        let base = b"0123456789";
        let mut delta = Vec::new();
        varint(base.len(), &mut delta);
        varint(4, &mut delta);
        delta.extend_from_slice(&[0x80 | 0x01 | 0x10, 3, 4]);
        assert_eq!(apply_delta(base, &delta).unwrap(), b"3456");
    }

    #[test]
    fn test_base_size_mismatch() {
        let delta = prefix_delta(b"abc", 1, b"x");
        assert!(apply_delta(b"abcd", &delta).is_err());
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let base = b"short";
        let mut delta = Vec::new();
        varint(base.len(), &mut delta);
        varint(10, &mut delta);
        delta.extend_from_slice(&[0x80 | 0x10, 10]);
        assert!(matches!(apply_delta(base, &delta), Err(GitError::InvalidPack(_))));
    }

    #[test]
    fn test_reserved_opcode() {
        let mut delta = Vec::new();
        varint(0, &mut delta);
        varint(1, &mut delta);
        delta.push(0);
        assert!(apply_delta(b"", &delta).is_err());
    }

    #[test]
    fn test_result_size_mismatch() {
        let mut delta = prefix_delta(b"abc", 3, b"");
        delta[1] = 9;
        assert!(apply_delta(b"abc", &delta).is_err());
    }

    #[test]
    fn test_truncated_insert() {
        let mut delta = Vec::new();
        varint(0, &mut delta);
        varint(5, &mut delta);
        delta.push(5);
        delta.extend_from_slice(b"ab");
        assert!(apply_delta(b"", &delta).is_err());
    }
}
