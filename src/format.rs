// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Index file format: magic number, header, and the tree payloads.
//!
//! Everything here is big-endian on disk (see [`crate::coding`]). Offsets
//! are 64-bit throughout one file.

use crate::arena::Offset;
use crate::avl::{Annotation, Key, Payload};
use crate::coding::{DiskRecord, FieldReader, FieldWriter};
use crate::parser::Time;
use std::cmp::Ordering;

/// 8 ASCII bytes of magic at offset 0.
pub const MAGIC: [u8; 8] = *b"TARMACIX";

/// Current format version, stored after the magic.
pub const FORMAT_VERSION: u16 = 1;

/// Length of the magic-number prefix (magic + version).
pub const MAGIC_LEN: usize = 10;

/// Set only after indexing finished successfully.
pub const FLAG_COMPLETE: u32 = 1;
/// The trace was indexed as big-endian.
pub const FLAG_BIGEND: u32 = 2;
/// At least one AArch64 instruction was seen.
pub const FLAG_AARCH64_USED: u32 = 4;

/// PC value meaning "no instruction has executed at this timestamp".
pub const KNOWN_INVALID_PC: u64 = u64::MAX;

/// Memory payload type tag for guest memory.
pub const MEM_TYPE_MEMORY: u8 = b'm';
/// Memory payload type tag for register space.
pub const MEM_TYPE_REGISTER: u8 = b'r';

/// Depth value terminating every call-depth array.
///
/// Strictly less than `u32::MAX`, so a query depth of `u32::MAX` compares
/// greater than the sentinel itself; the array binary search relies on
/// that to mean "the whole subtree".
pub const SENTINEL_DEPTH: u32 = u32::MAX - 1;

/// File header, directly after the magic number.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeader {
    pub flags: u32,
    pub seqroot: Offset,
    pub bypcroot: Offset,
    /// Difference between physical file lines and indexed line numbers
    /// (lines before the first event are not indexed).
    pub lineno_offset: u32,
}

impl DiskRecord for FileHeader {
    const LEN: usize = 4 + 8 + 8 + 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.flags);
        w.put(&self.seqroot);
        w.put(&self.bypcroot);
        w.put(&self.lineno_offset);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            flags: r.get(),
            seqroot: r.get(),
            bypcroot: r.get(),
            lineno_offset: r.get(),
        }
    }
}

/// One sequence-tree node: everything that happened at one timestamp.
///
/// Keyed by `trace_file_firstline`; the indexer guarantees the line ranges
/// of consecutive payloads tile without overlap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeqOrderPayload {
    pub mod_time: Time,
    pub pc: u64,
    /// Byte extent of this timestamp's lines in the trace file.
    pub trace_file_pos: u64,
    pub trace_file_len: u64,
    pub trace_file_firstline: u32,
    pub trace_file_lines: u32,
    /// Root of the memory/register snapshot after this timestamp.
    pub memory_root: Offset,
    /// Function call nesting depth, filled in by the post-pass.
    pub call_depth: u32,
}

impl DiskRecord for SeqOrderPayload {
    const LEN: usize = 8 + 8 + 8 + 8 + 4 + 4 + 8 + 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.mod_time);
        w.put(&self.pc);
        w.put(&self.trace_file_pos);
        w.put(&self.trace_file_len);
        w.put(&self.trace_file_firstline);
        w.put(&self.trace_file_lines);
        w.put(&self.memory_root);
        w.put(&self.call_depth);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            mod_time: r.get(),
            pc: r.get(),
            trace_file_pos: r.get(),
            trace_file_len: r.get(),
            trace_file_firstline: r.get(),
            trace_file_lines: r.get(),
            memory_root: r.get(),
            call_depth: r.get(),
        }
    }
}

impl Payload for SeqOrderPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        self.trace_file_firstline.cmp(&other.trace_file_firstline)
    }
}

/// Sequence-tree annotation: where this subtree's call-depth array lives.
///
/// The array itself (see [`CallDepthArrayEntry`]) is the structure that
/// makes fold-aware line translation logarithmic.
#[derive(Clone, Debug, Default)]
pub struct SeqOrderAnnotation {
    pub call_depth_array: Offset,
    pub call_depth_arraylen: u32,
}

impl DiskRecord for SeqOrderAnnotation {
    const LEN: usize = 8 + 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.call_depth_array);
        w.put(&self.call_depth_arraylen);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            call_depth_array: r.get(),
            call_depth_arraylen: r.get(),
        }
    }
}

impl Annotation<SeqOrderPayload> for SeqOrderAnnotation {
    // The array is built by a dedicated post-order pass once the tree is
    // final, not incrementally; during construction the annotation is
    // just a placeholder.
    fn from_payload(_: &SeqOrderPayload) -> Self {
        Self::default()
    }

    fn combine(_: &Self, _: &Self) -> Self {
        Self::default()
    }
}

/// One entry of a node's call-depth array.
///
/// Entries are sorted by strictly increasing `call_depth` and terminated
/// by a [`SENTINEL_DEPTH`] entry holding the subtree totals. Counts are
/// cumulative over the entries before this one; the links say which entry
/// to continue from when descending into the left or right child.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallDepthArrayEntry {
    pub call_depth: u32,
    pub cumulative_lines: u32,
    pub cumulative_insns: u32,
    pub leftlink: u32,
    pub rightlink: u32,
}

impl DiskRecord for CallDepthArrayEntry {
    const LEN: usize = 5 * 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.call_depth);
        w.put(&self.cumulative_lines);
        w.put(&self.cumulative_insns);
        w.put(&self.leftlink);
        w.put(&self.rightlink);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            call_depth: r.get(),
            cumulative_lines: r.get(),
            cumulative_insns: r.get(),
            leftlink: r.get(),
            rightlink: r.get(),
        }
    }
}

/// By-PC tree payload, keyed by `(pc, trace_file_firstline)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ByPCPayload {
    pub pc: u64,
    pub trace_file_firstline: u32,
}

impl DiskRecord for ByPCPayload {
    const LEN: usize = 8 + 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.pc);
        w.put(&self.trace_file_firstline);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            pc: r.get(),
            trace_file_firstline: r.get(),
        }
    }
}

impl Payload for ByPCPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        (self.pc, self.trace_file_firstline).cmp(&(other.pc, other.trace_file_firstline))
    }
}

/// One contiguous known (or partially known) region of a memory snapshot.
///
/// `raw` regions point at `hi - lo + 1` literal bytes in the arena. Sub
/// regions point at a root *cell* (a stored offset) of a
/// [`MemorySubPayload`] tree recording only the bytes that became known
/// later; the indirection lets a read event populate every historical
/// snapshot that contains the region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryPayload {
    /// [`MEM_TYPE_MEMORY`] or [`MEM_TYPE_REGISTER`].
    pub ty: u8,
    pub lo: u64,
    pub hi: u64,
    pub raw: bool,
    /// Arena offset of the bytes (raw) or of the sub-root cell (sub).
    pub contents: Offset,
    /// Line of the write that created this region.
    pub trace_file_firstline: u32,
}

impl DiskRecord for MemoryPayload {
    const LEN: usize = 1 + 8 + 8 + 1 + 8 + 4;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.ty);
        w.put(&self.lo);
        w.put(&self.hi);
        w.put(&u8::from(self.raw));
        w.put(&self.contents);
        w.put(&self.trace_file_firstline);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            ty: r.get(),
            lo: r.get(),
            hi: r.get(),
            raw: r.get::<u8>() != 0,
            contents: r.get(),
            trace_file_firstline: r.get(),
        }
    }
}

impl Payload for MemoryPayload {
    /// Regions of the same type compare equal iff they overlap, which is
    /// how range queries find them; the no-overlap invariant makes this a
    /// total order within one tree.
    fn cmp_payload(&self, other: &Self) -> Ordering {
        match self.ty.cmp(&other.ty) {
            Ordering::Equal => {
                if self.hi < other.lo {
                    Ordering::Less
                } else if self.lo > other.hi {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            ord => ord,
        }
    }
}

/// Range probe for the memory tree.
#[derive(Clone, Copy, Debug)]
pub struct MemRangeKey {
    pub ty: u8,
    pub lo: u64,
    pub hi: u64,
}

impl Key<MemoryPayload> for MemRangeKey {
    fn cmp_key(&self, payload: &MemoryPayload) -> Ordering {
        match self.ty.cmp(&payload.ty) {
            Ordering::Equal => {
                if self.hi < payload.lo {
                    Ordering::Less
                } else if self.lo > payload.hi {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            ord => ord,
        }
    }
}

/// Memory-tree annotation: the newest write line anywhere in the subtree.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryAnnotation {
    pub latest: u32,
}

impl DiskRecord for MemoryAnnotation {
    const LEN: usize = 4;

    fn write_to(&self, buf: &mut [u8]) {
        self.latest.write_to(buf);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            latest: u32::read_from(buf),
        }
    }
}

impl Annotation<MemoryPayload> for MemoryAnnotation {
    fn from_payload(payload: &MemoryPayload) -> Self {
        Self {
            latest: payload.trace_file_firstline,
        }
    }

    fn combine(lhs: &Self, rhs: &Self) -> Self {
        Self {
            latest: lhs.latest.max(rhs.latest),
        }
    }
}

/// A known byte run inside a sub region.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemorySubPayload {
    pub lo: u64,
    pub hi: u64,
    /// Arena offset of `hi - lo + 1` literal bytes.
    pub contents: Offset,
}

impl DiskRecord for MemorySubPayload {
    const LEN: usize = 8 + 8 + 8;

    fn write_to(&self, buf: &mut [u8]) {
        let mut w = FieldWriter::new(buf);
        w.put(&self.lo);
        w.put(&self.hi);
        w.put(&self.contents);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut r = FieldReader::new(buf);
        Self {
            lo: r.get(),
            hi: r.get(),
            contents: r.get(),
        }
    }
}

impl Payload for MemorySubPayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        if self.hi < other.lo {
            Ordering::Less
        } else if self.lo > other.hi {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Range probe for a sub tree.
#[derive(Clone, Copy, Debug)]
pub struct SubRangeKey {
    pub lo: u64,
    pub hi: u64,
}

impl Key<MemorySubPayload> for SubRangeKey {
    fn cmp_key(&self, payload: &MemorySubPayload) -> Ordering {
        if self.hi < payload.lo {
            Ordering::Less
        } else if self.lo > payload.hi {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Writes the magic-number prefix into a fresh arena.
pub fn write_magic(arena: &mut crate::arena::Arena) -> std::io::Result<()> {
    let off = arena.alloc(MAGIC_LEN)?;
    debug_assert_eq!(0, off);
    arena.write_bytes(off, &MAGIC)?;
    arena.write_bytes(off + 8, &FORMAT_VERSION.to_be_bytes())
}

/// Checks the magic-number prefix of an opened arena.
pub fn check_magic(arena: &crate::arena::Arena) -> crate::Result<()> {
    if arena.curr_offset() < (MAGIC_LEN + FileHeader::LEN) as u64 {
        return Err(crate::Error::CorruptIndex("file too short"));
    }
    let mut magic = [0u8; 8];
    arena.read_bytes(0, &mut magic)?;
    if magic != MAGIC {
        return Err(crate::Error::CorruptIndex("magic number did not match"));
    }
    let mut ver = [0u8; 2];
    arena.read_bytes(8, &mut ver)?;
    if u16::from_be_bytes(ver) != FORMAT_VERSION {
        return Err(crate::Error::CorruptIndex("unsupported format version"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let seq = SeqOrderPayload {
            mod_time: 123,
            pc: 0x8000,
            trace_file_pos: 456,
            trace_file_len: 78,
            trace_file_firstline: 9,
            trace_file_lines: 3,
            memory_root: 1000,
            call_depth: 2,
        };
        let mut buf = vec![0u8; SeqOrderPayload::LEN];
        seq.write_to(&mut buf);
        assert_eq!(seq, SeqOrderPayload::read_from(&buf));

        let memp = MemoryPayload {
            ty: MEM_TYPE_MEMORY,
            lo: 0x1000,
            hi: 0x1fff,
            raw: false,
            contents: 42,
            trace_file_firstline: 7,
        };
        let mut buf = vec![0u8; MemoryPayload::LEN];
        memp.write_to(&mut buf);
        assert_eq!(memp, MemoryPayload::read_from(&buf));
    }

    #[test]
    fn memory_payloads_compare_by_overlap() {
        let mk = |ty, lo, hi| MemoryPayload {
            ty,
            lo,
            hi,
            raw: true,
            contents: 0,
            trace_file_firstline: 0,
        };
        let a = mk(MEM_TYPE_MEMORY, 0x100, 0x1ff);
        assert_eq!(Ordering::Equal, a.cmp_payload(&mk(MEM_TYPE_MEMORY, 0x1ff, 0x300)));
        assert_eq!(Ordering::Less, a.cmp_payload(&mk(MEM_TYPE_MEMORY, 0x200, 0x300)));
        assert_eq!(Ordering::Greater, a.cmp_payload(&mk(MEM_TYPE_MEMORY, 0x0, 0xff)));
        // Register space sorts after guest memory ('m' < 'r').
        assert_eq!(Ordering::Less, a.cmp_payload(&mk(MEM_TYPE_REGISTER, 0x100, 0x1ff)));
    }

    #[test]
    fn magic_round_trip() {
        let mut arena = crate::arena::Arena::new_in_memory();
        write_magic(&mut arena).unwrap();
        arena.put_new(&FileHeader::default()).unwrap();
        assert!(check_magic(&arena).is_ok());
    }
}
