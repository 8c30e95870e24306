// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Read-only queries over a finished index.
//!
//! [`IndexReader`] opens the index file (refusing anything without the
//! completion flag), re-attaches the four trees and answers lookups by
//! time, line, PC, and memory address. [`Navigator`] wraps a reader
//! together with an optional symbol table for the convenience queries
//! front-ends want.

use crate::arena::{read_at, Arena, Offset, NULL_OFF};
use crate::avl::{AvlDisk, Key, SearchStep};
use crate::coding::DiskRecord;
use crate::error::{Error, Result};
use crate::expr::{EvaluationError, ExecutionContext, ParseContext};
use crate::format::{
    check_magic, ByPCPayload, CallDepthArrayEntry, FileHeader, MemRangeKey, MemoryAnnotation,
    MemoryPayload, MemorySubPayload, SeqOrderAnnotation, SeqOrderPayload, SubRangeKey,
    FLAG_AARCH64_USED, FLAG_BIGEND, FLAG_COMPLETE, MAGIC_LEN, MEM_TYPE_REGISTER,
};
use crate::image::ImageLookup;
use crate::indexer::TracePair;
use crate::parser::Time;
use crate::registers::{
    lookup_reg_name, reg_needs_iflags, reg_offset, reg_offset_iflags, reg_size, RegisterId,
    REG_IFLAGS,
};
use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Key matching nothing, ordered so `pred` finds the last payload at or
/// before `t`.
struct SeqTimeUpperBound(Time);

impl crate::avl::Key<SeqOrderPayload> for SeqTimeUpperBound {
    fn cmp_key(&self, payload: &SeqOrderPayload) -> Ordering {
        if payload.mod_time <= self.0 {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

/// Key matching the payload whose line range contains a given line.
struct SeqLineKey(u32);

impl crate::avl::Key<SeqOrderPayload> for SeqLineKey {
    fn cmp_key(&self, payload: &SeqOrderPayload) -> Ordering {
        if self.0 < payload.trace_file_firstline {
            Ordering::Less
        } else if self.0 >= payload.trace_file_firstline + payload.trace_file_lines {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// An opened index plus its trace file.
pub struct IndexReader {
    arena: Arena,
    tarmac: File,
    pub(crate) seqtree: AvlDisk<SeqOrderPayload, SeqOrderAnnotation>,
    pub(crate) memtree: AvlDisk<MemoryPayload, MemoryAnnotation>,
    pub(crate) memsubtree: AvlDisk<MemorySubPayload>,
    pub(crate) bypctree: AvlDisk<ByPCPayload>,
    pub seqroot: Offset,
    pub bypcroot: Offset,
    pub bigend: bool,
    pub aarch64_used: bool,
    pub lineno_offset: u32,
    index_filename: Option<PathBuf>,
    tarmac_filename: PathBuf,
}

impl IndexReader {
    /// Opens an index file, verifying magic, version and completeness.
    pub fn open(trace: &TracePair) -> Result<Self> {
        let file = File::open(&trace.index_filename)?;
        let arena = Arena::open_readonly(file)?;
        let mut reader = Self::from_arena_inner(arena, trace.tarmac_filename.clone())?;
        reader.index_filename = Some(trace.index_filename.clone());
        Ok(reader)
    }

    /// Wraps an arena that was just built in memory.
    pub fn from_arena(arena: Arena, tarmac_filename: &Path) -> Result<Self> {
        Self::from_arena_inner(arena, tarmac_filename.to_path_buf())
    }

    fn from_arena_inner(arena: Arena, tarmac_filename: PathBuf) -> Result<Self> {
        check_magic(&arena)?;
        let header: FileHeader = arena.get(MAGIC_LEN as u64)?;
        if header.flags & FLAG_COMPLETE == 0 {
            return Err(Error::CorruptIndex("indexing did not complete"));
        }

        let tarmac = File::open(&tarmac_filename)?;

        Ok(Self {
            seqtree: AvlDisk::attach(&arena),
            memtree: AvlDisk::attach(&arena),
            memsubtree: AvlDisk::attach(&arena),
            bypctree: AvlDisk::attach(&arena),
            seqroot: header.seqroot,
            bypcroot: header.bypcroot,
            bigend: header.flags & FLAG_BIGEND != 0,
            aarch64_used: header.flags & FLAG_AARCH64_USED != 0,
            lineno_offset: header.lineno_offset,
            index_filename: None,
            tarmac_filename,
            arena,
            tarmac,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn index_filename(&self) -> Option<&Path> {
        self.index_filename.as_deref()
    }

    pub fn tarmac_filename(&self) -> &Path {
        &self.tarmac_filename
    }

    /// Reads raw trace text at `[pos, pos+len)`.
    pub fn read_tarmac(&self, pos: u64, len: u64) -> io::Result<String> {
        let mut buf = vec![0u8; len as usize];
        read_at(&self.tarmac, &mut buf, pos)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// The trace lines belonging to one sequence node.
    pub fn get_trace_lines(&self, node: &SeqOrderPayload) -> io::Result<Vec<String>> {
        let sbuf = self.read_tarmac(node.trace_file_pos, node.trace_file_len)?;
        let mut lines = Vec::new();
        let mut rest = sbuf.as_str();
        while !rest.is_empty() {
            // A trace with a truncated final line has no trailing \n;
            // treat the remainder as one line.
            let (line, tail) = match rest.find('\n') {
                Some(nl) => (&rest[..nl], &rest[nl + 1..]),
                None => (rest, ""),
            };
            lines.push(line.strip_suffix('\r').unwrap_or(line).to_string());
            rest = tail;
        }
        Ok(lines)
    }

    /// One line of a sequence node, by index within the node.
    pub fn get_trace_line(&self, node: &SeqOrderPayload, lineno: u32) -> io::Result<String> {
        let lines = self.get_trace_lines(node)?;
        Ok(lines.get(lineno as usize).cloned().unwrap_or_default())
    }

    /// The rightmost node with `mod_time <= t`.
    pub fn node_at_time(&self, t: Time) -> io::Result<Option<SeqOrderPayload>> {
        Ok(self
            .seqtree
            .pred(&self.arena, self.seqroot, &SeqTimeUpperBound(t))?
            .map(|(p, _)| p))
    }

    /// The node whose line range contains `line`.
    pub fn node_at_line(&self, line: u32) -> io::Result<Option<SeqOrderPayload>> {
        Ok(self
            .seqtree
            .find(&self.arena, self.seqroot, &SeqLineKey(line))?
            .map(|(p, _)| p))
    }

    /// The node immediately before `node` in the trace.
    pub fn get_previous_node(&self, node: &SeqOrderPayload) -> io::Result<Option<SeqOrderPayload>> {
        if node.trace_file_firstline == 0 {
            return Ok(None);
        }
        self.node_at_line(node.trace_file_firstline - 1)
    }

    /// The node immediately after `node` in the trace.
    pub fn get_next_node(&self, node: &SeqOrderPayload) -> io::Result<Option<SeqOrderPayload>> {
        self.node_at_line(node.trace_file_firstline + node.trace_file_lines)
    }

    /// The first (`end == false`) or last (`end == true`) node.
    pub fn find_buffer_limit(&self, end: bool) -> io::Result<Option<SeqOrderPayload>> {
        let found = if end {
            self.seqtree.last(&self.arena, self.seqroot)?
        } else {
            self.seqtree.first(&self.arena, self.seqroot)?
        };
        Ok(found.map(|(p, _)| p))
    }

    /// Reads `[addr, addr+size)` of space `ty` from the snapshot rooted
    /// at `memroot`.
    ///
    /// Known bytes are copied into `outdata` and flagged in `outdef`;
    /// bytes nobody ever wrote simply stay unflagged, so this query
    /// cannot fail.
    /// Returns the newest trace line that wrote any part of the range.
    pub fn getmem(
        &self,
        memroot: Offset,
        ty: u8,
        addr: u64,
        size: u64,
        mut outdata: Option<&mut [u8]>,
        mut outdef: Option<&mut [u8]>,
    ) -> io::Result<u32> {
        let mut retline = 0u32;
        if let Some(def) = outdef.as_deref_mut() {
            def.fill(0);
        }

        let mut search_lo = addr;
        let search_hi = addr.wrapping_add(size).wrapping_sub(1);

        while search_lo <= search_hi {
            let key = MemRangeKey { ty, lo: search_lo, hi: search_hi };
            let Some((memp, _)) = self.memtree.find_leftmost(&self.arena, memroot, &key)? else {
                break;
            };

            let lo = search_lo.max(memp.lo);
            let hi = search_hi.min(memp.hi);

            if memp.raw {
                let len = (hi - lo + 1) as usize;
                let start = (lo - addr) as usize;
                if let Some(data) = outdata.as_deref_mut() {
                    self.arena.read_bytes(
                        memp.contents + (lo - memp.lo),
                        &mut data[start..start + len],
                    )?;
                }
                if let Some(def) = outdef.as_deref_mut() {
                    def[start..start + len].fill(1);
                }
            } else {
                let subroot: Offset = self.arena.get(memp.contents)?;
                let mut sub_lo = lo;
                while sub_lo <= hi {
                    let probe = SubRangeKey { lo: sub_lo, hi };
                    let Some((msp, _)) =
                        self.memsubtree.find_leftmost(&self.arena, subroot, &probe)?
                    else {
                        break;
                    };
                    let slo = sub_lo.max(msp.lo);
                    let shi = hi.min(msp.hi);
                    let len = (shi - slo + 1) as usize;
                    let start = (slo - addr) as usize;
                    if let Some(data) = outdata.as_deref_mut() {
                        self.arena.read_bytes(
                            msp.contents + (slo - msp.lo),
                            &mut data[start..start + len],
                        )?;
                    }
                    if let Some(def) = outdef.as_deref_mut() {
                        def[start..start + len].fill(1);
                    }
                    sub_lo = shi + 1;
                }
            }

            retline = retline.max(memp.trace_file_firstline);

            search_lo = memp.hi.wrapping_add(1);
            if search_lo == 0 {
                break; // address space wraparound
            }
        }

        Ok(retline)
    }

    /// Register contents at a snapshot: `(bytes, defined-mask)`,
    /// little-endian.
    pub fn get_reg_bytes(
        &self,
        memroot: Offset,
        reg: &RegisterId,
    ) -> io::Result<(Vec<u8>, Vec<bool>)> {
        // Only resolve the iflags when the register actually needs them:
        // get_iflags recurses back here for the iflags register itself.
        let offset = if reg_needs_iflags(reg.prefix) {
            reg_offset_iflags(reg, self.get_iflags(memroot)?)
        } else {
            reg_offset(reg)
        };
        let size = reg_size(reg);

        let mut bytes = vec![0u8; size];
        let mut def = vec![0u8; size];
        self.getmem(
            memroot,
            MEM_TYPE_REGISTER,
            offset,
            size as u64,
            Some(&mut bytes),
            Some(&mut def),
        )?;
        Ok((bytes, def.into_iter().map(|d| d != 0).collect()))
    }

    /// Register value at a snapshot, if it is fully known and fits in 64
    /// bits.
    pub fn get_reg_value(&self, memroot: Offset, reg: &RegisterId) -> io::Result<Option<u64>> {
        if reg_size(reg) > 8 {
            // No integer to return for a vector register; callers probe
            // all registers indiscriminately, so this is not an error.
            return Ok(None);
        }
        let (bytes, def) = self.get_reg_bytes(memroot, reg)?;
        if def.contains(&false) {
            return Ok(None);
        }
        let mut value = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
        }
        Ok(Some(value))
    }

    /// The execution-state flags at a snapshot; defaults to 0 when even
    /// they are unknown (e.g. at the very start of the trace).
    pub fn get_iflags(&self, memroot: Offset) -> io::Result<u32> {
        Ok(self
            .get_reg_value(memroot, &REG_IFLAGS)?
            .map_or(0, |v| v as u32))
    }

    /// Finds the nearest region at-or-beyond `addr` (in the direction of
    /// `sign`) written at or after `minline`, returning its `(lo, hi)`.
    ///
    /// Two tree descents at most: the first narrows to the best candidate
    /// node or subtree using the latest-write annotations, the second
    /// extracts the extreme element of that subtree.
    pub fn find_next_mod(
        &self,
        memroot: Offset,
        ty: u8,
        addr: u64,
        minline: u32,
        sign: i32,
    ) -> io::Result<Option<(u64, u64)>> {
        debug_assert!(sign == 1 || sign == -1);

        struct State {
            minline: u32,
            ty: u8,
            sign: i32,
            key_lo: u64,
            key_hi: u64,
            use_key: bool,
            pass: u8,
            result: Option<(u64, u64)>,
            result_ty: u8,
            got_a_subtree: bool,
        }

        let mut st = State {
            minline,
            ty,
            sign,
            key_lo: addr,
            key_hi: addr,
            use_key: false,
            pass: 1,
            result: None,
            result_ty: 0,
            got_a_subtree: false,
        };

        fn key_cmp(st: &State, p: &MemoryPayload) -> Ordering {
            MemRangeKey { ty: st.ty, lo: st.key_lo, hi: st.key_hi }.cmp_key(p)
        }

        fn to_step(ord: Ordering) -> SearchStep {
            match ord {
                Ordering::Less => SearchStep::Left,
                Ordering::Greater => SearchStep::Right,
                Ordering::Equal => SearchStep::Stop,
            }
        }

        fn sign_ord(sign: i32) -> Ordering {
            if sign > 0 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }

        let run = |st: &mut State,
                   tree: &AvlDisk<MemoryPayload, MemoryAnnotation>,
                   arena: &Arena,
                   root: Offset|
         -> io::Result<()> {
            tree.search(arena, root, |_, lhs, _, p, _, _, rhs| {
                if st.pass == 1 {
                    let mut cmp = key_cmp(st, p);
                    if cmp == Ordering::Equal {
                        cmp = sign_ord(-st.sign);
                    }
                    if cmp == sign_ord(-st.sign) {
                        let subtree = if st.sign > 0 { rhs } else { lhs };

                        if st.ty == p.ty && p.trace_file_firstline >= st.minline {
                            // This node is the best candidate so far.
                            st.result = Some((p.lo, p.hi));
                            st.result_ty = p.ty;
                            st.got_a_subtree = false;
                        } else if subtree.is_some_and(|a| a.latest >= st.minline) {
                            // Something acceptable lives in the subtree
                            // beyond this node; remember where to re-enter.
                            st.key_lo = p.lo;
                            st.key_hi = p.hi;
                            st.result = Some((p.lo, p.hi));
                            st.result_ty = p.ty;
                            st.got_a_subtree = true;
                        }
                    }
                    to_step(cmp)
                } else if st.use_key {
                    let cmp = key_cmp(st, p);
                    if cmp == Ordering::Equal {
                        st.use_key = false;
                        to_step(sign_ord(st.sign))
                    } else {
                        to_step(cmp)
                    }
                } else {
                    // Inside the subtree pass 1 chose: return its extreme
                    // acceptable element. Check the near subtree, then the
                    // node, then the far subtree; pass 1 guarantees one of
                    // them matches.
                    let near = if st.sign > 0 { lhs } else { rhs };
                    if near.is_some_and(|a| a.latest >= st.minline) {
                        return to_step(sign_ord(-st.sign));
                    }
                    if p.trace_file_firstline >= st.minline {
                        st.result = Some((p.lo, p.hi));
                        st.result_ty = p.ty;
                        return SearchStep::Stop;
                    }
                    to_step(sign_ord(st.sign))
                }
            })?;
            Ok(())
        };

        run(&mut st, &self.memtree, &self.arena, memroot)?;

        if st.result.is_some() && st.got_a_subtree {
            // The candidate was "somewhere in that subtree": resolve it.
            st.use_key = true;
            st.pass = 2;
            st.result = None;
            run(&mut st, &self.memtree, &self.arena, memroot)?;
        }

        Ok(st.result.filter(|_| st.result_ty == ty))
    }

    fn depth_entry(
        &self,
        ann: &SeqOrderAnnotation,
        idx: u32,
    ) -> io::Result<CallDepthArrayEntry> {
        self.arena
            .get(ann.call_depth_array + u64::from(idx) * CallDepthArrayEntry::LEN as u64)
    }

    /// Index of the first array entry with `call_depth >= depth`, clamped
    /// to the sentinel.
    fn find_depth(&self, ann: &SeqOrderAnnotation, depth: u32) -> io::Result<u32> {
        let mut lo = 0u32;
        let mut hi = ann.call_depth_arraylen;
        while hi > lo {
            let mid = lo + (hi - lo) / 2;
            let entry = self.depth_entry(ann, mid)?;
            if entry.call_depth >= depth {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        // Never beyond the terminating sentinel; only reachable when the
        // query depth exceeds the sentinel depth itself.
        Ok(lo.min(ann.call_depth_arraylen - 1))
    }

    /// Translates a line offset between two depth-masked coordinate
    /// systems.
    ///
    /// `line` is an offset in the coordinate system of lines whose call
    /// depth lies in `[mindepth_in, maxdepth_in)`; the result counts the
    /// lines before it whose depth lies in `[mindepth_out, maxdepth_out)`.
    /// `None` when `line` lies beyond the masked extent of the trace.
    pub fn lrt_translate_may_fail(
        &self,
        line: u32,
        mindepth_in: u32,
        maxdepth_in: u32,
        mindepth_out: u32,
        maxdepth_out: u32,
    ) -> io::Result<Option<u32>> {
        struct Lrt {
            target: u32,
            output_lines: u32,
            curr: Offset,
            minindex_i: u32,
            maxindex_i: u32,
            minindex_o: u32,
            maxindex_o: u32,
            io_error: Option<io::Error>,
        }

        let mut st = Lrt {
            target: line,
            output_lines: 0,
            curr: u64::MAX,
            minindex_i: 0,
            maxindex_i: 0,
            minindex_o: 0,
            maxindex_o: 0,
            io_error: None,
        };

        let found = self.seqtree.search(
            &self.arena,
            self.seqroot,
            |lhs_off, lhs, here_off, p, ann, rhs_off, rhs| {
                let mut step = || -> io::Result<SearchStep> {
                    if st.curr != here_off {
                        st.curr = here_off;
                        st.minindex_i = self.find_depth(ann, mindepth_in)?;
                        st.maxindex_i = self.find_depth(ann, maxdepth_in)?;
                        st.minindex_o = self.find_depth(ann, mindepth_out)?;
                        st.maxindex_o = self.find_depth(ann, maxdepth_out)?;
                    }

                    if let Some(lhs) = lhs {
                        let min_i = self.depth_entry(ann, st.minindex_i)?.leftlink;
                        let max_i = self.depth_entry(ann, st.maxindex_i)?.leftlink;
                        let min_o = self.depth_entry(ann, st.minindex_o)?.leftlink;
                        let max_o = self.depth_entry(ann, st.maxindex_o)?.leftlink;
                        let lines_i = self.depth_entry(lhs, max_i)?.cumulative_lines
                            - self.depth_entry(lhs, min_i)?.cumulative_lines;
                        if st.target < lines_i {
                            st.curr = lhs_off;
                            st.minindex_i = min_i;
                            st.maxindex_i = max_i;
                            st.minindex_o = min_o;
                            st.maxindex_o = max_o;
                            return Ok(SearchStep::Left);
                        }
                        st.target -= lines_i;
                        st.output_lines += self.depth_entry(lhs, max_o)?.cumulative_lines
                            - self.depth_entry(lhs, min_o)?.cumulative_lines;
                    }

                    let in_window = p.call_depth >= mindepth_in && p.call_depth < maxdepth_in;
                    if in_window {
                        if st.target < p.trace_file_lines
                            || (st.target == p.trace_file_lines && rhs.is_none())
                        {
                            if p.call_depth >= mindepth_out && p.call_depth < maxdepth_out {
                                st.output_lines += st.target;
                            }
                            return Ok(SearchStep::Stop);
                        }
                        st.target -= p.trace_file_lines;
                    }
                    if p.call_depth >= mindepth_out && p.call_depth < maxdepth_out {
                        st.output_lines += p.trace_file_lines;
                    }

                    if let Some(rhs) = rhs {
                        let min_i = self.depth_entry(ann, st.minindex_i)?.rightlink;
                        let max_i = self.depth_entry(ann, st.maxindex_i)?.rightlink;
                        let min_o = self.depth_entry(ann, st.minindex_o)?.rightlink;
                        let max_o = self.depth_entry(ann, st.maxindex_o)?.rightlink;
                        let lines = self.depth_entry(rhs, max_i)?.cumulative_lines
                            - self.depth_entry(rhs, min_i)?.cumulative_lines;
                        if st.target <= lines {
                            st.curr = rhs_off;
                            st.minindex_i = min_i;
                            st.maxindex_i = max_i;
                            st.minindex_o = min_o;
                            st.maxindex_o = max_o;
                            return Ok(SearchStep::Right);
                        }
                        st.target -= lines;
                        st.output_lines += self.depth_entry(rhs, max_o)?.cumulative_lines
                            - self.depth_entry(rhs, min_o)?.cumulative_lines;
                    }

                    // The requested offset lies beyond the whole tree.
                    Ok(SearchStep::Abort)
                };
                let result = step();
                match result {
                    Ok(s) => s,
                    Err(e) => {
                        st.io_error = Some(e);
                        SearchStep::Abort
                    }
                }
            },
        )?;

        if let Some(e) = st.io_error {
            return Err(e);
        }
        if found.is_none() {
            return Ok(None);
        }
        Ok(Some(st.output_lines))
    }

    /// Number of output-masked lines spanned by the input-masked range
    /// `[linestart, lineend)`; `None` if either endpoint is out of range.
    pub fn lrt_translate_range(
        &self,
        linestart: u32,
        lineend: u32,
        mindepth_in: u32,
        maxdepth_in: u32,
        mindepth_out: u32,
        maxdepth_out: u32,
    ) -> io::Result<Option<u32>> {
        let end = self.lrt_translate_may_fail(
            lineend,
            mindepth_in,
            maxdepth_in,
            mindepth_out,
            maxdepth_out,
        )?;
        let start = self.lrt_translate_may_fail(
            linestart,
            mindepth_in,
            maxdepth_in,
            mindepth_out,
            maxdepth_out,
        )?;
        Ok(match (start, end) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        })
    }

    /// The next (or previous, for `sign < 0`) visit to `pc` strictly
    /// beyond `line`, as a trace line number.
    pub fn find_next_visit_to_pc(
        &self,
        pc: u64,
        line: u32,
        sign: i32,
    ) -> io::Result<Option<u32>> {
        let key = ByPCPayload {
            pc: pc & !1u64,
            trace_file_firstline: line,
        };
        let found = if sign >= 0 {
            self.bypctree.succ(&self.arena, self.bypcroot, &key)?
        } else {
            self.bypctree.pred(&self.arena, self.bypcroot, &key)?
        };
        Ok(found
            .map(|(p, _)| p)
            .filter(|p| p.pc == pc & !1u64)
            .map(|p| p.trace_file_firstline))
    }
}

/// An [`IndexReader`] plus an optional symbol table.
pub struct Navigator {
    index: IndexReader,
    image: Option<Box<dyn ImageLookup>>,
}

impl std::ops::Deref for Navigator {
    type Target = IndexReader;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

impl Navigator {
    #[must_use]
    pub fn new(index: IndexReader, image: Option<Box<dyn ImageLookup>>) -> Self {
        Self { index, image }
    }

    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    /// Resolves a symbol name via the attached image.
    pub fn lookup_symbol(&self, name: &str) -> Option<(u64, u64)> {
        self.image.as_ref()?.lookup_symbol(name)
    }

    /// Renders `addr` as `symbol + offset` when the image knows it;
    /// otherwise hex if `fallback` is set, else an empty string.
    pub fn get_symbolic_address(&self, addr: u64, fallback: bool) -> String {
        if let Some((name, base)) = self.image.as_ref().and_then(|i| i.find_symbol(addr)) {
            let delta = addr - base;
            if delta == 0 {
                name
            } else {
                format!("{name} + {delta:#x}")
            }
        } else if fallback {
            format!("{addr:#x}")
        } else {
            String::new()
        }
    }

    /// An expression-evaluation context bound to one memory snapshot.
    #[must_use]
    pub fn execution_context(&self, memroot: Offset) -> NavContext<'_> {
        NavContext { nav: self, memroot }
    }
}

/// [`ExecutionContext`]/[`ParseContext`] over a navigator and a snapshot.
pub struct NavContext<'a> {
    nav: &'a Navigator,
    memroot: Offset,
}

impl ParseContext for NavContext<'_> {
    fn lookup_register(&self, name: &str) -> Option<RegisterId> {
        lookup_reg_name(name)
    }

    fn lookup_symbol(&self, name: &str) -> Option<u64> {
        self.nav.lookup_symbol(name).map(|(addr, _)| addr)
    }
}

impl ExecutionContext for NavContext<'_> {
    fn register_value(&self, reg: &RegisterId) -> std::result::Result<u64, EvaluationError> {
        if self.memroot == NULL_OFF {
            return Err(EvaluationError::new("no memory snapshot selected"));
        }
        self.nav
            .get_reg_value(self.memroot, reg)
            .map_err(|e| EvaluationError::new(&format!("register read failed: {e}")))?
            .ok_or_else(|| EvaluationError::new("register value not defined here"))
    }
}

/// Convenience memory probe used by scenario tests and simple callers:
/// returns `(latest-write line, bytes, defined-mask)`.
pub fn read_memory(
    reader: &IndexReader,
    memroot: Offset,
    ty: u8,
    addr: u64,
    size: usize,
) -> io::Result<(u32, Vec<u8>, Vec<bool>)> {
    let mut data = vec![0u8; size];
    let mut def = vec![0u8; size];
    let line = reader.getmem(
        memroot,
        ty,
        addr,
        size as u64,
        Some(&mut data),
        Some(&mut def),
    )?;
    Ok((line, data, def.into_iter().map(|d| d != 0).collect()))
}

