// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The indexer: one pass over a Tarmac file, producing the on-disk index.
//!
//! The builder is a [`ParseReceiver`]; the parser pushes events at it and
//! it maintains the running machine state (current memory/register
//! snapshot, PC, SP, LR) plus the three persistent trees. Whenever the
//! timestamp advances, the current state is flushed as one sequence-tree
//! node and the memory tree is committed, freezing that snapshot forever.
//!
//! Two post-passes then fill in what only hindsight can know: per-node
//! call depths (integrating the call/return marks found by the heuristic)
//! and the per-subtree call-depth arrays used for fold-aware line
//! arithmetic.

use crate::arena::{Arena, Offset, NULL_OFF};
use crate::avl::AvlDisk;
use crate::coding::DiskRecord;
use crate::format::{
    ByPCPayload, CallDepthArrayEntry, FileHeader, MemRangeKey, MemoryAnnotation, MemoryPayload,
    MemorySubPayload, SeqOrderAnnotation, SeqOrderPayload, SubRangeKey, FLAG_AARCH64_USED,
    FLAG_BIGEND, FLAG_COMPLETE, KNOWN_INVALID_PC, MAGIC_LEN, MEM_TYPE_MEMORY, MEM_TYPE_REGISTER,
    SENTINEL_DEPTH,
};
use crate::parser::{
    ISet, InstructionEvent, MemoryEvent, ParseParams, ParseReceiver, RegisterEvent,
    TarmacLineParser, TextOnlyEvent, Time,
};
use crate::registers::{
    reg_offset, reg_offset_iflags, reg_size, RegPrefix, RegisterId, IFLAG_AARCH64, IFLAG_BIGEND,
    REG_32_LR, REG_32_R0, REG_32_R1, REG_32_SP, REG_64_X0, REG_64_X1, REG_64_XLR, REG_64_XSP,
    REG_IFLAGS,
};
use crate::reporter::Reporter;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// A trace file and the index file that belongs to it.
#[derive(Clone, Debug)]
pub struct TracePair {
    pub tarmac_filename: PathBuf,
    pub index_filename: PathBuf,
}

impl TracePair {
    /// Pairs a trace with the conventional index name next to it.
    #[must_use]
    pub fn for_trace(tarmac_filename: PathBuf) -> Self {
        let mut index_filename = tarmac_filename.clone().into_os_string();
        index_filename.push(".index");
        Self {
            tarmac_filename,
            index_filename: index_filename.into(),
        }
    }
}

/// Indexing options.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexParams {
    /// Treat the traced system as big-endian.
    pub bigend: bool,
    /// Parser tolerance for producers that omit the instruction-set field.
    pub implicit_thumb: bool,
}

// The call heuristic's thresholds. A branch only counts as a call if LR
// was written within this many instructions before the transfer, and
// landed within this many bytes of the address after the branch.
const LR_WINDOW_INSNS: u64 = 8;
const LR_TOLERANCE_BYTES: u64 = 64;

/// Builds one index from one trace. See [`run_indexer`].
struct IndexBuilder<'r> {
    arena: Arena,
    header_off: Offset,

    memtree: AvlDisk<MemoryPayload, MemoryAnnotation>,
    memsubtree: AvlDisk<MemorySubPayload>,
    seqtree: AvlDisk<SeqOrderPayload, SeqOrderAnnotation>,
    bypctree: AvlDisk<ByPCPayload>,
    memroot: Offset,
    last_memroot: Offset,
    seqroot: Offset,
    bypcroot: Offset,

    current_time: Option<Time>,
    seen_instruction_at_current_time: bool,
    seen_any_event: bool,
    curr_pc: u64,
    insns_since_lr_update: u64,
    expected_next_pc: u64,
    expected_next_lr: u64,

    /// Outstanding possible calls: `(sp, candidate return pc) -> line of
    /// the first instruction of the callee`.
    pending_calls: BTreeMap<(u64, u64), u32>,
    /// Call/return marks by line; +1 opens a call, -1 closes one. The
    /// first mark on a line wins.
    found_callrets: BTreeMap<u32, i32>,

    bigend: bool,
    aarch64_used: bool,
    curr_iflags: u32,

    // Line bookkeeping shared between the read loop and event handling.
    lineno: u32,
    true_lineno: u32,
    lineno_offset: u32,
    prev_lineno: u32,
    linepos: u64,
    oldpos: u64,

    reporter: &'r dyn Reporter,
    tarmac_filename: PathBuf,
    /// First I/O failure inside a receiver callback; checked after every
    /// parsed line.
    io_error: Option<io::Error>,
}

impl<'r> IndexBuilder<'r> {
    fn new(
        mut arena: Arena,
        params: IndexParams,
        reporter: &'r dyn Reporter,
        tarmac_filename: PathBuf,
    ) -> io::Result<Self> {
        crate::format::write_magic(&mut arena)?;
        let header_off = arena.alloc(FileHeader::LEN)?;
        debug_assert_eq!(MAGIC_LEN as u64, header_off);
        // FLAG_COMPLETE must not be set until finalise.
        arena.put(header_off, &FileHeader::default())?;

        let memtree = AvlDisk::new(&arena);
        let memsubtree = AvlDisk::new(&arena);
        let seqtree = AvlDisk::new(&arena);
        let bypctree = AvlDisk::new(&arena);

        let mut builder = Self {
            arena,
            header_off,
            memtree,
            memsubtree,
            seqtree,
            bypctree,
            memroot: NULL_OFF,
            last_memroot: NULL_OFF,
            seqroot: NULL_OFF,
            bypcroot: NULL_OFF,
            current_time: None,
            seen_instruction_at_current_time: false,
            seen_any_event: false,
            curr_pc: KNOWN_INVALID_PC,
            insns_since_lr_update: 0,
            expected_next_pc: KNOWN_INVALID_PC,
            expected_next_lr: 0,
            pending_calls: BTreeMap::new(),
            found_callrets: BTreeMap::new(),
            bigend: params.bigend,
            aarch64_used: false,
            curr_iflags: 0,
            lineno: 1,
            true_lineno: 0,
            lineno_offset: 0,
            prev_lineno: 0,
            linepos: 0,
            oldpos: 0,
            reporter,
            tarmac_filename,
            io_error: None,
        };

        // Start with the whole address space as one sub region, so
        // anything we later learn from memory-read events can be filled
        // in retroactively. Size 0 means the full space: the range
        // arithmetic wraps it to lo=0, hi=MAX.
        builder.make_sub_memtree(MEM_TYPE_MEMORY, 0, 0)?;
        builder.last_memroot = builder.memroot;
        builder.prev_lineno = builder.lineno;

        Ok(builder)
    }

    fn reg_sp(&self) -> RegisterId {
        if self.curr_iflags & IFLAG_AARCH64 != 0 {
            REG_64_XSP
        } else {
            REG_32_SP
        }
    }

    fn reg_lr(&self) -> RegisterId {
        if self.curr_iflags & IFLAG_AARCH64 != 0 {
            REG_64_XLR
        } else {
            REG_32_LR
        }
    }

    /// Removes everything overlapping `[addr, addr+size)` of type `ty`
    /// from the current memory snapshot, reinserting clipped remainders
    /// of regions that only partly overlapped.
    fn delete_from_memtree(&mut self, ty: u8, addr: u64, size: u64) -> io::Result<()> {
        let lo = addr;
        let hi = addr.wrapping_add(size).wrapping_sub(1);
        let key = MemRangeKey { ty, lo, hi };

        loop {
            let (newroot, removed) = self.memtree.remove(&mut self.arena, self.memroot, &key)?;
            self.memroot = newroot;
            let Some(old) = removed else { break };

            if old.lo < lo {
                let mut below = old.clone();
                below.hi = lo - 1;
                self.memroot = self.memtree.insert(&mut self.arena, self.memroot, below)?;
            }
            if old.hi > hi {
                let mut above = old;
                if above.raw {
                    above.contents += hi + 1 - above.lo;
                }
                above.lo = hi + 1;
                self.memroot = self.memtree.insert(&mut self.arena, self.memroot, above)?;
            }
        }
        Ok(())
    }

    /// Allocates fresh contents for a raw region and links it into the
    /// snapshot, returning the offset the caller fills with bytes.
    fn make_memtree_update(&mut self, ty: u8, addr: u64, size: u64) -> io::Result<Offset> {
        let contents_offset = self.arena.alloc(size as usize)?;

        self.delete_from_memtree(ty, addr, size)?;

        let memp = MemoryPayload {
            ty,
            lo: addr,
            hi: addr + (size - 1),
            raw: true,
            contents: contents_offset,
            trace_file_firstline: self.prev_lineno,
        };
        self.memroot = self.memtree.insert(&mut self.arena, self.memroot, memp)?;

        Ok(contents_offset)
    }

    fn value_bytes(&self, ty: u8, size: u64, contents: u64) -> Vec<u8> {
        let size = size as usize;
        let mut data = vec![0u8; size];
        if ty == MEM_TYPE_MEMORY && self.bigend {
            for (i, b) in data.iter_mut().enumerate() {
                *b = (contents >> (8 * (size - 1 - i))) as u8;
            }
        } else {
            for (i, b) in data.iter_mut().enumerate() {
                *b = (contents >> (8 * i)) as u8;
            }
        }
        data
    }

    fn update_memtree(&mut self, ty: u8, addr: u64, size: u64, contents: u64) -> io::Result<()> {
        let data = self.value_bytes(ty, size, contents);
        let contents_offset = self.make_memtree_update(ty, addr, size)?;
        self.arena.write_bytes(contents_offset, &data)
    }

    /// Like [`update_memtree`](Self::update_memtree) but skips the write
    /// if the stored value is already equal, so repeated identical state
    /// does not bloat the index.
    fn update_memtree_if_necessary(
        &mut self,
        ty: u8,
        addr: u64,
        size: u64,
        contents: u64,
    ) -> io::Result<()> {
        if self.read_memtree_value(ty, addr, size)? == Some(contents) {
            return Ok(());
        }
        self.update_memtree(ty, addr, size, contents)
    }

    /// Marks `[addr, addr+size)` as unknown by installing a sub region,
    /// returning the offset of its root cell.
    fn make_sub_memtree(&mut self, ty: u8, addr: u64, size: u64) -> io::Result<Offset> {
        let cell_offset = self.arena.put_new(&NULL_OFF)?;

        self.delete_from_memtree(ty, addr, size)?;

        let memp = MemoryPayload {
            ty,
            lo: addr,
            hi: addr.wrapping_add(size).wrapping_sub(1),
            raw: false,
            contents: cell_offset,
            trace_file_firstline: self.prev_lineno,
        };
        self.memroot = self.memtree.insert(&mut self.arena, self.memroot, memp)?;

        Ok(cell_offset)
    }

    /// Feeds a known memory-read value into every sub region it crosses,
    /// recording only the bytes that were not already known. Raw regions
    /// already know their bytes and are left alone.
    fn update_memtree_from_read(
        &mut self,
        ty: u8,
        addr: u64,
        size: u64,
        contents: u64,
    ) -> io::Result<()> {
        let data = self.value_bytes(ty, size, contents);

        let mut search_lo = addr;
        let search_hi = addr + (size - 1);

        while search_lo <= search_hi {
            let key = MemRangeKey { ty, lo: search_lo, hi: search_hi };
            let Some((memp, _)) = self.memtree.find_leftmost(&self.arena, self.memroot, &key)?
            else {
                break;
            };

            if !memp.raw {
                let mut sub_lo = search_lo.max(memp.lo);
                let sub_hi = memp.hi.min(search_hi);

                while sub_lo <= sub_hi {
                    let subroot: Offset = self.arena.get(memp.contents)?;
                    let probe = SubRangeKey { lo: sub_lo, hi: sub_hi };
                    let found = self
                        .memsubtree
                        .find_leftmost(&self.arena, subroot, &probe)?
                        .map(|(p, _)| p);
                    // Where the subtree has nothing, invent an empty run
                    // past the end so the gap logic below closes out.
                    let (found_lo, found_hi) = match &found {
                        Some(p) => (p.lo, p.hi),
                        None => (sub_hi + 1, sub_hi),
                    };

                    if sub_lo < found_lo {
                        let ins_lo = sub_lo;
                        let ins_hi = found_lo - 1;
                        let contents_offset = self.arena.alloc((ins_hi - ins_lo + 1) as usize)?;
                        self.arena.write_bytes(
                            contents_offset,
                            &data[(ins_lo - addr) as usize..=(ins_hi - addr) as usize],
                        )?;
                        let subroot: Offset = self.arena.get(memp.contents)?;
                        let new_subroot = self.memsubtree.insert(
                            &mut self.arena,
                            subroot,
                            MemorySubPayload {
                                lo: ins_lo,
                                hi: ins_hi,
                                contents: contents_offset,
                            },
                        )?;
                        self.arena.put(memp.contents, &new_subroot)?;
                    }
                    sub_lo = found_hi + 1;
                }
            }

            search_lo = memp.hi.wrapping_add(1);
            if search_lo == 0 {
                break; // address space wraparound
            }
        }
        Ok(())
    }

    /// Reads up to 8 fully-known bytes from the last committed snapshot,
    /// assembled per the type's endianness convention.
    fn read_memtree_value(&self, ty: u8, addr: u64, size: u64) -> io::Result<Option<u64>> {
        debug_assert!(size <= 8);
        let size_us = size as usize;
        let mut data = [0u8; 8];
        let mut def = [false; 8];

        let mut search_lo = addr;
        let search_hi = addr + (size - 1);

        while search_lo <= search_hi {
            let key = MemRangeKey { ty, lo: search_lo, hi: search_hi };
            let Some((memp, _)) =
                self.memtree.find_leftmost(&self.arena, self.last_memroot, &key)?
            else {
                break;
            };

            let lo = search_lo.max(memp.lo);
            let hi = search_hi.min(memp.hi);

            if memp.raw {
                let len = (hi - lo + 1) as usize;
                let start = (lo - addr) as usize;
                self.arena.read_bytes(
                    memp.contents + (lo - memp.lo),
                    &mut data[start..start + len],
                )?;
                def[start..start + len].fill(true);
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
                    self.arena.read_bytes(
                        msp.contents + (slo - msp.lo),
                        &mut data[start..start + len],
                    )?;
                    def[start..start + len].fill(true);
                    sub_lo = shi + 1;
                }
            }

            search_lo = memp.hi.wrapping_add(1);
            if search_lo == 0 {
                break; // address space wraparound
            }
        }

        if def[..size_us].contains(&false) {
            return Ok(None);
        }

        let mut value = 0u64;
        if ty == MEM_TYPE_MEMORY && self.bigend {
            for &b in &data[..size_us] {
                value = (value << 8) | u64::from(b);
            }
        } else {
            for &b in data[..size_us].iter().rev() {
                value = (value << 8) | u64::from(b);
            }
        }
        Ok(Some(value))
    }

    fn read_memtree_reg(&self, reg: &RegisterId) -> io::Result<Option<u64>> {
        self.read_memtree_value(
            MEM_TYPE_REGISTER,
            reg_offset_iflags(reg, self.curr_iflags),
            reg_size(reg) as u64,
        )
    }

    fn update_sp(&mut self, sp: u64) {
        // Any pending call whose frame sat below the new stack pointer
        // has been abandoned.
        let dead: Vec<(u64, u64)> = self
            .pending_calls
            .range(..(sp, 0))
            .map(|(&k, _)| k)
            .collect();
        for k in dead {
            self.pending_calls.remove(&k);
        }
    }

    fn update_pc(&mut self, pc: u64, next_pc: u64, iset: ISet) -> io::Result<()> {
        if iset == ISet::A64 {
            self.aarch64_used = true;
        }

        if (pc ^ self.expected_next_pc) & !1u64 != 0 {
            // The last instruction transferred control somewhere other
            // than the next location. If the next location (or something
            // near it) also landed in LR, this is potentially a call;
            // alternatively this transfer may be the return matching a
            // call we recorded earlier.
            let sp = self.read_memtree_reg(&self.reg_sp())?.unwrap_or(u64::MAX);

            if let Some(&call_line) = self.pending_calls.get(&(sp, pc)) {
                // call_line is the first instruction of the called
                // function and prev_lineno the first instruction after
                // the return, so the pair bounds a half-open interval
                // covering exactly the instructions that are not part of
                // the caller's sequential path.
                self.found_callrets.entry(call_line).or_insert(1);
                self.found_callrets.entry(self.prev_lineno).or_insert(-1);
                self.pending_calls.remove(&(sp, pc));
            } else if let Some(lr) = self.read_memtree_reg(&self.reg_lr())? {
                if self.insns_since_lr_update < LR_WINDOW_INSNS
                    && lr.abs_diff(self.expected_next_lr) < LR_TOLERANCE_BYTES
                {
                    self.pending_calls
                        .entry((sp, lr))
                        .or_insert(self.prev_lineno);
                }
            }
        }

        self.curr_pc = pc;
        self.expected_next_pc = next_pc;
        self.expected_next_lr = next_pc | u64::from(iset == ISet::Thumb);
        Ok(())
    }

    fn update_iflags(&mut self, iflags: u32) -> io::Result<()> {
        self.curr_iflags = iflags;
        self.update_memtree_if_necessary(
            MEM_TYPE_REGISTER,
            reg_offset(&REG_IFLAGS),
            reg_size(&REG_IFLAGS) as u64,
            u64::from(iflags),
        )
    }

    /// Shared entry point of every event: flushes the current node when
    /// the timestamp moves on (or when a second instruction arrives at
    /// the same timestamp), then re-arms the per-node bookkeeping.
    fn event_common(&mut self, time: Option<Time>, is_instruction: bool) -> io::Result<()> {
        // Tarmac files have been known to include chronological disorder,
        // e.g. a simulation-stopped line stamped before the line that
        // caused it. Clamp every timestamp up to the running maximum so
        // the sequence key stays monotonic.
        let ev_time = match (time, self.current_time) {
            (Some(t), Some(c)) => Some(t.max(c)),
            (Some(t), None) => Some(t),
            (None, c) => c,
        };

        if !self.seen_any_event {
            self.lineno_offset = self.true_lineno - self.lineno;
        }

        if time.is_none()
            || ev_time != self.current_time
            || (self.seen_instruction_at_current_time && is_instruction)
        {
            if self.seen_any_event && self.linepos != self.oldpos {
                let seqp = SeqOrderPayload {
                    mod_time: self.current_time.unwrap_or(0),
                    pc: self.curr_pc,
                    trace_file_pos: self.oldpos,
                    trace_file_len: self.linepos - self.oldpos,
                    trace_file_firstline: self.prev_lineno,
                    trace_file_lines: self.lineno - self.prev_lineno,
                    memory_root: self.memroot,
                    call_depth: 0, // filled in by the post-pass
                };
                self.seqroot = self.seqtree.insert(&mut self.arena, self.seqroot, seqp)?;

                if self.curr_pc != KNOWN_INVALID_PC {
                    let bypcp = ByPCPayload {
                        pc: self.curr_pc & !1u64,
                        trace_file_firstline: self.prev_lineno,
                    };
                    self.bypcroot =
                        self.bypctree.insert(&mut self.arena, self.bypcroot, bypcp)?;
                }
            }

            self.last_memroot = self.memroot;
            self.memtree.commit(&self.arena);

            if time.is_none() {
                return Ok(());
            }

            if self.current_time != ev_time {
                self.current_time = ev_time;
                self.seen_instruction_at_current_time = false;
            }
            self.curr_pc = KNOWN_INVALID_PC;
            self.oldpos = self.linepos;
            self.prev_lineno = self.lineno;
            self.seen_any_event = true;
        }

        if is_instruction {
            self.seen_instruction_at_current_time = true;
        }
        Ok(())
    }

    fn handle_register(&mut self, ev: RegisterEvent) -> io::Result<()> {
        self.event_common(Some(ev.time), false)?;

        let mut reg = ev.reg;
        if reg.prefix == RegPrefix::S && self.curr_iflags & IFLAG_AARCH64 != 0 {
            // In AArch64 an s-register is the low word of its d-register,
            // so treat the update as landing in the d space.
            reg.prefix = RegPrefix::D;
        }

        let offset = reg_offset_iflags(&reg, self.curr_iflags) + ev.offset as u64;
        let size = ev.bytes.len() as u64;
        let contents_offset = self.make_memtree_update(MEM_TYPE_REGISTER, offset, size)?;
        self.arena.write_bytes(contents_offset, &ev.bytes)?;

        let sp = self.reg_sp();
        if ranges_overlap(offset, size, reg_offset_iflags(&sp, self.curr_iflags), reg_size(&sp) as u64) {
            if let Some(new_sp) = self.read_memtree_value(
                MEM_TYPE_REGISTER,
                reg_offset_iflags(&sp, self.curr_iflags),
                reg_size(&sp) as u64,
            )? {
                self.update_sp(new_sp);
            }
        }

        let lr = self.reg_lr();
        if ranges_overlap(offset, size, reg_offset_iflags(&lr, self.curr_iflags), reg_size(&lr) as u64) {
            self.insns_since_lr_update = 0;
        }

        Ok(())
    }

    fn handle_memory(&mut self, ev: MemoryEvent) -> io::Result<()> {
        self.event_common(Some(ev.time), false)?;

        if !ev.read {
            if ev.known {
                self.update_memtree(MEM_TYPE_MEMORY, ev.addr, ev.size as u64, ev.contents)?;
            } else {
                self.make_sub_memtree(MEM_TYPE_MEMORY, ev.addr, ev.size as u64)?;
            }
        } else if ev.known {
            self.update_memtree_from_read(MEM_TYPE_MEMORY, ev.addr, ev.size as u64, ev.contents)?;
        }
        // A read of unknown data tells us nothing at all.

        Ok(())
    }

    fn is_semihosting_call(iset: ISet, instruction: u32) -> bool {
        match iset {
            ISet::Thumb => {
                instruction == 0xbeab // BKPT #0xAB
                    || instruction == 0xdfab // SVC #0xAB
                    || instruction == 0xbabc // HLT #0x3F
            }
            ISet::Arm => {
                (instruction & 0x0fff_ffff) == 0x0f12_3456 // SVC #0x123456
                    || (instruction & 0x0fff_ffff) == 0x010f_0070 // HLT #0xF000
            }
            ISet::A64 => instruction == 0xD45E_0000, // HLT #0xF000
        }
    }

    /// Semihosting operations overwrite guest buffers with host data the
    /// trace never shows, so the affected ranges must become unknown.
    fn handle_semihosting(&mut self, iset: ISet) -> io::Result<()> {
        let (opreg, blkreg, word) = if iset == ISet::A64 {
            (REG_64_X0, REG_64_X1, 8u64)
        } else {
            (REG_32_R0, REG_32_R1, 4u64)
        };

        // If the operation number is unreadable there is nothing useful
        // to do; 0 is a known-harmless value.
        let op = self.read_memtree_reg(&opreg)?.unwrap_or(0);

        let Some(r1) = self.read_memtree_reg(&blkreg)? else {
            return Ok(());
        };

        match op {
            0x06 => {
                // SYS_READ: parameter block word 1 is the buffer start,
                // word 2 the length (word 0 is the file handle).
                let Some(start) = self.read_memtree_value(MEM_TYPE_MEMORY, r1 + word, word)?
                else {
                    return Ok(());
                };
                let Some(size) = self.read_memtree_value(MEM_TYPE_MEMORY, r1 + 2 * word, word)?
                else {
                    return Ok(());
                };
                self.make_sub_memtree(MEM_TYPE_MEMORY, start, size)?;
            }
            0x0D => {
                // SYS_TMPNAM: word 0 is the buffer start, word 2 the
                // length (word 1 is an identifier).
                let Some(start) = self.read_memtree_value(MEM_TYPE_MEMORY, r1, word)? else {
                    return Ok(());
                };
                let Some(size) = self.read_memtree_value(MEM_TYPE_MEMORY, r1 + 2 * word, word)?
                else {
                    return Ok(());
                };
                self.make_sub_memtree(MEM_TYPE_MEMORY, start, size)?;
            }
            0x15 => {
                // SYS_GET_CMDLINE: word 0 is the buffer start, word 1 the
                // length.
                let Some(start) = self.read_memtree_value(MEM_TYPE_MEMORY, r1, word)? else {
                    return Ok(());
                };
                let Some(size) = self.read_memtree_value(MEM_TYPE_MEMORY, r1 + word, word)?
                else {
                    return Ok(());
                };
                self.make_sub_memtree(MEM_TYPE_MEMORY, start, size)?;
            }
            0x16 => {
                // SYS_HEAPINFO: word 0 is the buffer start; the length is
                // fixed at four words.
                let Some(start) = self.read_memtree_value(MEM_TYPE_MEMORY, r1, word)? else {
                    return Ok(());
                };
                self.make_sub_memtree(MEM_TYPE_MEMORY, start, 4 * word)?;
            }
            0x30 => {
                // SYS_ELAPSED: r1 is itself the buffer start; two words.
                self.make_sub_memtree(MEM_TYPE_MEMORY, r1, 2 * word)?;
            }
            _ => {
                // Other semihosting calls don't write guest memory.
            }
        }
        Ok(())
    }

    fn handle_instruction(&mut self, ev: InstructionEvent) -> io::Result<()> {
        self.event_common(Some(ev.time), true)?;

        self.insns_since_lr_update += 1;

        let adjusted_pc = ev.pc | u64::from(ev.iset == ISet::Thumb);

        if ev.executed && Self::is_semihosting_call(ev.iset, ev.instruction) {
            self.handle_semihosting(ev.iset)?;
        }

        let mut iflags = 0;
        if ev.iset == ISet::A64 {
            iflags |= IFLAG_AARCH64;
        }
        if self.bigend {
            iflags |= IFLAG_BIGEND;
        }
        self.update_iflags(iflags)?;

        self.update_pc(adjusted_pc, adjusted_pc + u64::from(ev.width / 8), ev.iset)
    }

    fn handle_text(&mut self, ev: &TextOnlyEvent) -> io::Result<()> {
        self.event_common(Some(ev.time), false)
    }

    /// In-order pass integrating the call/return marks into per-node
    /// depths.
    fn assign_call_depths(
        &mut self,
        offset: Offset,
        callrets: &[(u32, i32)],
        pos: &mut usize,
        depth: &mut i64,
    ) -> io::Result<()> {
        if offset == NULL_OFF {
            return Ok(());
        }
        let mut n = self.seqtree.node(&self.arena, offset)?;
        self.assign_call_depths(n.lc, callrets, pos, depth)?;

        if *pos < callrets.len() && callrets[*pos].0 == n.payload.trace_file_firstline {
            *depth += i64::from(callrets[*pos].1);
            *pos += 1;
        }
        n.payload.call_depth = (*depth).max(0) as u32;
        self.seqtree.update_node(&mut self.arena, &n)?;

        self.assign_call_depths(n.rc, callrets, pos, depth)
    }

    fn read_depth_array(
        &self,
        ann: &SeqOrderAnnotation,
    ) -> io::Result<Vec<CallDepthArrayEntry>> {
        let mut entries = Vec::with_capacity(ann.call_depth_arraylen as usize);
        for i in 0..ann.call_depth_arraylen as u64 {
            entries.push(
                self.arena
                    .get(ann.call_depth_array + i * CallDepthArrayEntry::LEN as u64)?,
            );
        }
        Ok(entries)
    }

    /// Post-order pass building each node's call-depth array by merging
    /// its own two-entry array with its children's.
    fn build_depth_arrays(&mut self, offset: Offset) -> io::Result<()> {
        if offset == NULL_OFF {
            return Ok(());
        }
        let mut n = self.seqtree.node(&self.arena, offset)?;
        self.build_depth_arrays(n.lc)?;
        self.build_depth_arrays(n.rc)?;

        // A tiny array describing just this node, with the sentinel entry
        // carrying its line/instruction weight.
        let own = [
            CallDepthArrayEntry {
                call_depth: n.payload.call_depth,
                ..Default::default()
            },
            CallDepthArrayEntry {
                call_depth: SENTINEL_DEPTH,
                cumulative_lines: n.payload.trace_file_lines,
                cumulative_insns: 1,
                ..Default::default()
            },
        ];

        let lc_arr = if n.lc != NULL_OFF {
            self.read_depth_array(&self.seqtree.node(&self.arena, n.lc)?.annotation)?
        } else {
            Vec::new()
        };
        let rc_arr = if n.rc != NULL_OFF {
            self.read_depth_array(&self.seqtree.node(&self.arena, n.rc)?.annotation)?
        } else {
            Vec::new()
        };

        let arrays: [&[CallDepthArrayEntry]; 3] = [&own, &lc_arr, &rc_arr];
        let mut index = [0usize; 3];
        let mut merged = Vec::new();
        let mut clines = 0u32;
        let mut cinsns = 0u32;

        loop {
            let mut next_depth = u32::MAX;
            for (i, arr) in arrays.iter().enumerate() {
                if index[i] < arr.len() {
                    next_depth = next_depth.min(arr[index[i]].call_depth);
                }
            }
            if next_depth == u32::MAX {
                break; // all arrays finished
            }

            merged.push(CallDepthArrayEntry {
                call_depth: next_depth,
                cumulative_lines: clines,
                cumulative_insns: cinsns,
                leftlink: index[1] as u32,
                rightlink: index[2] as u32,
            });

            for (i, arr) in arrays.iter().enumerate() {
                if index[i] < arr.len() && arr[index[i]].call_depth == next_depth {
                    if index[i] + 1 < arr.len() {
                        clines +=
                            arr[index[i] + 1].cumulative_lines - arr[index[i]].cumulative_lines;
                        cinsns +=
                            arr[index[i] + 1].cumulative_insns - arr[index[i]].cumulative_insns;
                    }
                    index[i] += 1;
                }
            }
        }

        let array_off = self
            .arena
            .alloc(merged.len() * CallDepthArrayEntry::LEN)?;
        for (i, entry) in merged.iter().enumerate() {
            self.arena
                .put(array_off + (i * CallDepthArrayEntry::LEN) as u64, entry)?;
        }

        n.annotation = SeqOrderAnnotation {
            call_depth_array: array_off,
            call_depth_arraylen: merged.len() as u32,
        };
        self.seqtree.update_node(&mut self.arena, &n)
    }

    fn finalise(&mut self) -> io::Result<()> {
        let callrets: Vec<(u32, i32)> =
            self.found_callrets.iter().map(|(&l, &d)| (l, d)).collect();
        let mut pos = 0usize;
        let mut depth = 0i64;
        let seqroot = self.seqroot;
        self.assign_call_depths(seqroot, &callrets, &mut pos, &mut depth)?;
        self.build_depth_arrays(seqroot)?;

        let mut flags = FLAG_COMPLETE;
        if self.bigend {
            flags |= FLAG_BIGEND;
        }
        if self.aarch64_used {
            flags |= FLAG_AARCH64_USED;
        }
        let header = FileHeader {
            flags,
            seqroot: self.seqroot,
            bypcroot: self.bypcroot,
            lineno_offset: self.lineno_offset,
        };
        self.arena.put(self.header_off, &header)
    }

    fn take_io_error(&mut self) -> io::Result<()> {
        match self.io_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The read loop: feeds the parser line by line, maintaining byte and
    /// line positions, then flushes, post-processes and finalises.
    fn index_trace(&mut self, params: IndexParams) -> Result<()> {
        let file = std::fs::File::open(&self.tarmac_filename)?;
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        self.reporter.indexing_start(total);

        let mut parser = TarmacLineParser::new(ParseParams {
            bigend: params.bigend,
            implicit_thumb: params.implicit_thumb,
        });

        let mut raw = Vec::new();
        let mut pos: u64 = 0;

        loop {
            self.true_lineno += 1;
            if self.seen_any_event {
                self.lineno += 1;
            }

            raw.clear();
            let n = reader.read_until(b'\n', &mut raw)?;
            if n == 0 {
                self.linepos = pos;
                break;
            }

            self.linepos = pos;
            self.reporter.indexing_progress(pos);

            let truncated = !raw.ends_with(b"\n");
            let line = String::from_utf8_lossy(&raw);

            if let Err(e) = parser.parse(&line, self) {
                if truncated {
                    let msg = format!(
                        "{e}\nignoring parse error on partial last line (trace truncated?)"
                    );
                    self.reporter.indexing_warning(
                        &self.tarmac_filename,
                        u64::from(self.lineno + self.lineno_offset),
                        &msg,
                    );
                    break;
                }
                self.reporter.indexing_error(
                    &self.tarmac_filename,
                    u64::from(self.lineno + self.lineno_offset),
                    &e.to_string(),
                );
                self.reporter.indexing_done();
                return Err(Error::Parse(e));
            }
            self.take_io_error()?;

            pos += n as u64;
            if truncated {
                // A parseable line without a newline is still indexed,
                // and is necessarily the last one; count it and stop.
                self.true_lineno += 1;
                if self.seen_any_event {
                    self.lineno += 1;
                }
                self.linepos = pos;
                break;
            }
        }

        self.reporter.indexing_done();

        // Event-less end-of-file marker: flushes the final node exactly
        // as the next timestamp would have.
        self.event_common(None, false)?;

        self.finalise()?;
        Ok(())
    }
}

fn ranges_overlap(a_off: u64, a_size: u64, b_off: u64, b_size: u64) -> bool {
    a_off < b_off + b_size && b_off < a_off + a_size
}

impl ParseReceiver for IndexBuilder<'_> {
    fn got_instruction(&mut self, ev: InstructionEvent) {
        if self.io_error.is_none() {
            if let Err(e) = self.handle_instruction(ev) {
                self.io_error = Some(e);
            }
        }
    }

    fn got_register(&mut self, ev: RegisterEvent) {
        if self.io_error.is_none() {
            if let Err(e) = self.handle_register(ev) {
                self.io_error = Some(e);
            }
        }
    }

    fn got_memory(&mut self, ev: MemoryEvent) {
        if self.io_error.is_none() {
            if let Err(e) = self.handle_memory(ev) {
                self.io_error = Some(e);
            }
        }
    }

    fn got_text(&mut self, ev: TextOnlyEvent) {
        if self.io_error.is_none() {
            if let Err(e) = self.handle_text(&ev) {
                self.io_error = Some(e);
            }
        }
    }

    fn parse_warning(&mut self, msg: &str) -> bool {
        self.reporter.indexing_warning(
            &self.tarmac_filename,
            u64::from(self.lineno + self.lineno_offset),
            msg,
        );
        false
    }
}

/// Indexes `trace.tarmac_filename` into `trace.index_filename`.
///
/// The index is built in a temporary file beside the target and persisted
/// only after a successful finalise, so an error or an interrupted run
/// leaves no partial index behind.
pub fn run_indexer(trace: &TracePair, params: IndexParams, reporter: &dyn Reporter) -> Result<()> {
    let dir = trace
        .index_filename
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    let file = temp.as_file().try_clone()?;

    let arena = Arena::new_on_disk(file);
    let mut builder =
        IndexBuilder::new(arena, params, reporter, trace.tarmac_filename.clone())?;
    builder.index_trace(params)?;
    builder.arena.finish()?;

    temp.persist(&trace.index_filename)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Builds an index entirely in memory, for small traces or environments
/// without writable storage. The returned arena can be handed straight to
/// [`crate::navigator::IndexReader::from_arena`].
pub fn build_in_memory_index(
    tarmac_filename: &Path,
    params: IndexParams,
    reporter: &dyn Reporter,
) -> Result<Arena> {
    let arena = Arena::new_in_memory();
    let mut builder =
        IndexBuilder::new(arena, params, reporter, tarmac_filename.to_path_buf())?;
    builder.index_trace(params)?;
    Ok(builder.arena)
}
